//! Gemini wire types: the dialect spoken to the upstream generative API.
//!
//! Request shapes follow the GenerateContent API as documented in the
//! [Google AI API Reference](https://ai.google.dev/api/generate-content).

use serde::{Deserialize, Serialize};

/// Request body for the GenerateContent and StreamGenerateContent calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// The conversation so far, oldest first.
    pub contents: Vec<Content>,

    /// Optional system instruction steering the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,

    /// Optional generation parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    /// Functions the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Function calling behavior for the declared tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
}

/// A role-tagged list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// Content role. The upstream dialect only knows these two; system
/// instructions and function responses both travel as "user".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One part of a content. Exactly one of the fields is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    /// A part carrying only text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// The result of executing a function, sent back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

/// Generation parameters. Only options the caller set are serialized; an
/// all-empty config is omitted from the request entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl GenerationConfig {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.max_output_tokens.is_none()
            && self.stop_sequences.is_none()
    }
}

/// Tool block holding the function declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Declaration of a callable function, parameters already sanitized to the
/// restricted schema dialect the upstream accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Function calling behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
    pub mode: FunctionCallingMode,
}

/// Function calling mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionCallingMode {
    /// Model cannot call functions.
    None,
    /// Model decides whether to call functions.
    Auto,
    /// Model must call at least one function.
    Any,
}

/// Response body for both unary responses and streaming chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    /// Concatenated text of every text part across all candidates.
    pub fn concatenated_text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|candidate| candidate.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .filter_map(|part| part.text.as_deref())
            .collect()
    }

    /// Rewrite every text part in place.
    pub fn map_text_parts(&mut self, f: impl Fn(&str) -> String) {
        for candidate in &mut self.candidates {
            if let Some(content) = &mut candidate.content {
                for part in &mut content.parts {
                    if let Some(text) = &mut part.text {
                        *text = f(text);
                    }
                }
            }
        }
    }
}

/// One generated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub index: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    /// Upstream finish reason string, e.g. `STOP` or `MAX_TOKENS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token accounting reported by upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_an_upstream_response() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"Hi"}],"role":"model"},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":1,"totalTokenCount":6}}"#;

        let response: GenerateResponse = sonic_rs::from_str(json).unwrap();

        assert_eq!(response.concatenated_text(), "Hi");
        assert_eq!(response.candidates[0].finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage_metadata.unwrap().prompt_token_count, Some(5));
    }

    #[test]
    fn empty_parts_are_skipped_on_the_wire() {
        let request = GenerateRequest {
            contents: vec![Content {
                role: Role::User,
                parts: vec![Part::text("hello")],
            }],
            system_instruction: None,
            generation_config: None,
            tools: None,
            tool_config: None,
        };

        let json = sonic_rs::to_string(&request).unwrap();
        insta::assert_snapshot!(json, @r#"{"contents":[{"role":"user","parts":[{"text":"hello"}]}]}"#);
    }

    #[test]
    fn map_text_parts_rewrites_every_candidate() {
        let mut response = GenerateResponse {
            candidates: vec![
                Candidate {
                    index: 0,
                    content: Some(Content {
                        role: Role::Model,
                        parts: vec![Part::text("a[done]")],
                    }),
                    finish_reason: None,
                },
                Candidate {
                    index: 1,
                    content: Some(Content {
                        role: Role::Model,
                        parts: vec![Part::text("[done]b")],
                    }),
                    finish_reason: None,
                },
            ],
            usage_metadata: None,
        };

        response.map_text_parts(|text| text.replace("[done]", ""));

        assert_eq!(response.concatenated_text(), "ab");
    }
}
