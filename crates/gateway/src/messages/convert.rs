//! Conversions between the caller's OpenAI dialect and the upstream Gemini
//! dialect, for requests, unary responses and streaming chunks.

use serde_json::Value;

use crate::{
    messages::{gemini, openai},
    schema,
};

impl From<openai::ChatCompletionRequest> for gemini::GenerateRequest {
    fn from(request: openai::ChatCompletionRequest) -> Self {
        let tools = request.tools.map(|tools| {
            let function_declarations = tools
                .into_iter()
                .map(|tool| gemini::FunctionDeclaration {
                    name: tool.function.name,
                    description: tool.function.description,
                    parameters: tool.function.parameters.as_ref().map(schema::sanitize),
                })
                .collect();

            vec![gemini::Tool { function_declarations }]
        });

        let tool_config = request.tool_choice.map(|choice| gemini::ToolConfig {
            function_calling_config: gemini::FunctionCallingConfig {
                mode: gemini::FunctionCallingMode::from(choice),
            },
        });

        let mut contents = Vec::new();
        let mut system_instruction = None;

        for message in request.messages {
            match message.role {
                openai::ChatRole::System => {
                    let text = message.content.map(|c| c.flatten()).unwrap_or_default();

                    system_instruction = Some(gemini::Content {
                        // System instructions travel with the "user" role label.
                        role: gemini::Role::User,
                        parts: vec![gemini::Part::text(text)],
                    });
                }
                openai::ChatRole::Assistant => {
                    let mut parts = Vec::new();

                    let text = message.content.map(|c| c.flatten()).unwrap_or_default();
                    if !text.is_empty() {
                        parts.push(gemini::Part::text(text));
                    }

                    for call in message.tool_calls.into_iter().flatten() {
                        // Malformed argument strings degrade to an empty object.
                        let args = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| Value::Object(Default::default()));

                        parts.push(gemini::Part {
                            function_call: Some(gemini::FunctionCall {
                                name: call.function.name,
                                args,
                            }),
                            ..Default::default()
                        });
                    }

                    if !parts.is_empty() {
                        contents.push(gemini::Content {
                            role: gemini::Role::Model,
                            parts,
                        });
                    }
                }
                openai::ChatRole::Tool => {
                    let payload = message.content.map(|c| c.flatten()).unwrap_or_default();

                    let response = serde_json::from_str(&payload)
                        .unwrap_or_else(|_| serde_json::json!({ "result": payload }));

                    contents.push(gemini::Content {
                        role: gemini::Role::User,
                        parts: vec![gemini::Part {
                            function_response: Some(gemini::FunctionResponse {
                                name: message.name.unwrap_or_default(),
                                response,
                            }),
                            ..Default::default()
                        }],
                    });
                }
                openai::ChatRole::User => {
                    let text = message.content.map(|c| c.flatten()).unwrap_or_default();

                    contents.push(gemini::Content {
                        role: gemini::Role::User,
                        parts: vec![gemini::Part::text(text)],
                    });
                }
                openai::ChatRole::Other(role) => {
                    log::warn!("Unknown chat role from request: {role}, treating as user");

                    let text = message.content.map(|c| c.flatten()).unwrap_or_default();

                    contents.push(gemini::Content {
                        role: gemini::Role::User,
                        parts: vec![gemini::Part::text(text)],
                    });
                }
            }
        }

        let generation_config = gemini::GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_tokens,
            stop_sequences: request.stop,
        };

        Self {
            contents,
            system_instruction,
            generation_config: (!generation_config.is_empty()).then_some(generation_config),
            tools,
            tool_config,
        }
    }
}

impl From<openai::ToolChoice> for gemini::FunctionCallingMode {
    fn from(choice: openai::ToolChoice) -> Self {
        match choice {
            openai::ToolChoice::Mode(openai::ToolChoiceMode::None) => gemini::FunctionCallingMode::None,
            openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto) => gemini::FunctionCallingMode::Auto,
            openai::ToolChoice::Mode(openai::ToolChoiceMode::Required) => gemini::FunctionCallingMode::Any,
            // Unknown mode strings degrade to auto.
            openai::ToolChoice::Mode(openai::ToolChoiceMode::Other(_)) => gemini::FunctionCallingMode::Auto,
            // A structured choice demands a call.
            openai::ToolChoice::Specific { .. } => gemini::FunctionCallingMode::Any,
        }
    }
}

/// Convert an upstream unary response into the caller's response envelope.
pub(crate) fn to_chat_response(
    response: gemini::GenerateResponse,
    model: &str,
    id: String,
    created: u64,
) -> openai::ChatCompletionResponse {
    let usage = response.usage_metadata.map(usage_from_metadata);

    let choices = response
        .candidates
        .into_iter()
        .map(|candidate| {
            let (content, tool_calls) = split_candidate_parts(candidate.content);

            openai::ChatChoice {
                index: candidate.index,
                message: openai::ChatMessage {
                    role: openai::ChatRole::Assistant,
                    content: content.map(openai::MessageContent::Text),
                    name: None,
                    tool_calls,
                    tool_call_id: None,
                },
                finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
            }
        })
        .collect();

    openai::ChatCompletionResponse {
        id,
        object: openai::ObjectType::ChatCompletion,
        created,
        model: model.to_string(),
        choices,
        usage,
    }
}

/// Convert an upstream streaming chunk. Identical to the unary conversion
/// except the per-choice field is a delta and the envelope object differs.
pub(crate) fn to_chat_chunk(
    response: gemini::GenerateResponse,
    model: &str,
    id: &str,
    created: u64,
) -> openai::ChatCompletionChunk {
    let usage = response.usage_metadata.map(usage_from_metadata);

    let choices = response
        .candidates
        .into_iter()
        .map(|candidate| {
            let (content, tool_calls) = split_candidate_parts(candidate.content);

            openai::ChatChoiceDelta {
                index: candidate.index,
                delta: openai::ChatMessageDelta {
                    role: Some(openai::ChatRole::Assistant),
                    content,
                    tool_calls,
                },
                finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
            }
        })
        .collect();

    openai::ChatCompletionChunk {
        id: id.to_string(),
        object: openai::ObjectType::ChatCompletionChunk,
        created,
        model: model.to_string(),
        choices,
        usage,
    }
}

/// Split a candidate's parts into concatenated text (None when the candidate
/// carries no text parts at all) and converted tool calls.
fn split_candidate_parts(content: Option<gemini::Content>) -> (Option<String>, Option<Vec<openai::ToolCall>>) {
    let mut text: Option<String> = None;
    let mut tool_calls = Vec::new();

    for part in content.into_iter().flat_map(|content| content.parts) {
        if let Some(part_text) = part.text {
            text.get_or_insert_with(String::new).push_str(&part_text);
        }

        if let Some(call) = part.function_call {
            let arguments =
                serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());

            tool_calls.push(openai::ToolCall {
                id: format!("call_{}", call.name),
                tool_type: openai::ToolCallType::Function,
                function: openai::FunctionCall {
                    name: call.name,
                    arguments,
                },
            });
        }
    }

    (text, (!tool_calls.is_empty()).then_some(tool_calls))
}

fn map_finish_reason(reason: Option<&str>) -> Option<openai::FinishReason> {
    match reason {
        None | Some("") => None,
        Some("STOP") => Some(openai::FinishReason::Stop),
        Some("MAX_TOKENS") => Some(openai::FinishReason::Length),
        Some("SAFETY") | Some("RECITATION") => Some(openai::FinishReason::ContentFilter),
        Some(_) => Some(openai::FinishReason::Stop),
    }
}

fn usage_from_metadata(metadata: gemini::UsageMetadata) -> openai::Usage {
    openai::Usage {
        prompt_tokens: metadata.prompt_token_count.unwrap_or_default(),
        completion_tokens: metadata.candidates_token_count.unwrap_or_default(),
        total_tokens: metadata.total_token_count.unwrap_or_default(),
    }
}
