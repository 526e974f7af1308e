//! Request orchestration: credential acquisition, upstream calls, retry,
//! continuation and response relay for both unary and streaming requests.

use std::{
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use eventsource_stream::Eventsource as _;
use futures::{Stream, StreamExt as _};
use regex::Regex;
use secrecy::ExposeSecret as _;

use crate::{
    credentials::{CredentialPool, Lease},
    error::{GatewayError, GatewayResult},
    messages::{
        convert, gemini,
        openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse},
    },
    usage::UsageAccountant,
};

/// Upstream attempts beyond the first for a unary request, and acquire or
/// stream-open attempts beyond the first per streaming segment.
const MAX_RETRIES: usize = 3;

/// Follow-up upstream streams beyond the first per caller request.
const MAX_CONTINUATIONS: usize = 3;

/// Completion marker the model is instructed to emit. Matching is
/// case-sensitive to avoid false positives from natural prose; the marker is
/// always stripped from text parts before conversion.
const DONE_MARKER: &str = "[done]";

/// Instruction appended to the system instruction before dispatch.
const DONE_INSTRUCTION: &str = "When you have completed your full response, you must output [done] on a separate line at the very end. Only output [done] when your answer is complete.";

/// An element of the caller-facing event stream.
pub enum StreamEvent {
    /// A converted upstream chunk.
    Chunk(ChatCompletionChunk),
    /// The terminal sentinel, rendered as `data: [DONE]`.
    Done,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamEvent>> + Send>>;

/// The request pipeline. One instance serves every in-flight request.
pub struct Pipeline {
    client: reqwest::Client,
    base_url: String,
    pool: Arc<CredentialPool>,
    usage: Arc<UsageAccountant>,
    request_counter: AtomicU64,
}

impl Pipeline {
    pub fn new(
        base_url: String,
        client: reqwest::Client,
        pool: Arc<CredentialPool>,
        usage: Arc<UsageAccountant>,
    ) -> Self {
        Self {
            client,
            base_url,
            pool,
            usage,
            request_counter: AtomicU64::new(0),
        }
    }

    fn next_request_id(&self) -> String {
        let serial = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("chatcmpl-{serial}")
    }

    /// Process a unary chat completion request.
    pub async fn chat_completion(&self, request: ChatCompletionRequest) -> GatewayResult<ChatCompletionResponse> {
        let model = request.model.clone();
        let estimated_input = UsageAccountant::estimate_request_input_tokens(&request);

        let mut upstream_request = gemini::GenerateRequest::from(request);
        inject_done_instruction(&mut upstream_request);

        let url = format!("{}/v1/models/{}:generateContent", self.base_url, model);
        let body = sonic_rs::to_vec(&upstream_request).map_err(|error| {
            log::error!("Failed to serialize upstream request: {error}");
            GatewayError::Internal(None)
        })?;

        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            let lease = match self.pool.acquire(&model).await {
                Ok(lease) => lease,
                Err(error) => {
                    log::debug!("Credential acquisition failed on attempt {attempt}: {error}");
                    last_error = error.to_string();
                    continue;
                }
            };

            let result = self
                .client
                .post(&url)
                .header(http::header::CONTENT_TYPE, "application/json")
                .bearer_auth(lease.token().expose_secret())
                .body(body.clone())
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    log::warn!("Upstream request failed: {error}");
                    last_error = error.to_string();
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();

            if response.status().is_success() {
                let text = response.text().await.map_err(|error| {
                    log::error!("Failed to read upstream response body: {error}");
                    GatewayError::Internal(None)
                })?;

                let mut generated: gemini::GenerateResponse = sonic_rs::from_str(&text).map_err(|error| {
                    log::error!("Failed to parse upstream response: {error}");
                    GatewayError::Internal(None)
                })?;

                generated.map_text_parts(|part| part.replace(DONE_MARKER, ""));

                let output_tokens = generated
                    .usage_metadata
                    .and_then(|metadata| metadata.candidates_token_count)
                    .unwrap_or_default() as u64;

                let converted = convert::to_chat_response(generated, &model, self.next_request_id(), unix_now());

                self.usage.record(lease.id(), &model, estimated_input, output_tokens);

                return Ok(converted);
            }

            let text = response.text().await.unwrap_or_default();
            log::warn!("Upstream returned status {status}: {text}");

            match status {
                429 | 503 => {
                    let cooldown = parse_cooldown_seconds(&text);
                    self.pool.record_error(&lease.credential, status, &model, cooldown).await;
                    last_error = text;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                400 | 403 => {
                    self.pool.record_error(&lease.credential, status, &model, 0).await;
                    return Err(GatewayError::UpstreamRejected { status, message: text });
                }
                _ => return Err(GatewayError::Upstream { status, message: text }),
            }
        }

        Err(GatewayError::RetriesExhausted(last_error))
    }

    /// Process a streaming chat completion request.
    ///
    /// The returned stream is pull-driven: the next upstream chunk is only
    /// read once the caller has consumed the previous event, so the caller's
    /// write rate bounds the upstream drain rate. When the upstream stream
    /// ends without the completion marker, a continuation request supplies
    /// the collected text and asks for the remainder, up to
    /// [`MAX_CONTINUATIONS`] times.
    pub fn chat_completion_stream(self: Arc<Self>, request: ChatCompletionRequest) -> ChatStream {
        Box::pin(async_stream::stream! {
            let model = request.model.clone();
            let estimated_input = UsageAccountant::estimate_request_input_tokens(&request);
            let id = self.next_request_id();
            let created = unix_now();

            let mut upstream_request = gemini::GenerateRequest::from(request);
            inject_done_instruction(&mut upstream_request);

            let url = format!("{}/v1/models/{}:streamGenerateContent", self.base_url, model);

            let mut lease: Option<Lease> = None;
            let mut collected_text = String::new();
            let mut last_output_tokens: u64 = 0;

            'relay: {
                for continuation in 0..=MAX_CONTINUATIONS {
                    // The first segment acquires a credential; follow-ups
                    // reuse the one that carried the previous segment.
                    if lease.is_none() {
                        for attempt in 0..=MAX_RETRIES {
                            match self.pool.acquire(&model).await {
                                Ok(acquired) => {
                                    lease = Some(acquired);
                                    break;
                                }
                                Err(error) => {
                                    log::debug!("Credential acquisition failed on attempt {attempt}: {error}");
                                    tokio::time::sleep(backoff_delay(attempt)).await;
                                }
                            }
                        }

                        if lease.is_none() {
                            yield Err(GatewayError::NoCredential(model.clone()));
                            break 'relay;
                        }
                    }

                    let segment_request = if continuation == 0 {
                        upstream_request.clone()
                    } else {
                        build_continuation(&upstream_request, &collected_text)
                    };

                    let body = match sonic_rs::to_vec(&segment_request) {
                        Ok(body) => body,
                        Err(error) => {
                            log::error!("Failed to serialize upstream request: {error}");
                            yield Err(GatewayError::Internal(None));
                            break 'relay;
                        }
                    };

                    // Open the upstream stream, swapping to a different
                    // credential on rate and overload statuses.
                    let mut response = None;
                    let mut open_error = GatewayError::RetriesExhausted(String::new());

                    for attempt in 0..=MAX_RETRIES {
                        let Some(current) = lease.clone() else { break };

                        let result = self
                            .client
                            .post(&url)
                            .header(http::header::CONTENT_TYPE, "application/json")
                            .bearer_auth(current.token().expose_secret())
                            .body(body.clone())
                            .send()
                            .await;

                        let upstream = match result {
                            Ok(upstream) => upstream,
                            Err(error) => {
                                log::warn!("Upstream stream request failed: {error}");
                                open_error = GatewayError::Connection(error.to_string());
                                tokio::time::sleep(backoff_delay(attempt)).await;
                                continue;
                            }
                        };

                        let status = upstream.status().as_u16();

                        if upstream.status().is_success() {
                            response = Some(upstream);
                            break;
                        }

                        let text = upstream.text().await.unwrap_or_default();
                        log::warn!("Upstream stream returned status {status}: {text}");

                        match status {
                            429 | 503 => {
                                let cooldown = parse_cooldown_seconds(&text);
                                self.pool.record_error(&current.credential, status, &model, cooldown).await;

                                if let Ok(swapped) = self.pool.acquire_excluding(&model, Some(current.id())).await {
                                    lease = Some(swapped);
                                }

                                open_error = GatewayError::RetriesExhausted(text);
                                tokio::time::sleep(backoff_delay(attempt)).await;
                            }
                            400 | 403 => {
                                self.pool.record_error(&current.credential, status, &model, 0).await;
                                yield Err(GatewayError::UpstreamRejected { status, message: text });
                                break 'relay;
                            }
                            _ => {
                                yield Err(GatewayError::Upstream { status, message: text });
                                break 'relay;
                            }
                        }
                    }

                    let Some(response) = response else {
                        yield Err(open_error);
                        break 'relay;
                    };

                    // Drain the segment line by line. Undecodable lines are
                    // skipped individually.
                    let mut events = response.bytes_stream().eventsource();
                    let mut found_done = false;

                    while let Some(event) = events.next().await {
                        let Ok(event) = event else {
                            log::debug!("Ignoring malformed upstream stream event");
                            continue;
                        };

                        let Ok(mut chunk) = sonic_rs::from_str::<gemini::GenerateResponse>(&event.data) else {
                            log::debug!("Skipping undecodable upstream chunk: {}", event.data);
                            continue;
                        };

                        let chunk_text = chunk.concatenated_text();

                        if chunk_text.contains(DONE_MARKER) {
                            found_done = true;
                        }

                        chunk.map_text_parts(|part| part.replace(DONE_MARKER, ""));
                        collected_text.push_str(&chunk_text.replace(DONE_MARKER, ""));

                        if let Some(metadata) = &chunk.usage_metadata {
                            last_output_tokens = metadata.candidates_token_count.unwrap_or_default() as u64;
                        }

                        yield Ok(StreamEvent::Chunk(convert::to_chat_chunk(chunk, &model, &id, created)));
                    }

                    if found_done {
                        break;
                    }

                    log::debug!(
                        "Upstream stream ended without the completion marker after {} chars, continuing (segment {})",
                        collected_text.len(),
                        continuation + 1
                    );
                }

                yield Ok(StreamEvent::Done);
            }

            if let Some(lease) = &lease {
                self.usage.record(lease.id(), &model, estimated_input, last_output_tokens);
            }
        })
    }
}

/// Append the completion-marker instruction to the system instruction,
/// synthesizing one when the request has none.
fn inject_done_instruction(request: &mut gemini::GenerateRequest) {
    match &mut request.system_instruction {
        Some(content) if !content.parts.is_empty() => {
            if let Some(text) = content.parts[0].text.as_mut() {
                text.push_str("\n\n");
                text.push_str(DONE_INSTRUCTION);
            } else {
                content.parts.push(gemini::Part::text(DONE_INSTRUCTION));
            }
        }
        _ => {
            request.system_instruction = Some(gemini::Content {
                role: gemini::Role::User,
                parts: vec![gemini::Part::text(DONE_INSTRUCTION)],
            });
        }
    }
}

/// Build a continuation request: the original request plus the collected
/// output as a model message and a literal continue prompt.
fn build_continuation(original: &gemini::GenerateRequest, collected_text: &str) -> gemini::GenerateRequest {
    let mut request = original.clone();

    let char_count = collected_text.chars().count();
    let tail_start = collected_text
        .char_indices()
        .rev()
        .nth(99)
        .map(|(index, _)| index)
        .unwrap_or(0);
    let tail = &collected_text[tail_start..];

    request.contents.push(gemini::Content {
        role: gemini::Role::Model,
        parts: vec![gemini::Part::text(collected_text)],
    });

    request.contents.push(gemini::Content {
        role: gemini::Role::User,
        parts: vec![gemini::Part::text(format!(
            "Continue from where you left off. You have already output approximately {char_count} characters ending with:\n\"...{tail}\"\n\nContinue:"
        ))],
    });

    request
}

/// Extract a retry hint from an upstream error body, zero when absent.
fn parse_cooldown_seconds(body: &str) -> u64 {
    static PATTERN: OnceLock<Regex> = OnceLock::new();

    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:try again in|retry after|wait)\s+(\d+)\s*(?:seconds?|s)").expect("cooldown pattern is valid")
    });

    pattern
        .captures(body)
        .and_then(|captures| captures.get(1))
        .and_then(|seconds| seconds.as_str().parse().ok())
        .unwrap_or(0)
}

fn backoff_delay(attempt: usize) -> Duration {
    Duration::from_millis(100 << attempt)
}

fn unix_now() -> u64 {
    jiff::Timestamp::now().as_second().max(0) as u64
}
