//! OpenAI-compatible gateway core in front of a Gemini-style generative API.
//!
//! The router exposes the chat completion, model listing and metrics
//! endpoints; the pipeline underneath handles credential rotation, retry and
//! stream continuation against the upstream.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt as _;
use serde::Serialize;

mod error;
mod http_client;
pub mod messages;
pub mod pipeline;

pub mod credentials;
pub mod schema;
pub mod usage;

pub use error::{GatewayError, GatewayResult as Result};
pub use pipeline::{Pipeline, StreamEvent};

use credentials::{CredentialPool, CredentialStats};
use messages::openai::{ChatCompletionRequest, Model, ModelsResponse, ObjectType};
use usage::{UsageAccountant, UsageSummary};

/// Model identifiers advertised on `GET /v1/models`.
const ADVERTISED_MODELS: [&str; 3] = ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.0-flash"];

struct Gateway {
    pipeline: Arc<Pipeline>,
    pool: Arc<CredentialPool>,
    usage: Arc<UsageAccountant>,
}

/// Creates the axum router for the gateway endpoints.
pub fn router(config: &config::Config) -> anyhow::Result<Router> {
    let client = http_client::default_http_client_builder()
        .build()
        .map_err(|error| anyhow::anyhow!("Failed to create upstream HTTP client: {error}"))?;

    let refresh_url = format!("{}/oauth2/token", config.upstream.url);
    let pool = Arc::new(CredentialPool::new(config.credentials.count, refresh_url, client.clone()));
    let usage = Arc::new(UsageAccountant::default());

    let pipeline = Arc::new(Pipeline::new(
        config.upstream.url.clone(),
        client,
        pool.clone(),
        usage.clone(),
    ));

    let gateway = Arc::new(Gateway { pipeline, pool, usage });

    Ok(Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/metrics", get(metrics))
        .with_state(gateway))
}

/// Handle chat completion requests.
///
/// This endpoint supports both streaming and non-streaming responses. When
/// `stream: true` is set in the request, the response is sent as Server-Sent
/// Events terminated by a `[DONE]` sentinel. Otherwise a standard JSON
/// response is returned.
async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    Sonic(request): Sonic<ChatCompletionRequest>,
) -> Result<Response> {
    log::debug!("Chat completions handler called for model: {}", request.model);
    log::debug!("Request has {} messages", request.messages.len());

    if request.stream.unwrap_or(false) {
        let stream = gateway.pipeline.clone().chat_completion_stream(request);

        let event_stream = stream.map(|result| {
            let event = match result {
                Ok(StreamEvent::Chunk(chunk)) => {
                    let json = sonic_rs::to_string(&chunk).unwrap_or_else(|error| {
                        log::error!("Failed to serialize chunk: {error}");
                        r#"{"error":"serialization failed"}"#.to_string()
                    });

                    Event::default().data(json)
                }
                Ok(StreamEvent::Done) => Event::default().data("[DONE]"),
                Err(error) => {
                    log::error!("Stream error: {error}");

                    let json = sonic_rs::to_string(&error.to_body())
                        .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string());

                    Event::default().data(json)
                }
            };

            Ok::<_, Infallible>(event)
        });

        let mut response = Sse::new(event_stream).into_response();

        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

        log::debug!("Returning streaming response");
        Ok(response)
    } else {
        let response = gateway.pipeline.chat_completion(request).await?;

        log::debug!(
            "Chat completion successful, returning response with {} choices",
            response.choices.len()
        );

        Ok(Json(response).into_response())
    }
}

/// Handle list models requests. The list is static: the upstream dialect
/// serves these three models.
async fn list_models() -> Json<ModelsResponse> {
    let data = ADVERTISED_MODELS
        .iter()
        .map(|id| Model {
            id: (*id).to_string(),
            object: ObjectType::Model,
            created: 0,
            owned_by: "google".to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: ObjectType::List,
        data,
    })
}

#[derive(Serialize)]
struct MetricsResponse {
    tokens: UsageSummary,
    credentials: Vec<CredentialStats>,
}

/// Handle metrics requests: the usage summary plus one stats entry per
/// credential.
async fn metrics(State(gateway): State<Arc<Gateway>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        tokens: gateway.usage.summary(),
        credentials: gateway.pool.stats().await,
    })
}
