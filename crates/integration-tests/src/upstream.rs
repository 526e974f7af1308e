//! A programmable mock of the upstream generative API.
//!
//! Serves the three endpoints the gateway talks to: unary generation,
//! streaming generation and token refresh. Tests queue planned responses and
//! inspect the request bodies the gateway sent.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
    routing::post,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// One planned streaming response.
enum StreamScript {
    /// Emit these chunks as `data:` lines and end the stream.
    Chunks(Vec<String>),
    /// Fail the stream open with this status and body.
    Error { status: u16, body: String },
}

#[derive(Default)]
struct UpstreamInner {
    unary_responses: VecDeque<(u16, String)>,
    stream_scripts: VecDeque<StreamScript>,
    refresh_statuses: VecDeque<u16>,
    refresh_calls: u64,
    generate_requests: Vec<Value>,
    stream_requests: Vec<Value>,
}

/// Handle to a running mock upstream.
#[derive(Clone)]
pub struct MockUpstream {
    address: SocketAddr,
    inner: Arc<Mutex<UpstreamInner>>,
}

impl MockUpstream {
    /// Bind the mock on an ephemeral port and serve it in the background.
    pub async fn spawn() -> Self {
        let inner = Arc::new(Mutex::new(UpstreamInner::default()));

        let app = Router::new()
            .route("/v1/models/{action}", post(model_action))
            .route("/oauth2/token", post(refresh_token))
            .with_state(inner.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { address, inner }
    }

    /// Base URL of the mock, without a trailing slash.
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UpstreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a unary generation response.
    pub fn queue_generate(&self, status: u16, body: impl Into<String>) {
        self.lock().unary_responses.push_back((status, body.into()));
    }

    /// Queue a streaming response emitting these chunks.
    pub fn queue_stream_chunks(&self, chunks: Vec<Value>) {
        let lines = chunks.into_iter().map(|chunk| chunk.to_string()).collect();
        self.lock().stream_scripts.push_back(StreamScript::Chunks(lines));
    }

    /// Queue a failed stream open.
    pub fn queue_stream_error(&self, status: u16, body: impl Into<String>) {
        self.lock().stream_scripts.push_back(StreamScript::Error {
            status,
            body: body.into(),
        });
    }

    /// Queue a refresh response status. Later refresh calls default to a
    /// successful rotation.
    pub fn queue_refresh(&self, status: u16) {
        self.lock().refresh_statuses.push_back(status);
    }

    /// Bodies the gateway posted to the unary endpoint, oldest first.
    pub fn generate_requests(&self) -> Vec<Value> {
        self.lock().generate_requests.clone()
    }

    /// Bodies the gateway posted to the streaming endpoint, oldest first.
    pub fn stream_requests(&self) -> Vec<Value> {
        self.lock().stream_requests.clone()
    }

    /// Number of token refresh calls observed.
    pub fn refresh_calls(&self) -> u64 {
        self.lock().refresh_calls
    }
}

/// An upstream chunk carrying one text part.
pub fn text_chunk(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }], "role": "model" },
            "index": 0
        }]
    })
}

/// A terminal upstream chunk with a finish reason and usage metadata.
pub fn final_chunk(text: &str, output_tokens: u32) -> Value {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }], "role": "model" },
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {
            "promptTokenCount": 5,
            "candidatesTokenCount": output_tokens,
            "totalTokenCount": 5 + output_tokens
        }
    })
}

/// A complete unary response body with the given text.
pub fn unary_body(text: &str) -> String {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }], "role": "model" },
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 1, "totalTokenCount": 6 }
    })
    .to_string()
}

async fn model_action(
    State(inner): State<Arc<Mutex<UpstreamInner>>>,
    Path(action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);

    if action.ends_with(":generateContent") {
        inner.generate_requests.push(body);

        let (status, body) = inner
            .unary_responses
            .pop_front()
            .unwrap_or_else(|| (200, unary_body("ok[done]")));

        return Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
    }

    if action.ends_with(":streamGenerateContent") {
        inner.stream_requests.push(body);

        let script = inner
            .stream_scripts
            .pop_front()
            .unwrap_or_else(|| StreamScript::Chunks(vec![text_chunk("ok[done]").to_string()]));

        return match script {
            StreamScript::Chunks(lines) => {
                let mut body = String::new();

                for line in lines {
                    body.push_str("data: ");
                    body.push_str(&line);
                    body.push_str("\n\n");
                }

                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .body(Body::from(body))
                    .unwrap()
            }
            StreamScript::Error { status, body } => Response::builder()
                .status(StatusCode::from_u16(status).unwrap())
                .body(Body::from(body))
                .unwrap(),
        };
    }

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("unknown model action"))
        .unwrap()
}

async fn refresh_token(State(inner): State<Arc<Mutex<UpstreamInner>>>) -> Response {
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.refresh_calls += 1;

    let status = inner.refresh_statuses.pop_front().unwrap_or(200);

    if status == 200 {
        let body = json!({
            "access_token": format!("rotated_token_{}", inner.refresh_calls),
            "expires_in": 3600,
            "token_type": "Bearer"
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::from_u16(status).unwrap())
            .body(Body::from("refresh rejected"))
            .unwrap()
    }
}
