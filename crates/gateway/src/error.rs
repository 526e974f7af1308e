use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No credential in the pool was eligible for the requested model.
    #[error("No credential available for model '{0}'")]
    NoCredential(String),

    /// Upstream rejected the request with a terminal client-error status.
    /// The upstream body is relayed to the caller verbatim.
    #[error("{message}")]
    UpstreamRejected { status: u16, message: String },

    /// Upstream returned a non-retryable, non-terminal status.
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Every attempt failed; the message carries the last upstream text seen.
    #[error("All retries exhausted. Last upstream error: {0}")]
    RetriesExhausted(String),

    /// Network or connection error talking to upstream.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Internal server error.
    /// If Some(message), it came from upstream and can be shown.
    /// If None, it's an internal gateway error and should not leak details.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl GatewayError {
    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoCredential(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Upstream { .. } | Self::RetriesExhausted(_) | Self::Connection(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(upstream_msg)) => upstream_msg.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// The serializable error body, also used for SSE error events once the
    /// response stream is committed.
    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: "gateway_error".to_string(),
                code: self.status_code().as_u16(),
            },
        }
    }
}

/// Error response format compatible with the OpenAI API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.to_body())).into_response()
    }
}
