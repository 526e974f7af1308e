//! Upstream generative API settings.

use serde::Deserialize;

/// Default upstream base URL, pointing at a locally running mock.
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8080";

/// Upstream generative API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API, without a trailing slash.
    ///
    /// The gateway appends `/v1/models/<model>:generateContent`,
    /// `/v1/models/<model>:streamGenerateContent` and `/oauth2/token` to it.
    pub url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
        }
    }
}
