use std::time::Duration;

use axum::http;
use reqwest::Client;

/// Overall deadline for upstream generate calls. Token refresh uses a shorter
/// per-request timeout on top of this client.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Idle upstream connections are dropped quickly so that a re-resolved DNS
/// record for the upstream host takes effect on the next request instead of
/// sticking to a stale address for the connection's lifetime.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keepalive interval for the long-lived streaming connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(TCP_KEEPALIVE))
        .default_headers(headers)
}
