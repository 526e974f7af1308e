//! Shared harness for the end-to-end tests: spawns the real server against a
//! programmable mock upstream and drives it over HTTP.

mod upstream;

use std::net::SocketAddr;

use indoc::formatdoc;
use tokio_util::sync::CancellationToken;

pub use upstream::{MockUpstream, final_chunk, text_chunk, unary_body};

/// Test client for making HTTP requests to the test server
#[derive(Clone)]
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
}

impl TestClient {
    /// Create a new test client for the given base URL
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a POST request to the given path with JSON body
    pub async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }
}

/// A running gateway wired to a mock upstream.
pub struct TestGateway {
    pub client: TestClient,
    pub upstream: MockUpstream,
    shutdown: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spawn the server on an ephemeral port with a credential pool of the given
/// size, pointed at a fresh mock upstream.
pub async fn spawn_gateway(credential_count: usize) -> TestGateway {
    let upstream = MockUpstream::spawn().await;

    let config_toml = formatdoc! {r#"
        [upstream]
        url = "{url}"

        [credentials]
        count = {credential_count}
    "#, url = upstream.url()};

    let config: config::Config = toml::from_str(&config_toml).unwrap();

    let listen_address: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (bound_addr_sender, bound_addr_receiver) = tokio::sync::oneshot::channel();
    let shutdown = CancellationToken::new();

    tokio::spawn(server::serve(server::ServeConfig {
        listen_address,
        config,
        shutdown_signal: shutdown.clone(),
        log_filter: "error".to_string(),
        version: "test".to_string(),
        bound_addr_sender: Some(bound_addr_sender),
    }));

    let address = bound_addr_receiver.await.expect("server should report its bound address");

    TestGateway {
        client: TestClient::new(format!("http://{address}")),
        upstream,
        shutdown,
    }
}

/// Extract the payloads of `data:` lines from an SSE response body.
pub fn sse_data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}
