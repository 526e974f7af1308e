//! Prism configuration structures to map the prism.toml configuration.

#![deny(missing_docs)]

mod credentials;
mod loader;
mod log_config;
mod server;
mod upstream;

use std::path::Path;

use serde::Deserialize;

pub use credentials::CredentialsConfig;
pub use log_config::LogConfig;
pub use server::ServerConfig;
pub use upstream::UpstreamConfig;

/// Main configuration structure for the Prism application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Upstream generative API settings.
    pub upstream: UpstreamConfig,
    /// Credential pool settings.
    pub credentials: CredentialsConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates the configuration before the server starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: None,
            },
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:8080",
            },
            credentials: CredentialsConfig {
                count: 3,
            },
            log: LogConfig {
                filter: "info",
            },
        }
        "#);
    }

    #[test]
    fn full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_address = "0.0.0.0:4000"

            [upstream]
            url = "http://10.0.0.7:9090"

            [credentials]
            count = 16

            [log]
            filter = "gateway=debug"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.server.listen_address,
            Some("0.0.0.0:4000".parse().unwrap())
        );
        assert_eq!(config.upstream.url, "http://10.0.0.7:9090");
        assert_eq!(config.credentials.count, 16);
        assert_eq!(config.log.filter, "gateway=debug");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [server]
            liste_address = "0.0.0.0:4000"
            "#,
        );

        assert!(result.is_err());
    }
}
