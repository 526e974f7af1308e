use std::path::Path;

use anyhow::bail;
use indoc::indoc;

use crate::Config;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.upstream.url.is_empty() {
        bail!(indoc! {r#"
            No upstream URL configured. Prism requires an upstream generative API to forward requests to.

            Example configuration:

              [upstream]
              url = "http://127.0.0.1:8080"
        "#});
    }

    if !config.upstream.url.starts_with("http://") && !config.upstream.url.starts_with("https://") {
        bail!(
            "Invalid upstream URL '{}': expected an http:// or https:// base URL",
            config.upstream.url
        );
    }

    if config.upstream.url.ends_with('/') {
        bail!(
            "Invalid upstream URL '{}': drop the trailing slash, paths are appended by the gateway",
            config.upstream.url
        );
    }

    if config.credentials.count == 0 {
        bail!("The credential pool cannot be empty: set credentials.count to at least 1");
    }

    Ok(())
}
