//! Credential pool settings.

use serde::Deserialize;

fn default_count() -> usize {
    3
}

/// Credential pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Number of credentials materialized at startup. The pool size is fixed
    /// for the process lifetime.
    pub count: usize,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
        }
    }
}
