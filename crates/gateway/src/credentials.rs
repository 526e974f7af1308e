//! Process-resident credential pool.
//!
//! Each credential holds a short-lived bearer token, a per-model cooldown map
//! and lifetime counters. The pool owns a stable list of credentials for the
//! process lifetime; mutation goes through a per-credential lock so
//! operations on distinct credentials never contend.

use std::{collections::HashMap, sync::Arc, time::Duration};

use jiff::{SignedDuration, Timestamp};
use rand::{Rng as _, seq::IndexedRandom as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// A credential expiring within this window is refreshed before it is handed
/// out.
const REFRESH_THRESHOLD: SignedDuration = SignedDuration::from_secs(120);

/// Token refresh deadline, much shorter than the generate-call deadline.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor applied to every cooldown an upstream error produces.
const MIN_COOLDOWN_SECONDS: u64 = 30;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every credential is disabled, cooling down, or excluded.
    #[error("no eligible credential for model '{0}'")]
    NoCredential(String),

    /// The selected credential needed a refresh and the refresh failed.
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// Refresh endpoint rejected the credential; it is now disabled for the
    /// process lifetime.
    #[error("token refresh rejected with status {0}, credential disabled")]
    Permanent(u16),

    /// Transient refresh failure; the credential stays usable and the caller
    /// may retry acquisition.
    #[error("token refresh failed: {0}")]
    Temporary(String),
}

/// A single pool entry. The identifier is immutable; everything else lives
/// behind the per-credential lock.
#[derive(Debug)]
pub struct Credential {
    id: String,
    state: Mutex<CredentialState>,
}

#[derive(Debug)]
struct CredentialState {
    access_token: SecretString,
    refresh_token: SecretString,
    expires_at: Timestamp,
    disabled: bool,
    cooldowns: HashMap<String, Timestamp>,
    call_count: u64,
    error_count: u64,
}

impl Credential {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl CredentialState {
    fn is_eligible(&self, model: &str, now: Timestamp) -> bool {
        if self.disabled {
            return false;
        }

        self.cooldowns.get(model).is_none_or(|until| *until <= now)
    }
}

/// A successfully acquired credential: the pool entry plus a snapshot of its
/// bearer token taken after any refresh.
#[derive(Clone, Debug)]
pub struct Lease {
    pub credential: Arc<Credential>,
    token: SecretString,
}

impl Lease {
    pub fn id(&self) -> &str {
        self.credential.id()
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }
}

/// Snapshot entry returned by [`CredentialPool::stats`].
#[derive(Debug, Serialize)]
pub struct CredentialStats {
    pub id: String,
    pub disabled: bool,
    pub call_count: u64,
    pub error_count: u64,
    /// ISO-8601 expiry instant.
    pub expires_at: String,
    /// Number of models currently carrying a cooldown entry.
    pub cooldowns: usize,
}

/// The pool itself. The credential list is fixed at construction.
pub struct CredentialPool {
    credentials: Vec<Arc<Credential>>,
    refresh_url: String,
    client: reqwest::Client,
}

impl CredentialPool {
    /// Materialize `count` credentials with mock bearer values and expiries
    /// uniformly random in [60s, 3600s] from now.
    pub fn new(count: usize, refresh_url: String, client: reqwest::Client) -> Self {
        let mut rng = rand::rng();
        let now = Timestamp::now();

        let credentials = (1..=count)
            .map(|index| {
                let id = format!("cred_{index:03}");
                let expires_at = now
                    .saturating_add(SignedDuration::from_secs(rng.random_range(60..=3600)))
                    .expect("bounded duration stays within timestamp range");

                Arc::new(Credential {
                    state: Mutex::new(CredentialState {
                        access_token: SecretString::from(format!("mock_access_{id}")),
                        refresh_token: SecretString::from(format!("mock_refresh_{id}")),
                        expires_at,
                        disabled: false,
                        cooldowns: HashMap::new(),
                        call_count: 0,
                        error_count: 0,
                    }),
                    id,
                })
            })
            .collect();

        Self {
            credentials,
            refresh_url,
            client,
        }
    }

    /// Pick an eligible credential for `model` uniformly at random, refreshing
    /// it first when its token is about to expire.
    pub async fn acquire(&self, model: &str) -> Result<Lease, PoolError> {
        self.acquire_excluding(model, None).await
    }

    /// Same as [`acquire`](Self::acquire), additionally ruling out the given
    /// credential identifier.
    pub async fn acquire_excluding(&self, model: &str, excluded: Option<&str>) -> Result<Lease, PoolError> {
        let now = Timestamp::now();
        let mut eligible = Vec::new();

        for credential in &self.credentials {
            if Some(credential.id()) == excluded {
                continue;
            }

            let state = credential.state.lock().await;

            if state.is_eligible(model, now) {
                eligible.push(credential.clone());
            }
        }

        let Some(chosen) = eligible.choose(&mut rand::rng()).cloned() else {
            return Err(PoolError::NoCredential(model.to_string()));
        };

        let mut state = chosen.state.lock().await;

        // Another task may have disabled or cooled the credential between the
        // eligibility scan and this lock.
        if !state.is_eligible(model, now) {
            return Err(PoolError::NoCredential(model.to_string()));
        }

        if state.expires_at
            <= now
                .saturating_add(REFRESH_THRESHOLD)
                .expect("bounded duration stays within timestamp range")
        {
            self.refresh_locked(chosen.id(), &mut state).await?;
        }

        state.call_count += 1;
        let token = state.access_token.clone();
        drop(state);

        Ok(Lease {
            credential: chosen,
            token,
        })
    }

    /// Record an upstream error against a credential. Rate and overload
    /// statuses put the credential on a per-model cooldown; client-side
    /// rejections disable it for the process lifetime.
    pub async fn record_error(&self, credential: &Credential, status: u16, model: &str, cooldown_seconds: u64) {
        let mut state = credential.state.lock().await;
        state.error_count += 1;

        match status {
            429 | 503 => {
                let seconds = cooldown_seconds.max(MIN_COOLDOWN_SECONDS);
                let until = Timestamp::now()
                    .saturating_add(SignedDuration::from_secs(seconds as i64))
                    .expect("bounded duration stays within timestamp range");

                log::debug!(
                    "Credential {} cooling down for model '{model}' until {until} after status {status}",
                    credential.id()
                );

                state.cooldowns.insert(model.to_string(), until);
            }
            400 | 403 => {
                log::warn!(
                    "Credential {} permanently disabled after upstream status {status}",
                    credential.id()
                );

                state.disabled = true;
            }
            _ => {}
        }
    }

    /// Refresh a credential's bearer token.
    pub async fn refresh(&self, credential: &Credential) -> Result<(), RefreshError> {
        let mut state = credential.state.lock().await;
        self.refresh_locked(credential.id(), &mut state).await
    }

    async fn refresh_locked(&self, id: &str, state: &mut CredentialState) -> Result<(), RefreshError> {
        log::debug!("Refreshing token for credential {id}");

        let response = self
            .client
            .post(&self.refresh_url)
            .timeout(REFRESH_TIMEOUT)
            .bearer_auth(state.refresh_token.expose_secret())
            .send()
            .await
            .map_err(|error| RefreshError::Temporary(format!("refresh request failed: {error}")))?;

        let status = response.status();

        if status.is_success() {
            #[derive(Deserialize)]
            struct RefreshResponse {
                access_token: Option<String>,
                expires_in: i64,
            }

            let body: RefreshResponse = response
                .json()
                .await
                .map_err(|error| RefreshError::Temporary(format!("malformed refresh response: {error}")))?;

            if let Some(token) = body.access_token {
                state.access_token = SecretString::from(token);
            }

            // The expiry only ever advances.
            let refreshed = Timestamp::now()
                .saturating_add(SignedDuration::from_secs(body.expires_in))
                .expect("bounded duration stays within timestamp range");
            state.expires_at = state.expires_at.max(refreshed);

            return Ok(());
        }

        if matches!(status.as_u16(), 400 | 401 | 403) {
            log::warn!("Credential {id} permanently disabled after refresh status {status}");
            state.disabled = true;

            return Err(RefreshError::Permanent(status.as_u16()));
        }

        Err(RefreshError::Temporary(format!("refresh returned status {status}")))
    }

    /// Snapshot of every credential, one entry per pool slot.
    pub async fn stats(&self) -> Vec<CredentialStats> {
        let mut stats = Vec::with_capacity(self.credentials.len());

        for credential in &self.credentials {
            let state = credential.state.lock().await;

            stats.push(CredentialStats {
                id: credential.id().to_string(),
                disabled: state.disabled,
                call_count: state.call_count,
                error_count: state.error_count,
                expires_at: state.expires_at.to_string(),
                cooldowns: state.cooldowns.len(),
            });
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::StatusCode, routing::post};
    use tokio::net::TcpListener;

    use super::*;

    fn test_pool(count: usize) -> CredentialPool {
        CredentialPool::new(count, "http://127.0.0.1:9/oauth2/token".to_string(), reqwest::Client::new())
    }

    /// Push every expiry far enough out that acquire never refreshes.
    async fn disarm_refresh(pool: &CredentialPool) {
        for credential in &pool.credentials {
            let mut state = credential.state.lock().await;
            state.expires_at = Timestamp::now()
                .saturating_add(SignedDuration::from_secs(7200))
                .expect("bounded duration stays within timestamp range");
        }
    }

    /// Pull every expiry inside the refresh window.
    async fn arm_refresh(pool: &CredentialPool) {
        for credential in &pool.credentials {
            let mut state = credential.state.lock().await;
            state.expires_at = Timestamp::now()
                .saturating_add(SignedDuration::from_secs(30))
                .expect("bounded duration stays within timestamp range");
        }
    }

    #[tokio::test]
    async fn identifiers_are_stable_and_zero_padded() {
        let pool = test_pool(2);
        let stats = pool.stats().await;

        assert_eq!(stats[0].id, "cred_001");
        assert_eq!(stats[1].id, "cred_002");
    }

    #[tokio::test]
    async fn acquire_skips_disabled_credentials() {
        let pool = test_pool(2);
        disarm_refresh(&pool).await;

        pool.record_error(&pool.credentials[0], 403, "gemini-2.5-flash", 0).await;

        for _ in 0..20 {
            let lease = pool.acquire("gemini-2.5-flash").await.unwrap();
            assert_eq!(lease.id(), "cred_002");
        }
    }

    #[tokio::test]
    async fn cooldown_excludes_the_credential_for_that_model_only() {
        let pool = test_pool(1);
        disarm_refresh(&pool).await;

        pool.record_error(&pool.credentials[0], 429, "gemini-2.5-flash", 7).await;

        // Cooled down for the model that saw the 429.
        let error = pool.acquire("gemini-2.5-flash").await.unwrap_err();
        assert!(matches!(error, PoolError::NoCredential(_)));

        // Other models are unaffected.
        let lease = pool.acquire("gemini-2.5-pro").await.unwrap();
        assert_eq!(lease.id(), "cred_001");

        // The floor of 30 seconds applies even for a short hint.
        let state = pool.credentials[0].state.lock().await;
        let until = state.cooldowns["gemini-2.5-flash"];
        assert!(
            until
                >= Timestamp::now()
                    .saturating_add(SignedDuration::from_secs(25))
                    .expect("bounded duration stays within timestamp range")
        );
    }

    #[tokio::test]
    async fn acquire_excluding_never_returns_the_excluded_credential() {
        let pool = test_pool(2);
        disarm_refresh(&pool).await;

        for _ in 0..20 {
            let lease = pool
                .acquire_excluding("gemini-2.5-flash", Some("cred_001"))
                .await
                .unwrap();
            assert_eq!(lease.id(), "cred_002");
        }

        pool.record_error(&pool.credentials[1], 400, "gemini-2.5-flash", 0).await;

        let error = pool
            .acquire_excluding("gemini-2.5-flash", Some("cred_001"))
            .await
            .unwrap_err();
        assert!(matches!(error, PoolError::NoCredential(_)));
    }

    #[tokio::test]
    async fn call_and_error_counters_accumulate() {
        let pool = test_pool(1);
        disarm_refresh(&pool).await;

        pool.acquire("gemini-2.5-flash").await.unwrap();
        pool.acquire("gemini-2.5-flash").await.unwrap();
        pool.record_error(&pool.credentials[0], 500, "gemini-2.5-flash", 0).await;

        let stats = pool.stats().await;
        assert_eq!(stats[0].call_count, 2);
        assert_eq!(stats[0].error_count, 1);
        assert!(!stats[0].disabled);
        assert_eq!(stats[0].cooldowns, 0);
    }

    /// Serves the refresh endpoint with a scripted sequence of statuses, then
    /// 200 with a fresh token for every later call.
    async fn spawn_refresh_endpoint(scripted: Vec<u16>) -> String {
        use std::sync::Mutex as StdMutex;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let scripted = Arc::new(StdMutex::new(scripted));

        let app = Router::new().route(
            "/oauth2/token",
            post(move || {
                let scripted = scripted.clone();
                async move {
                    let status = {
                        let mut scripted = scripted.lock().unwrap();
                        if scripted.is_empty() { 200 } else { scripted.remove(0) }
                    };

                    if status == 200 {
                        (
                            StatusCode::OK,
                            r#"{"access_token":"refreshed_token","expires_in":3600,"token_type":"Bearer"}"#,
                        )
                    } else {
                        (StatusCode::from_u16(status).unwrap(), "nope")
                    }
                }
            }),
        );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}/oauth2/token")
    }

    #[tokio::test]
    async fn permanent_refresh_failure_disables_and_the_pool_falls_over() {
        let refresh_url = spawn_refresh_endpoint(vec![401]).await;
        let pool = CredentialPool::new(2, refresh_url, reqwest::Client::new());
        arm_refresh(&pool).await;

        // First acquire hits the 401, disabling whichever credential was
        // selected. Retrying lands on the surviving one.
        let error = pool.acquire("gemini-2.5-flash").await.unwrap_err();
        assert!(matches!(error, PoolError::Refresh(RefreshError::Permanent(401))));

        let lease = pool.acquire("gemini-2.5-flash").await.unwrap();
        assert_eq!(lease.token().expose_secret(), "refreshed_token");

        let stats = pool.stats().await;
        assert_eq!(stats.iter().filter(|entry| entry.disabled).count(), 1);
    }

    #[tokio::test]
    async fn temporary_refresh_failure_leaves_the_credential_usable() {
        let refresh_url = spawn_refresh_endpoint(vec![500]).await;
        let pool = CredentialPool::new(1, refresh_url, reqwest::Client::new());
        arm_refresh(&pool).await;

        let error = pool.acquire("gemini-2.5-flash").await.unwrap_err();
        assert!(matches!(error, PoolError::Refresh(RefreshError::Temporary(_))));

        // Second attempt refreshes successfully.
        let lease = pool.acquire("gemini-2.5-flash").await.unwrap();
        assert_eq!(lease.token().expose_secret(), "refreshed_token");

        let stats = pool.stats().await;
        assert!(!stats[0].disabled);
    }

    #[tokio::test]
    async fn refresh_advances_the_expiry() {
        let refresh_url = spawn_refresh_endpoint(Vec::new()).await;
        let pool = CredentialPool::new(1, refresh_url, reqwest::Client::new());
        arm_refresh(&pool).await;

        let before = pool.credentials[0].state.lock().await.expires_at;
        pool.refresh(&pool.credentials[0]).await.unwrap();
        let after = pool.credentials[0].state.lock().await.expires_at;

        assert!(after > before);
    }
}
