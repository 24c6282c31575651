//! Bearer credentials for pipeline calls, with single-flight refresh.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast;
use tracing::{info, warn};
use urlencoding::encode;

use crate::config::{AuthConfig, Config};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential refresh rejected: {0}")]
    Rejected(String),

    #[error("credential endpoint unreachable: {0}")]
    Unavailable(String),

    #[error("no credentials configured")]
    NotConfigured,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    pub expires_at: Option<OffsetDateTime>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<OffsetDateTime>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_expired(&self, at: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| exp <= at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The last token known to the provider, without network access.
    async fn current_token(&self) -> Result<AccessToken, CredentialError>;
    async fn refresh(&self) -> Result<AccessToken, CredentialError>;
}

/// A token together with the refresh generation it came from. Callers hand
/// the epoch back to `refresh_after` when the token is rejected.
#[derive(Debug, Clone)]
pub struct TokenLease {
    pub token: AccessToken,
    pub epoch: u64,
}

type RefreshResult = Result<TokenLease, CredentialError>;

#[derive(Default)]
struct CacheState {
    token: Option<AccessToken>,
    epoch: u64,
    inflight: Option<broadcast::Sender<RefreshResult>>,
}

/// Shares one credential between concurrent callers. Simultaneous refresh
/// requests coalesce into a single provider call whose outcome every waiter
/// receives.
pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    state: Arc<Mutex<CacheState>>,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A usable token, refreshing first if the cached one has expired.
    pub async fn token(&self) -> RefreshResult {
        let cached = {
            let state = self.lock();
            state.token.clone().map(|token| TokenLease {
                token,
                epoch: state.epoch,
            })
        };

        match cached {
            Some(lease) if !lease.token.is_expired(OffsetDateTime::now_utc()) => Ok(lease),
            Some(lease) => self.refresh_after(lease.epoch).await,
            None => {
                let token = self.provider.current_token().await?;
                let lease = {
                    let mut state = self.lock();
                    let token = state.token.get_or_insert(token).clone();
                    TokenLease {
                        token,
                        epoch: state.epoch,
                    }
                };
                if lease.token.is_expired(OffsetDateTime::now_utc()) {
                    self.refresh_after(lease.epoch).await
                } else {
                    Ok(lease)
                }
            }
        }
    }

    /// Refresh the token that was handed out at `epoch`. If a newer token
    /// already exists it is returned; if a refresh is running, its result is
    /// shared.
    pub async fn refresh_after(&self, epoch: u64) -> RefreshResult {
        let mut rx = {
            let mut state = self.lock();
            if state.epoch > epoch {
                if let Some(token) = state.token.clone() {
                    return Ok(TokenLease {
                        token,
                        epoch: state.epoch,
                    });
                }
            }
            let waiting = state.inflight.as_ref().map(|tx| tx.subscribe());
            match waiting {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    state.inflight = Some(tx.clone());
                    self.spawn_refresh(tx);
                    rx
                }
            }
        };

        rx.recv()
            .await
            .unwrap_or_else(|e| Err(CredentialError::Unavailable(e.to_string())))
    }

    fn spawn_refresh(&self, tx: broadcast::Sender<RefreshResult>) {
        let provider = Arc::clone(&self.provider);
        let state = Arc::clone(&self.state);
        // detached so a cancelled caller cannot strand the other waiters
        tokio::spawn(async move {
            info!("Refreshing access token");
            let result = provider.refresh().await;

            let outcome = {
                let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
                state.inflight = None;
                match result {
                    Ok(token) => {
                        state.epoch += 1;
                        state.token = Some(token.clone());
                        Ok(TokenLease {
                            token,
                            epoch: state.epoch,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Access token refresh failed");
                        Err(e)
                    }
                }
            };
            // no receivers left is fine
            let _ = tx.send(outcome);
        });
    }
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth `refresh_token` grant against the configured token endpoint. New
/// access tokens are written back into the config file.
pub struct OAuthRefreshProvider {
    auth: AuthConfig,
    config_path: Option<PathBuf>,
    client: reqwest::Client,
}

impl OAuthRefreshProvider {
    pub fn new(auth: AuthConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            auth,
            config_path,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuthRefreshProvider {
    async fn current_token(&self) -> Result<AccessToken, CredentialError> {
        if self.auth.tokens.access_token.is_empty() {
            return Err(CredentialError::NotConfigured);
        }
        Ok(AccessToken::new(self.auth.tokens.access_token.clone(), None))
    }

    async fn refresh(&self) -> Result<AccessToken, CredentialError> {
        let body = format!(
            "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
            encode(&self.auth.client_id),
            encode(&self.auth.client_secret),
            encode(&self.auth.tokens.refresh_token),
        );

        let resp = self
            .client
            .post(&self.auth.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected(format!("{status}: {error_text}")));
        }

        let token_resp: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::Rejected(e.to_string()))?;

        if let Some(path) = &self.config_path {
            if let Err(e) = Config::update_access_token(path, &token_resp.access_token) {
                warn!(error = %e, path = %path.display(), "Could not persist refreshed token");
            }
        }

        let expires_at = token_resp
            .expires_in
            .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs));
        info!(expires_at = ?expires_at, "Access token refreshed");
        Ok(AccessToken::new(token_resp.access_token, expires_at))
    }
}
