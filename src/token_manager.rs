//! Bearer-token handling for Provider A.
//!
//! Tokens are cached in memory and in a checksummed file on disk, so a
//! restart does not force a new login. A cached token is reused while
//! `now < expires_at - leeway` and only for the username that obtained it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::cache_validator::ValidatedCacheEntry;
use crate::circuit_breaker::AvailabilityTracker;
use crate::clock::{add_duration, SharedClock};
use crate::credentials::{Clearance, Credential};
use crate::errors::ProviderError;
use crate::models::ProviderId;
use crate::warning_throttle::WarningThrottle;

const PROVIDER: ProviderId = ProviderId::Clearance;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub provider_id: ProviderId,
    pub raw_value: String,
    pub expires_at: DateTime<Utc>,
    /// Account that obtained the token.
    pub username: String,
    pub saved_at: DateTime<Utc>,
}

impl Token {
    pub fn is_fresh(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        add_duration(now, leeway) < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("provider_id", &self.provider_id)
            .field("raw_value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("username", &self.username)
            .finish()
    }
}

/// Reads the `exp` claim of a JWT-shaped token without verifying it.
/// Returns `None` for opaque tokens or payloads without `exp`.
pub fn jwt_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let payload = raw.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let seconds = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(seconds, 0)
}

/// Pulls the token out of a login response: `access_token`, `token` or
/// `data.token`.
fn extract_token(body: &Value) -> Option<String> {
    body.get("access_token")
        .or_else(|| body.get("token"))
        .or_else(|| body.get("data").and_then(|data| data.get("token")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Durable single-record token cache.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, corrupt or tampered files all read as "no token".
    pub async fn load(&self) -> Option<Token> {
        let contents = tokio::fs::read_to_string(&self.path).await.ok()?;
        ValidatedCacheEntry::open(&contents)
    }

    /// Atomic write: temp file then rename.
    pub async fn save(&self, token: &Token) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sealed = ValidatedCacheEntry::seal(token)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, sealed).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    pub async fn clear(&self) {
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("Could not remove token cache {}: {}", self.path.display(), err);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub login_url: String,
    pub login_timeout: Duration,
    pub leeway: Duration,
    pub default_lifetime: Duration,
}

pub struct TokenManager {
    client: reqwest::Client,
    settings: TokenSettings,
    store: TokenStore,
    availability: Arc<AvailabilityTracker>,
    clock: SharedClock,
    throttle: WarningThrottle,
    cached: RwLock<Option<Token>>,
    restored: OnceCell<()>,
}

impl TokenManager {
    pub fn new(
        settings: TokenSettings,
        store: TokenStore,
        availability: Arc<AvailabilityTracker>,
        clock: SharedClock,
        throttle: WarningThrottle,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            store,
            availability,
            clock,
            throttle,
            cached: RwLock::new(None),
            restored: OnceCell::new(),
        }
    }

    /// Returns a usable token for `credential`.
    ///
    /// Without `force_refresh`, a fresh cached token for the same username is
    /// returned with no network call. Otherwise logs in.
    ///
    /// Callers check [`AvailabilityTracker::is_available`] first; this method
    /// does not, so it never adds a probe to the login latency.
    pub async fn get_token(
        &self,
        credential: &Credential<Clearance>,
        force_refresh: bool,
    ) -> Result<Token, ProviderError> {
        self.restore().await;

        if !force_refresh {
            if let Some(token) = self.cached_for(credential.username()) {
                tracing::debug!("{}: reusing cached token for {}", PROVIDER, token.username);
                return Ok(token);
            }
        }

        self.login(credential).await
    }

    /// Drops `token` if it is still the cached one (e.g. after the API
    /// rejected it).
    pub async fn invalidate(&self, token: &Token) {
        let removed = {
            let mut cached = self.write();
            if cached.as_ref().map(|t| t.raw_value == token.raw_value).unwrap_or(false) {
                *cached = None;
                true
            } else {
                false
            }
        };

        if removed {
            tracing::info!("{}: cached token invalidated", PROVIDER);
            self.store.clear().await;
        }
    }

    /// The cached token, if any, regardless of freshness.
    pub fn current(&self) -> Option<Token> {
        self.read().clone()
    }

    /// Loads the on-disk token once per process.
    pub async fn restore(&self) {
        self.restored
            .get_or_init(|| async {
                if let Some(token) = self.store.load().await {
                    if token.provider_id == PROVIDER {
                        tracing::debug!(
                            "{}: restored cached token (expires {})",
                            PROVIDER,
                            token.expires_at
                        );
                        let mut cached = self.write();
                        if cached.is_none() {
                            *cached = Some(token);
                        }
                    }
                }
            })
            .await;
    }

    fn cached_for(&self, username: &str) -> Option<Token> {
        let now = self.clock.now();
        self.read()
            .as_ref()
            .filter(|token| token.username == username)
            .filter(|token| token.is_fresh(now, self.settings.leeway))
            .cloned()
    }

    async fn login(&self, credential: &Credential<Clearance>) -> Result<Token, ProviderError> {
        tracing::info!("{}: logging in as {}", PROVIDER, credential.username());

        let response = self
            .client
            .post(&self.settings.login_url)
            .timeout(self.settings.login_timeout)
            .header("Accept", "application/json")
            .form(&[
                ("username", credential.username()),
                ("password", credential.password()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let error = ProviderError::from_reqwest(PROVIDER, err);
                if error.is_unreachable() {
                    // Trip before returning so the next caller skips straight
                    // to the fallback providers.
                    self.availability.record_failure();
                }
                return Err(error);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(PROVIDER, status.as_u16()));
        }

        let body: Value = response.json().await.map_err(|e| {
            ProviderError::parse(PROVIDER, format!("login response is not JSON: {}", e))
        })?;

        if body.get("status").and_then(Value::as_str) == Some("error") {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("login rejected")
                .to_string();
            if self
                .throttle
                .should_log(&format!("clearance_login_error_{}", message.replace(' ', "_")))
            {
                tracing::warn!("{}: login rejected: {}", PROVIDER, message);
            }
            return Err(ProviderError::Auth {
                provider: PROVIDER,
                detail: message,
            });
        }

        let raw_value = extract_token(&body)
            .ok_or_else(|| ProviderError::parse(PROVIDER, "login response carried no token"))?;

        let now = self.clock.now();
        let token = Token {
            provider_id: PROVIDER,
            expires_at: jwt_expiry(&raw_value)
                .unwrap_or_else(|| add_duration(now, self.settings.default_lifetime)),
            raw_value,
            username: credential.username().to_string(),
            saved_at: now,
        };

        if let Err(err) = self.store.save(&token).await {
            if self.throttle.should_log("clearance_token_cache_write") {
                tracing::warn!(
                    "{}: could not persist token to {}: {}",
                    PROVIDER,
                    self.store.path().display(),
                    err
                );
            }
        }

        *self.write() = Some(token.clone());
        self.availability.record_success();

        tracing::info!("{}: login succeeded, token valid until {}", PROVIDER, token.expires_at);
        Ok(token)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Token>> {
        self.cached.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Token>> {
        self.cached.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
