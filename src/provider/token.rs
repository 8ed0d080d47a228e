//! Copilot bearer-token exchange and caching.
//!
//! A long-lived refresh token is exchanged for a short-lived bearer via
//! `GET https://api.github.com/copilot_internal/v2/token`. The bearer is
//! cached until close to expiry; refresh is singleflight per account: the
//! exchange runs while holding the cache's async mutex, so concurrent
//! callers queue on the lock and observe the in-flight result instead of
//! issuing their own exchange.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::RefreshToken;
use crate::error::{Error, Result};

use super::EDITOR_VERSION;

pub(crate) const TOKEN_EXCHANGE_URL: &str = "https://api.github.com/copilot_internal/v2/token";

/// A bearer is refreshed once it is within this many seconds of expiry.
const EXPIRY_SKEW_SECS: u64 = 60;

/// A short-lived access token with its absolute expiry (unix seconds).
#[derive(Debug, Clone, Deserialize)]
pub struct Bearer {
    pub token: String,
    pub expires_at: u64,
}

impl Bearer {
    /// Usable without refresh: comfortably inside the expiry skew.
    fn is_fresh(&self, now: u64) -> bool {
        now + EXPIRY_SKEW_SECS < self.expires_at
    }

    /// Not yet expired; may still be served if a refresh fails.
    fn is_valid(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Per-account bearer cache with singleflight refresh.
pub struct TokenCache {
    account_id: String,
    refresh_token: RefreshToken,
    client: reqwest::Client,
    exchange_url: String,
    cached: Mutex<Option<Bearer>>,
}

impl TokenCache {
    pub fn new(account_id: String, refresh_token: RefreshToken, client: reqwest::Client) -> Self {
        Self::with_exchange_url(account_id, refresh_token, client, TOKEN_EXCHANGE_URL.to_string())
    }

    /// Like [`new`](Self::new) with a custom exchange endpoint, so tests can
    /// point the cache at a local server.
    pub fn with_exchange_url(
        account_id: String,
        refresh_token: RefreshToken,
        client: reqwest::Client,
        exchange_url: String,
    ) -> Self {
        Self {
            account_id,
            refresh_token,
            client,
            exchange_url,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer, exchanging the refresh token if the cached one is
    /// stale. On exchange failure the previous bearer is kept as long as it
    /// has not actually expired.
    pub async fn bearer(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        let now = unix_now();

        if let Some(bearer) = cached.as_ref() {
            if bearer.is_fresh(now) {
                return Ok(bearer.token.clone());
            }
        }

        match self.exchange().await {
            Ok(fresh) => {
                tracing::info!(
                    account = %self.account_id,
                    expires_at = fresh.expires_at,
                    "refreshed bearer token"
                );
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(token)
            }
            Err(err) => {
                if let Some(bearer) = cached.as_ref() {
                    if bearer.is_valid(now) {
                        tracing::warn!(
                            account = %self.account_id,
                            error = %err,
                            "bearer refresh failed; serving previous token until expiry"
                        );
                        return Ok(bearer.token.clone());
                    }
                }
                Err(err)
            }
        }
    }

    /// Drop the cached bearer (after an upstream 401/403).
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// Exchange unconditionally and replace the cache.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    /// Background pre-refresh: exchange now if the cached bearer expires
    /// within the next `window` seconds. Never surfaces errors; the next
    /// caller retries inline.
    pub async fn refresh_if_expiring(&self, window: u64) {
        let mut cached = self.cached.lock().await;
        let now = unix_now();
        let due = matches!(cached.as_ref(), Some(b) if b.expires_at <= now + window);
        if !due {
            return;
        }

        match self.exchange().await {
            Ok(fresh) => {
                tracing::debug!(
                    account = %self.account_id,
                    expires_at = fresh.expires_at,
                    "pre-refreshed bearer token"
                );
                *cached = Some(fresh);
            }
            Err(err) => {
                tracing::warn!(
                    account = %self.account_id,
                    error = %err,
                    "background bearer refresh failed"
                );
            }
        }
    }

    async fn exchange(&self) -> Result<Bearer> {
        let response = self
            .client
            .get(&self.exchange_url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token {}", self.refresh_token.expose_secret()),
            )
            .header("Editor-Version", EDITOR_VERSION)
            .send()
            .await
            .map_err(|e| Error::Token {
                account: self.account_id.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Token {
                account: self.account_id.clone(),
                reason: format!("exchange returned {}", status),
            });
        }

        response.json::<Bearer>().await.map_err(|e| Error::Token {
            account: self.account_id.clone(),
            reason: format!("invalid exchange response: {}", e),
        })
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
