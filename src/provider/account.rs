//! A single GitHub Copilot account: credentials, proxy, rate budget, health.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{AccountConfig, ConfigError, ProxyConfig};
use crate::rate::RateLimiter;

use super::token::TokenCache;

/// Mutable health state, protected by the account's mutex.
#[derive(Debug, Default)]
struct Health {
    /// Excluded from selection until this instant.
    cooling_until: Option<Instant>,
    /// Selection/LRU stamp; `None` means never used.
    last_used: Option<Instant>,
}

/// One Copilot account. Owns its token cache, rate limiter, and the HTTP
/// client used for its traffic (proxied if the account configures a proxy).
pub struct Account {
    pub id: String,
    pub(crate) limiter: RateLimiter,
    pub(crate) tokens: TokenCache,
    pub(crate) client: reqwest::Client,
    health: Mutex<Health>,
}

impl Account {
    /// Build an account from config. Accounts without a proxy share the
    /// gateway-wide client; proxied accounts get their own client so proxied
    /// and direct connection pools never mix.
    pub fn from_config(
        config: &AccountConfig,
        shared_client: &reqwest::Client,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = match &config.proxy {
            Some(proxy) => build_proxied_client(proxy, request_timeout)?,
            None => shared_client.clone(),
        };

        Ok(Self {
            id: config.id.clone(),
            limiter: RateLimiter::new(&config.rate_limits),
            tokens: TokenCache::new(config.id.clone(), config.token.clone(), client.clone()),
            client,
            health: Mutex::new(Health::default()),
        })
    }

    pub fn is_cooling(&self) -> bool {
        let health = self.health.lock().unwrap();
        matches!(health.cooling_until, Some(until) if until > Instant::now())
    }

    pub fn cool_for(&self, duration: Duration) {
        let mut health = self.health.lock().unwrap();
        health.cooling_until = Some(Instant::now() + duration);
        tracing::warn!(
            account = %self.id,
            secs = duration.as_secs(),
            "account cooling after upstream error"
        );
    }

    /// Stamp the LRU clock. Written at selection time and again on upstream
    /// success.
    pub fn mark_used(&self) {
        self.health.lock().unwrap().last_used = Some(Instant::now());
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.health.lock().unwrap().last_used
    }
}

#[cfg(test)]
impl Account {
    /// Bare account for provider unit tests: no proxy, direct client.
    pub(crate) fn for_tests(id: &str, tokens: TokenCache, limiter: RateLimiter) -> Self {
        Self {
            id: id.to_string(),
            limiter,
            tokens,
            client: reqwest::Client::new(),
            health: Mutex::new(Health::default()),
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("cooling", &self.is_cooling())
            .finish_non_exhaustive()
    }
}

fn build_proxied_client(
    proxy: &ProxyConfig,
    request_timeout: Duration,
) -> Result<reqwest::Client, ConfigError> {
    let url = proxy.url()?;
    let proxy = reqwest::Proxy::all(url)
        .map_err(|e| ConfigError::Validation(format!("invalid proxy: {}", e)))?;
    reqwest::Client::builder()
        .timeout(request_timeout)
        .connect_timeout(Duration::from_secs(10))
        .proxy(proxy)
        .build()
        .map_err(|e| ConfigError::Validation(format!("failed to build proxied client: {}", e)))
}
