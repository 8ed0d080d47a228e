//! Provider registry: priority-ordered candidate walk with failover.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::{Config, ConfigError, ProviderKind};
use crate::error::{Error, Result};
use crate::proxy::types::{normalize_for_copilot, ChatCompletionRequest};

use super::account::Account;
use super::copilot::CopilotProvider;
use super::openai::OpenAiProvider;
use super::ExecFailure;

/// How long a provider's `/models` response is served from memory.
const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);

/// In-provider retries after the first failed slot (a different account is
/// used for each attempt where possible).
const EXTRA_PROVIDER_ATTEMPTS: usize = 2;

/// Upstream endpoints the gateway proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Models,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/chat/completions",
            Endpoint::Models => "/models",
        }
    }
}

/// Per-request parameters threaded through selection and execution.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: Endpoint,
    pub accept: String,
    pub stream: bool,
}

/// A configured provider. Tagged variant rather than a trait object: there
/// are exactly two kinds and their slot types differ.
pub enum Provider {
    Copilot(CopilotProvider),
    OpenAiCompatible(OpenAiProvider),
}

impl Provider {
    pub fn name(&self) -> &str {
        match self {
            Provider::Copilot(p) => p.name(),
            Provider::OpenAiCompatible(p) => p.name(),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Provider::Copilot(p) => p.priority(),
            Provider::OpenAiCompatible(p) => p.priority(),
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Provider::Copilot(p) => p.enabled(),
            Provider::OpenAiCompatible(p) => p.enabled(),
        }
    }
}

/// The unit a provider hands out to execute one request: an account for
/// Copilot, the provider itself otherwise.
enum Slot {
    Account(Arc<Account>),
    Whole,
}

/// A successful chat execution, tagged with the provider that served it.
pub struct ChatSuccess {
    pub provider: String,
    pub response: reqwest::Response,
}

struct CachedModels {
    fetched_at: Instant,
    models: Vec<Value>,
}

/// Priority-ordered, immutable-after-startup set of providers.
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    models_cache: DashMap<String, CachedModels>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let shared_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Validation(format!("failed to build HTTP client: {}", e)))?;

        let request_timeout = Duration::from_secs(config.request_timeout);
        let mut providers = Vec::with_capacity(config.providers.len());

        for provider_config in &config.providers {
            let name = provider_config.name();
            let provider = match &provider_config.kind {
                ProviderKind::GithubCopilot { accounts } => {
                    Provider::Copilot(CopilotProvider::from_config(
                        name,
                        provider_config.priority,
                        provider_config.enabled,
                        &provider_config.rate_limits,
                        accounts,
                        &shared_client,
                        request_timeout,
                    )?)
                }
                ProviderKind::OpenAiCompatible {
                    base_url,
                    api_key,
                    model_mapping,
                } => Provider::OpenAiCompatible(OpenAiProvider::new(
                    name,
                    provider_config.priority,
                    provider_config.enabled,
                    base_url,
                    api_key.clone(),
                    model_mapping.clone(),
                    &provider_config.rate_limits,
                    shared_client.clone(),
                )),
            };
            providers.push(provider);
        }

        // Ascending priority; stable, so config order breaks ties.
        providers.sort_by_key(|p| p.priority());

        Ok(Self {
            providers,
            models_cache: DashMap::new(),
        })
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    /// Walk providers in ascending priority until one serves the request.
    ///
    /// Failover-eligible failures move on to the next candidate (after up to
    /// [`EXTRA_PROVIDER_ATTEMPTS`] in-provider retries on distinct accounts);
    /// non-failover upstream statuses are returned to the client verbatim.
    /// When every candidate is exhausted the terminal error is a 504 if any
    /// attempt timed out pre-first-byte, else a 503 naming each provider's
    /// last skip reason.
    pub async fn execute_chat(
        &self,
        ctx: &RequestContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChatSuccess> {
        let mut reasons: Vec<(String, String)> = Vec::new();
        let mut timed_out = false;

        for provider in &self.providers {
            let name = provider.name().to_string();
            if !provider.enabled() {
                reasons.push((name, "disabled".to_string()));
                continue;
            }

            let mut attempted_accounts: Vec<String> = Vec::new();
            let mut last_reason: Option<String> = None;
            let mut served = None;

            for _ in 0..=EXTRA_PROVIDER_ATTEMPTS {
                let slot = match self.try_select(provider, &attempted_accounts) {
                    Ok(slot) => slot,
                    Err(skip) => {
                        // A skip after a failed attempt (e.g. "cooling") is
                        // less informative than the failure itself; keep the
                        // first recorded reason.
                        last_reason.get_or_insert(skip);
                        break;
                    }
                };
                if let Slot::Account(account) = &slot {
                    attempted_accounts.push(account.id.clone());
                }

                match self.execute_slot(provider, &slot, ctx, request).await {
                    Ok(response) => {
                        served = Some(response);
                        break;
                    }
                    Err(ExecFailure::Failover { reason, timeout }) => {
                        tracing::warn!(
                            provider = %provider.name(),
                            %reason,
                            "attempt failed, trying next candidate"
                        );
                        timed_out |= timeout;
                        last_reason = Some(reason);
                    }
                    Err(ExecFailure::Client { status, body }) => {
                        // Request-shaped failure: the client gets it verbatim
                        // and no other provider is tried.
                        return Err(Error::UpstreamHttp { status, body });
                    }
                }
            }

            if let Some(response) = served {
                tracing::info!(provider = %provider.name(), "request served");
                return Ok(ChatSuccess {
                    provider: provider.name().to_string(),
                    response,
                });
            }
            reasons.push((
                name,
                last_reason.unwrap_or_else(|| "not attempted".to_string()),
            ));
        }

        if timed_out {
            Err(Error::Timeout)
        } else {
            Err(Error::NoProviderAvailable { reasons })
        }
    }

    fn try_select(
        &self,
        provider: &Provider,
        exclude: &[String],
    ) -> std::result::Result<Slot, String> {
        match provider {
            Provider::Copilot(p) => p.try_select(exclude).map(Slot::Account),
            Provider::OpenAiCompatible(p) => p.try_select().map(|()| Slot::Whole),
        }
    }

    async fn execute_slot(
        &self,
        provider: &Provider,
        slot: &Slot,
        ctx: &RequestContext,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<reqwest::Response, ExecFailure> {
        match (provider, slot) {
            (Provider::Copilot(p), Slot::Account(account)) => {
                let body = to_wire_body(&normalize_for_copilot(request))?;
                p.execute(account, ctx, &body).await
            }
            (Provider::OpenAiCompatible(p), _) => {
                let body = to_wire_body(request)?;
                p.execute(ctx, body).await
            }
            (Provider::Copilot(_), Slot::Whole) => Err(ExecFailure::Failover {
                reason: "slot mismatch".to_string(),
                timeout: false,
            }),
        }
    }

    /// Union of `/models` across providers, deduped by id. Providers are
    /// walked in priority order, so the higher-priority provider's metadata
    /// wins on duplicates. Each provider's list is cached for five minutes.
    pub async fn list_models(&self) -> Result<Vec<Value>> {
        let mut models = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut reasons: Vec<(String, String)> = Vec::new();
        let mut any_provider_answered = false;

        for provider in &self.providers {
            let name = provider.name().to_string();
            if !provider.enabled() {
                reasons.push((name, "disabled".to_string()));
                continue;
            }

            let provider_models = match self.cached_models(provider).await {
                Ok(list) => list,
                Err(reason) => {
                    tracing::warn!(provider = %provider.name(), %reason, "models fetch failed");
                    reasons.push((name, reason));
                    continue;
                }
            };

            any_provider_answered = true;
            for model in provider_models {
                let Some(id) = model.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if seen.insert(id.to_string()) {
                    models.push(model);
                }
            }
        }

        if any_provider_answered {
            Ok(models)
        } else {
            Err(Error::NoProviderAvailable { reasons })
        }
    }

    async fn cached_models(&self, provider: &Provider) -> std::result::Result<Vec<Value>, String> {
        let name = provider.name();
        if let Some(cached) = self.models_cache.get(name) {
            if cached.fetched_at.elapsed() < MODELS_CACHE_TTL {
                return Ok(cached.models.clone());
            }
        }

        let fetched = match provider {
            Provider::Copilot(p) => p.fetch_models("application/json").await?,
            Provider::OpenAiCompatible(p) => p.fetch_models("application/json").await?,
        };

        self.models_cache.insert(
            name.to_string(),
            CachedModels {
                fetched_at: Instant::now(),
                models: fetched.clone(),
            },
        );
        Ok(fetched)
    }

    /// Background task: wake every `interval_secs` and pre-refresh any
    /// Copilot bearer expiring within the next interval.
    pub async fn background_refresh(self: Arc<Self>, interval_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing is stale yet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for provider in &self.providers {
                if let Provider::Copilot(copilot) = provider {
                    for account in copilot.accounts() {
                        account.tokens.refresh_if_expiring(interval_secs).await;
                    }
                }
            }
        }
    }
}

fn to_wire_body<T: serde::Serialize>(request: &T) -> std::result::Result<Value, ExecFailure> {
    serde_json::to_value(request).map_err(|e| ExecFailure::Failover {
        reason: format!("failed to serialize request body: {}", e),
        timeout: false,
    })
}
