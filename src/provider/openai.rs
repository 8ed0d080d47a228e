//! OpenAI-compatible provider: single endpoint, api key, model remap.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::config::{ApiKey, RateLimitConfig};
use crate::rate::RateLimiter;

use super::registry::{Endpoint, RequestContext};
use super::{rate_limit_cooldown, ExecFailure, SERVER_ERROR_COOLDOWN, TRANSPORT_COOLDOWN};

pub struct OpenAiProvider {
    name: String,
    priority: i32,
    enabled: bool,
    base_url: String,
    api_key: ApiKey,
    model_mapping: HashMap<String, String>,
    limiter: RateLimiter,
    client: reqwest::Client,
    /// Cooling applies at provider granularity; there are no accounts.
    cooling_until: Mutex<Option<Instant>>,
}

impl OpenAiProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        priority: i32,
        enabled: bool,
        base_url: &str,
        api_key: ApiKey,
        model_mapping: HashMap<String, String>,
        rate_limits: &[RateLimitConfig],
        client: reqwest::Client,
    ) -> Self {
        Self {
            name,
            priority,
            enabled,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model_mapping,
            limiter: RateLimiter::new(rate_limits),
            client,
            cooling_until: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn is_cooling(&self) -> bool {
        matches!(*self.cooling_until.lock().unwrap(), Some(until) if until > Instant::now())
    }

    fn cool_for(&self, duration: Duration) {
        *self.cooling_until.lock().unwrap() = Some(Instant::now() + duration);
        tracing::warn!(
            provider = %self.name,
            secs = duration.as_secs(),
            "provider cooling after upstream error"
        );
    }

    /// Always selectable when enabled, not cooling, and within rate budget.
    pub(crate) fn try_select(&self) -> Result<(), String> {
        if self.is_cooling() {
            return Err("provider cooling".to_string());
        }
        self.limiter
            .try_admit()
            .map_err(|wait| format!("rate budget exhausted (next slot in {}s)", wait.as_secs()))
    }

    pub(crate) async fn execute(
        &self,
        ctx: &RequestContext,
        mut body: Value,
    ) -> Result<reqwest::Response, ExecFailure> {
        if let Some(model) = body.get("model").and_then(|m| m.as_str()) {
            if let Some(mapped) = self.model_mapping.get(model) {
                tracing::debug!(provider = %self.name, from = %model, to = %mapped, "remapped model");
                body["model"] = Value::String(mapped.clone());
            }
        }

        let url = format!("{}{}", self.base_url, ctx.endpoint.path());
        let request = match ctx.endpoint {
            Endpoint::ChatCompletions => self.client.post(&url).json(&body),
            Endpoint::Models => self.client.get(&url),
        };

        let response = request
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header(reqwest::header::ACCEPT, ctx.accept.as_str())
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(self.classify(response).await)
    }

    pub(crate) async fn fetch_models(&self, accept: &str) -> Result<Vec<Value>, String> {
        let ctx = RequestContext {
            endpoint: Endpoint::Models,
            accept: accept.to_string(),
            stream: false,
        };
        let response = self
            .execute(&ctx, Value::Null)
            .await
            .map_err(|e| match e {
                ExecFailure::Failover { reason, .. } => reason,
                ExecFailure::Client { status, .. } => format!("models endpoint returned {}", status),
            })?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("invalid models response: {}", e))?;
        Ok(payload
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default())
    }

    fn transport_failure(&self, err: reqwest::Error) -> ExecFailure {
        let timeout = err.is_timeout();
        self.cool_for(TRANSPORT_COOLDOWN);
        ExecFailure::Failover {
            reason: format!("transport error: {}", err),
            timeout,
        }
    }

    async fn classify(&self, response: reqwest::Response) -> ExecFailure {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let cooldown = rate_limit_cooldown(&response);
            self.cool_for(cooldown);
            return ExecFailure::Failover {
                reason: "rate limited upstream (429)".to_string(),
                timeout: false,
            };
        }

        if status.is_server_error() {
            self.cool_for(SERVER_ERROR_COOLDOWN);
            return ExecFailure::Failover {
                reason: format!("upstream server error ({})", status),
                timeout: false,
            };
        }

        let body = response.text().await.unwrap_or_default();
        ExecFailure::Client {
            status: status.as_u16(),
            body,
        }
    }
}
