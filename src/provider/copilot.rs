//! GitHub Copilot provider: an ordered set of accounts behind one endpoint.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::config::{AccountConfig, ConfigError, RateLimitConfig};
use crate::rate::RateLimiter;

use super::account::Account;
use super::registry::{Endpoint, RequestContext};
use super::{
    rate_limit_cooldown, ExecFailure, AUTH_FAILURE_COOLDOWN, COPILOT_INTEGRATION_ID,
    EDITOR_VERSION, SERVER_ERROR_COOLDOWN, TRANSPORT_COOLDOWN,
};

pub(crate) const COPILOT_API_BASE: &str = "https://api.individual.githubcopilot.com";

pub struct CopilotProvider {
    name: String,
    priority: i32,
    enabled: bool,
    base_url: String,
    accounts: Vec<Arc<Account>>,
    limiter: RateLimiter,
    /// Serialises account selection: the LRU scan plus the conjunctive
    /// account+provider admission must be one atomic step.
    select_lock: Mutex<()>,
}

impl CopilotProvider {
    pub fn from_config(
        name: String,
        priority: i32,
        enabled: bool,
        rate_limits: &[RateLimitConfig],
        accounts: &[AccountConfig],
        shared_client: &reqwest::Client,
        request_timeout: std::time::Duration,
    ) -> Result<Self, ConfigError> {
        let accounts = accounts
            .iter()
            .map(|a| Account::from_config(a, shared_client, request_timeout).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            priority,
            enabled,
            base_url: COPILOT_API_BASE.to_string(),
            accounts,
            limiter: RateLimiter::new(rate_limits),
            select_lock: Mutex::new(()),
        })
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

    pub(crate) fn accounts(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    /// Pick the least-recently-used eligible account and record one
    /// consumption on both the account's limiter and the provider's.
    ///
    /// Eligible means: not cooling, not in `exclude` (accounts already tried
    /// for this request), and its own rate limiter admits. Ties on the LRU
    /// stamp fall back to config order (stable sort). The chosen account's
    /// LRU stamp is written here so successive selections rotate through
    /// distinct accounts.
    pub(crate) fn try_select(&self, exclude: &[String]) -> Result<Arc<Account>, String> {
        let _guard = self.select_lock.lock().unwrap();

        let mut candidates: Vec<&Arc<Account>> = self
            .accounts
            .iter()
            .filter(|a| !exclude.contains(&a.id))
            .filter(|a| !a.is_cooling())
            .collect();

        if candidates.is_empty() {
            return Err("all accounts cooling or already attempted".to_string());
        }

        candidates.sort_by_key(|a| a.last_used());

        let Some(account) = candidates.into_iter().find(|a| a.limiter.would_admit()) else {
            return Err("account rate budget exhausted".to_string());
        };

        if !self.limiter.would_admit() {
            let hint = self
                .limiter
                .next_available()
                .map(|d| format!(" (next slot in {}s)", d.as_secs()))
                .unwrap_or_default();
            return Err(format!("provider rate budget exhausted{}", hint));
        }

        account.limiter.record();
        self.limiter.record();
        account.mark_used();
        tracing::debug!(provider = %self.name, account = %account.id, "selected account");
        Ok(account.clone())
    }

    /// Least-recently-used non-cooling account, without consuming any rate
    /// budget. Used for the cached `/models` fetch.
    pub(crate) fn peek_account(&self) -> Option<Arc<Account>> {
        let _guard = self.select_lock.lock().unwrap();
        self.accounts
            .iter()
            .filter(|a| !a.is_cooling())
            .min_by_key(|a| a.last_used())
            .cloned()
    }

    /// Execute one request on the given account. Non-2xx statuses and
    /// transport errors are classified per the failover table; the account
    /// is cooled as a side effect where the table says so.
    pub(crate) async fn execute(
        &self,
        account: &Arc<Account>,
        ctx: &RequestContext,
        body: &Value,
    ) -> Result<reqwest::Response, ExecFailure> {
        let bearer = match account.tokens.bearer().await {
            Ok(bearer) => bearer,
            Err(err) => {
                account.cool_for(AUTH_FAILURE_COOLDOWN);
                return Err(ExecFailure::Failover {
                    reason: err.to_string(),
                    timeout: false,
                });
            }
        };

        let response = self
            .send(account, &bearer, ctx, body)
            .await
            .map_err(|e| self.transport_failure(account, e))?;
        let status = response.status();

        if status.is_success() {
            account.mark_used();
            return Ok(response);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            // The bearer may simply have been revoked upstream: force one
            // refresh and retry once before cooling the account.
            tracing::warn!(account = %account.id, %status, "bearer rejected, forcing refresh");
            account.tokens.invalidate().await;

            let bearer = match account.tokens.force_refresh().await {
                Ok(bearer) => bearer,
                Err(err) => {
                    account.cool_for(AUTH_FAILURE_COOLDOWN);
                    return Err(ExecFailure::Failover {
                        reason: err.to_string(),
                        timeout: false,
                    });
                }
            };

            let retry = self
                .send(account, &bearer, ctx, body)
                .await
                .map_err(|e| self.transport_failure(account, e))?;
            let retry_status = retry.status();

            if retry_status.is_success() {
                account.mark_used();
                return Ok(retry);
            }
            if retry_status == reqwest::StatusCode::UNAUTHORIZED
                || retry_status == reqwest::StatusCode::FORBIDDEN
            {
                account.cool_for(AUTH_FAILURE_COOLDOWN);
                return Err(ExecFailure::Failover {
                    reason: format!("bearer rejected twice ({})", retry_status),
                    timeout: false,
                });
            }
            return Err(self.classify(account, retry).await);
        }

        Err(self.classify(account, response).await)
    }

    /// Fetch the provider's model list using the least-recently-used
    /// account's bearer. No rate budget is consumed: the registry caches the
    /// result, so this call is rare.
    pub(crate) async fn fetch_models(&self, accept: &str) -> Result<Vec<Value>, String> {
        let Some(account) = self.peek_account() else {
            return Err("all accounts cooling".to_string());
        };
        let bearer = account.tokens.bearer().await.map_err(|e| e.to_string())?;

        let ctx = RequestContext {
            endpoint: Endpoint::Models,
            accept: accept.to_string(),
            stream: false,
        };
        let response = self
            .send(&account, &bearer, &ctx, &Value::Null)
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("models endpoint returned {}", status));
        }

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

    async fn send(
        &self,
        account: &Account,
        bearer: &str,
        ctx: &RequestContext,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", self.base_url, ctx.endpoint.path());
        let request = match ctx.endpoint {
            Endpoint::ChatCompletions => account.client.post(&url).json(body),
            Endpoint::Models => account.client.get(&url),
        };

        request
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", bearer),
            )
            .header("Editor-Version", EDITOR_VERSION)
            .header("Copilot-Integration-Id", COPILOT_INTEGRATION_ID)
            .header(reqwest::header::ACCEPT, ctx.accept.as_str())
            .send()
            .await
    }

    fn transport_failure(&self, account: &Account, err: reqwest::Error) -> ExecFailure {
        let timeout = err.is_timeout();
        account.cool_for(TRANSPORT_COOLDOWN);
        ExecFailure::Failover {
            reason: format!("transport error: {}", err),
            timeout,
        }
    }

    async fn classify(&self, account: &Account, response: reqwest::Response) -> ExecFailure {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let cooldown = rate_limit_cooldown(&response);
            account.cool_for(cooldown);
            return ExecFailure::Failover {
                reason: "rate limited upstream (429)".to_string(),
                timeout: false,
            };
        }

        if status.is_server_error() {
            account.cool_for(SERVER_ERROR_COOLDOWN);
            return ExecFailure::Failover {
                reason: format!("upstream server error ({})", status),
                timeout: false,
            };
        }

        // Remaining 4xx: the request itself is at fault; pass through.
        let body = response.text().await.unwrap_or_default();
        ExecFailure::Client {
            status: status.as_u16(),
            body,
        }
    }
}
