//! Upstream providers and the selection/failover engine.
//!
//! Two provider kinds exist: GitHub Copilot (an ordered set of accounts,
//! each with its own credentials, proxy and rate budget) and any
//! OpenAI-compatible endpoint. The registry walks them in priority order
//! and fails over on eligible errors.

mod account;
mod copilot;
mod openai;
mod registry;
mod token;

pub use account::Account;
pub use copilot::CopilotProvider;
pub use openai::OpenAiProvider;
pub use registry::{ChatSuccess, Endpoint, Provider, ProviderRegistry, RequestContext};
pub use token::TokenCache;

use std::time::Duration;

/// Editor identity presented to the Copilot endpoints.
pub(crate) const EDITOR_VERSION: &str = "vscode/1.85.0";
pub(crate) const COPILOT_INTEGRATION_ID: &str = "vscode-chat";

/// Cooldowns applied when a slot misbehaves, by error class.
pub(crate) const AUTH_FAILURE_COOLDOWN: Duration = Duration::from_secs(600);
pub(crate) const RATE_LIMIT_MIN_COOLDOWN: Duration = Duration::from_secs(30);
pub(crate) const SERVER_ERROR_COOLDOWN: Duration = Duration::from_secs(60);
pub(crate) const TRANSPORT_COOLDOWN: Duration = Duration::from_secs(30);

/// Why a single upstream attempt did not produce a 2xx response.
#[derive(Debug)]
pub(crate) enum ExecFailure {
    /// Failover-eligible; the slot has already been cooled. `timeout` marks
    /// pre-first-byte timeouts so the terminal error can be a 504.
    Failover { reason: String, timeout: bool },
    /// Non-failover status; returned to the client verbatim.
    Client { status: u16, body: String },
}

/// Parse a `Retry-After` header as delay-seconds, clamped to the minimum
/// rate-limit cooldown.
pub(crate) fn rate_limit_cooldown(response: &reqwest::Response) -> Duration {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);
    retry_after.max(RATE_LIMIT_MIN_COOLDOWN)
}
