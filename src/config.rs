//! Configuration parsing and validation for octogate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::Path;

/// Root configuration structure, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upstream providers in config order; priority decides selection order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// How often the background task pre-refreshes Copilot bearers (seconds).
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval: u64,
    /// Total outbound request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Capture request/response traffic to disk (headers redacted).
    #[serde(default)]
    pub record_traffic: bool,
    /// Directory for traffic captures.
    #[serde(default = "default_traffic_dir")]
    pub traffic_dir: String,
    /// If set, inbound requests must carry `Authorization: Bearer <master_key>`.
    pub master_key: Option<ApiKey>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_token_refresh_interval() -> u64 {
    1500
}

fn default_request_timeout() -> u64 {
    100
}

fn default_traffic_dir() -> String {
    "./traffic".to_string()
}

fn default_true() -> bool {
    true
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The inner `SecretString` ensures the key value is:
/// - Zeroized in memory when dropped
/// - Never exposed via Debug or Display
/// - Only accessible via `.expose_secret()` (grep-auditable)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// Long-lived GitHub device-flow credential, exchanged for short-lived bearers.
///
/// Same redaction contract as [`ApiKey`]: never appears in logs or serialized
/// output in the clear.
#[derive(Clone)]
pub struct RefreshToken(SecretString);

impl RefreshToken {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for RefreshToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for RefreshToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| RefreshToken(SecretString::from(s)))
    }
}

impl From<&str> for RefreshToken {
    fn from(s: &str) -> Self {
        RefreshToken(SecretString::from(s))
    }
}

/// One sliding rate window: at most `max_requests` admissions per `duration` seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub duration: u64,
    pub max_requests: usize,
}

/// SOCKS5 proxy for a single Copilot account.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Build the `socks5://` URL, percent-encoding credentials if present.
    pub fn url(&self) -> Result<url::Url, ConfigError> {
        let mut url = url::Url::parse(&format!("socks5://{}:{}", self.host, self.port))
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "invalid proxy address '{}:{}': {}",
                    self.host, self.port, e
                ))
            })?;
        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| ConfigError::Validation("invalid proxy username".to_string()))?;
            if let Some(password) = &self.password {
                url.set_password(Some(password))
                    .map_err(|_| ConfigError::Validation("invalid proxy password".to_string()))?;
            }
        }
        Ok(url)
    }
}

/// A single GitHub Copilot account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub token: RefreshToken,
    pub proxy: Option<ProxyConfig>,
    /// Per-account windows; empty means the account imposes no limit of its own.
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
}

/// Provider configuration: common fields plus a type-tagged payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// Type-specific provider payload, tagged by the `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderKind {
    #[serde(rename = "github-copilot")]
    GithubCopilot {
        #[serde(default)]
        accounts: Vec<AccountConfig>,
    },
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible {
        base_url: String,
        api_key: ApiKey,
        #[serde(default)]
        model_mapping: HashMap<String, String>,
    },
}

impl ProviderConfig {
    /// Diagnostic name: `{type}#{priority}`. Priorities are unique per the
    /// config contract, so this is unique too.
    pub fn name(&self) -> String {
        let kind = match &self.kind {
            ProviderKind::GithubCopilot { .. } => "github-copilot",
            ProviderKind::OpenAiCompatible { .. } => "openai-compatible",
        };
        format!("{}#{}", kind, self.priority)
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.iter().all(|p| !p.enabled) {
            tracing::warn!("No enabled providers configured - gateway will reject all requests");
        }

        let mut priorities = std::collections::HashSet::new();
        for provider in &self.providers {
            if !priorities.insert(provider.priority) {
                tracing::warn!(
                    priority = provider.priority,
                    "Duplicate provider priority; config order breaks the tie"
                );
            }

            match &provider.kind {
                ProviderKind::GithubCopilot { accounts } => {
                    if accounts.is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "Provider '{}' has no accounts",
                            provider.name()
                        )));
                    }
                    for account in accounts {
                        if account.id.is_empty() {
                            return Err(ConfigError::Validation(
                                "Copilot account with empty id".to_string(),
                            ));
                        }
                        if let Some(proxy) = &account.proxy {
                            // Fail fast on a malformed proxy instead of at first use.
                            proxy.url()?;
                        }
                    }
                }
                ProviderKind::OpenAiCompatible { base_url, .. } => {
                    if base_url.is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "Provider '{}' has empty base_url",
                            provider.name()
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{ "listen": "127.0.0.1:9000" }"#;

        let config = Config::parse_str(json).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert!(config.providers.is_empty());
        assert_eq!(config.token_refresh_interval, 1500);
        assert_eq!(config.request_timeout, 100);
        assert!(!config.record_traffic);
        assert!(config.master_key.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "listen": "0.0.0.0:8080",
            "token_refresh_interval": 900,
            "request_timeout": 60,
            "record_traffic": true,
            "master_key": "sekrit",
            "providers": [
                {
                    "type": "github-copilot",
                    "priority": 1,
                    "rate_limits": [{"duration": 10, "max_requests": 2}],
                    "accounts": [
                        {"id": "alice", "token": "ghr_alice"},
                        {
                            "id": "bob",
                            "token": "ghr_bob",
                            "proxy": {"host": "127.0.0.1", "port": 1080, "username": "u", "password": "p"},
                            "rate_limits": [{"duration": 60, "max_requests": 30}]
                        }
                    ]
                },
                {
                    "type": "openai-compatible",
                    "priority": 2,
                    "base_url": "https://api.example.com/v1",
                    "api_key": "sk-test",
                    "model_mapping": {"gpt-4o": "gpt-4o-2024-08-06"}
                }
            ]
        }"#;

        let config = Config::parse_str(json).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.token_refresh_interval, 900);
        assert_eq!(config.providers[0].name(), "github-copilot#1");
        assert_eq!(config.providers[1].name(), "openai-compatible#2");

        match &config.providers[0].kind {
            ProviderKind::GithubCopilot { accounts } => {
                assert_eq!(accounts.len(), 2);
                assert_eq!(accounts[0].id, "alice");
                assert!(accounts[1].proxy.is_some());
                assert_eq!(accounts[1].rate_limits.len(), 1);
            }
            other => panic!("expected copilot provider, got {:?}", other),
        }
    }

    #[test]
    fn test_copilot_provider_requires_accounts() {
        let json = r#"{
            "providers": [
                {"type": "github-copilot", "priority": 1, "accounts": []}
            ]
        }"#;

        let result = Config::parse_str(json);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_openai_provider_requires_base_url() {
        let json = r#"{
            "providers": [
                {"type": "openai-compatible", "priority": 1, "base_url": "", "api_key": "k"}
            ]
        }"#;

        let result = Config::parse_str(json);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_api_key_debug_redaction() {
        let key = ApiKey::from("super-secret-key");
        let debug_output = format!("{:?}", key);
        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("super-secret"));
    }

    #[test]
    fn test_refresh_token_redaction() {
        let token = RefreshToken::from("ghr_supersecret");
        assert_eq!(format!("{:?}", token), "[REDACTED]");
        assert_eq!(format!("{}", token), "[REDACTED]");
        let json = serde_json::to_string(&token).unwrap();
        assert!(!json.contains("ghr_supersecret"));
        assert_eq!(token.expose_secret(), "ghr_supersecret");
    }

    #[test]
    fn test_account_config_debug_does_not_leak_token() {
        let json = r#"{
            "providers": [
                {
                    "type": "github-copilot",
                    "priority": 1,
                    "accounts": [{"id": "alice", "token": "ghr_secret_value"}]
                }
            ]
        }"#;

        let config = Config::parse_str(json).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("ghr_secret_value"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_proxy_url_with_credentials() {
        let proxy = ProxyConfig {
            host: "proxy.example.com".to_string(),
            port: 1080,
            username: Some("user name".to_string()),
            password: Some("p@ss".to_string()),
        };
        let url = proxy.url().unwrap();
        assert_eq!(url.scheme(), "socks5");
        assert_eq!(url.host_str(), Some("proxy.example.com"));
        assert_eq!(url.port(), Some(1080));
        // Credentials are percent-encoded, never raw.
        assert_eq!(url.username(), "user%20name");
        assert_eq!(url.password(), Some("p%40ss"));
    }

    #[test]
    fn test_proxy_url_without_credentials() {
        let proxy = ProxyConfig {
            host: "10.0.0.1".to_string(),
            port: 9050,
            username: None,
            password: None,
        };
        let url = proxy.url().unwrap();
        assert_eq!(url.as_str(), "socks5://10.0.0.1:9050");
    }

    #[test]
    fn test_unknown_provider_type_rejected() {
        let json = r#"{
            "providers": [
                {"type": "mystery", "priority": 1}
            ]
        }"#;

        assert!(matches!(Config::parse_str(json), Err(ConfigError::Parse(_))));
    }
}
