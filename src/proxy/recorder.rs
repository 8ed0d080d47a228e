//! Optional capture of request/response traffic for debugging.
//!
//! When `record_traffic` is enabled, each proxied request is written to its
//! own JSON file. Credential-bearing headers are redacted before anything
//! touches disk. Writes are fire-and-forget: a failed capture is logged and
//! never affects the request.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::http::HeaderMap;
use serde::Serialize;

/// Headers whose values never reach disk.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

/// One captured request/response pair.
#[derive(Debug, Serialize)]
pub struct Capture {
    pub timestamp: String,
    pub endpoint: String,
    pub provider: Option<String>,
    pub status: u16,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: serde_json::Value,
    /// Absent for streamed responses (the body is never buffered).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<serde_json::Value>,
}

pub struct TrafficRecorder {
    dir: PathBuf,
}

impl TrafficRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Queue a capture for writing. Never blocks the request path.
    pub fn record(&self, capture: Capture) {
        let path = self.dir.join(format!(
            "{}-{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
            uuid::Uuid::new_v4()
        ));
        let dir = self.dir.clone();
        tokio::spawn(async move {
            if let Err(error) = write_capture(&dir, &path, &capture).await {
                tracing::warn!(path = %path.display(), %error, "failed to write traffic capture");
            }
        });
    }
}

pub(crate) async fn write_capture(
    dir: &std::path::Path,
    path: &std::path::Path,
    capture: &Capture,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(capture)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(path, body).await
}

/// Copy headers into a plain map, redacting credential-bearing values.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_str = name.as_str().to_ascii_lowercase();
            let value_str = if SENSITIVE_HEADERS.contains(&name_str.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("<non-utf8>").to_string()
            };
            (name_str, value_str)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("X-Api-Key", HeaderValue::from_static("sk-123"));

        let redacted = redact_headers(&headers);
        assert_eq!(redacted["authorization"], "[REDACTED]");
        assert_eq!(redacted["x-api-key"], "[REDACTED]");
        assert_eq!(redacted["content-type"], "application/json");
    }

    #[tokio::test]
    async fn capture_written_as_json() {
        let dir = std::env::temp_dir().join(format!("octogate-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("capture.json");

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer secret"));

        let capture = Capture {
            timestamp: chrono::Utc::now().to_rfc3339(),
            endpoint: "/chat/completions".to_string(),
            provider: Some("github-copilot#1".to_string()),
            status: 200,
            request_headers: redact_headers(&headers),
            request_body: serde_json::json!({"model": "gpt-4o"}),
            response_body: None,
        };

        write_capture(&dir, &path, &capture).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("github-copilot#1"));
        assert!(written.contains("[REDACTED]"));
        assert!(!written.contains("Bearer secret"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
