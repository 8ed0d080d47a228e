//! OpenAI-compatible request types and Copilot body normalisation.
//!
//! The envelope models only the fields the gateway inspects or rewrites
//! (`model`, `messages`, `max_tokens`, `stream`); everything else rides
//! through untouched in `extra` maps, keeping the proxying transparent.

use serde::{Deserialize, Serialize};

/// Copilot rejects `max_tokens` above this cap.
pub const COPILOT_MAX_TOKENS: u32 = 10_240;

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Fields the gateway does not interpret (temperature, top_p, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A chat message. Content is either a plain string or an array of typed
/// parts, per the OpenAI schema.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One element of an array-form `content`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Rewrite a request into the shape Copilot accepts.
///
/// Copilot rejects content arrays whose items carry explicit `type` markers:
/// each array-form `content` is collapsed into a single newline-joined
/// string of its text parts. Non-text parts (images etc.) are dropped with a
/// warning; `max_tokens` is clamped to [`COPILOT_MAX_TOKENS`]. The transform
/// is idempotent.
pub fn normalize_for_copilot(request: &ChatCompletionRequest) -> ChatCompletionRequest {
    let mut normalized = request.clone();

    for message in &mut normalized.messages {
        let MessageContent::Parts(parts) = &message.content else {
            continue;
        };

        let mut texts: Vec<&str> = Vec::with_capacity(parts.len());
        let mut dropped = 0usize;
        for part in parts {
            match (part.kind.as_str(), &part.text) {
                ("text", Some(text)) => texts.push(text),
                _ => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::warn!(
                role = %message.role,
                dropped,
                "dropped non-text content parts; vision passthrough is unsupported"
            );
        }

        message.content = MessageContent::Text(texts.join("\n"));
    }

    if let Some(max_tokens) = normalized.max_tokens {
        if max_tokens > COPILOT_MAX_TOKENS {
            tracing::warn!(
                requested = max_tokens,
                cap = COPILOT_MAX_TOKENS,
                "clamped max_tokens to provider cap"
            );
            normalized.max_tokens = Some(COPILOT_MAX_TOKENS);
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_from_json(json: &str) -> ChatCompletionRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn text_parts_join_with_newline() {
        let request = request_from_json(
            r#"{
                "model": "gpt-4o",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "a"},
                        {"type": "text", "text": "b"}
                    ]
                }]
            }"#,
        );

        let normalized = normalize_for_copilot(&request);
        let wire = serde_json::to_value(&normalized).unwrap();
        assert_eq!(wire["messages"][0]["content"], "a\nb");
    }

    #[test]
    fn non_text_parts_are_dropped() {
        let request = request_from_json(
            r#"{
                "model": "gpt-4o",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "describe this"},
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,xyz"}}
                    ]
                }]
            }"#,
        );

        let normalized = normalize_for_copilot(&request);
        let wire = serde_json::to_value(&normalized).unwrap();
        assert_eq!(wire["messages"][0]["content"], "describe this");
    }

    #[test]
    fn normalisation_is_idempotent() {
        let request = request_from_json(
            r#"{
                "model": "gpt-4o",
                "max_tokens": 99999,
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "a"},
                        {"type": "text", "text": "b"}
                    ]
                }]
            }"#,
        );

        let once = normalize_for_copilot(&request);
        let twice = normalize_for_copilot(&once);
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn string_content_is_untouched() {
        let request = request_from_json(
            r#"{
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hello"}]
            }"#,
        );

        let normalized = normalize_for_copilot(&request);
        let wire = serde_json::to_value(&normalized).unwrap();
        assert_eq!(wire["messages"][0]["content"], "hello");
    }

    #[test]
    fn max_tokens_clamped_to_cap() {
        let request = request_from_json(
            r#"{"model": "gpt-4o", "max_tokens": 50000, "messages": []}"#,
        );
        let normalized = normalize_for_copilot(&request);
        assert_eq!(normalized.max_tokens, Some(COPILOT_MAX_TOKENS));

        let request = request_from_json(
            r#"{"model": "gpt-4o", "max_tokens": 1024, "messages": []}"#,
        );
        let normalized = normalize_for_copilot(&request);
        assert_eq!(normalized.max_tokens, Some(1024));
    }

    #[test]
    fn stream_flag_and_unknown_fields_ride_through() {
        let request = request_from_json(
            r#"{
                "model": "gpt-4o",
                "stream": true,
                "temperature": 0.7,
                "top_p": 0.9,
                "messages": [{"role": "user", "content": "hi", "name": "alice"}]
            }"#,
        );

        let normalized = normalize_for_copilot(&request);
        let wire = serde_json::to_value(&normalized).unwrap();
        assert_eq!(wire["stream"], true);
        assert_eq!(wire["temperature"], 0.7);
        assert_eq!(wire["top_p"], 0.9);
        assert_eq!(wire["messages"][0]["name"], "alice");
    }
}
