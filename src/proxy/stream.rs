//! SSE relay for streaming upstream responses.
//!
//! Chunks are forwarded to the client in arrival order without buffering
//! the body. A read error or idle timeout after the first byte cannot fail
//! over (the client has already seen partial output); instead the relay
//! appends an `event: error` frame and a final `data: [DONE]` so the client
//! observes an orderly shutdown.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

/// Per-chunk idle read timeout.
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
const DONE_MARKER: &[u8] = b"data: [DONE]";

/// Relay an upstream byte stream to the client with the default idle timeout.
pub fn relay<S, E>(upstream: S) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    relay_with_timeout(upstream, IDLE_READ_TIMEOUT)
}

struct RelayState {
    upstream: Option<BoxStream<'static, Result<Bytes, String>>>,
    pending: VecDeque<Bytes>,
    saw_done: bool,
    idle: Duration,
}

pub(crate) fn relay_with_timeout<S, E>(
    upstream: S,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = RelayState {
        upstream: Some(upstream.map(|r| r.map_err(|e| e.to_string())).boxed()),
        pending: VecDeque::new(),
        saw_done: false,
        idle,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            let upstream = state.upstream.as_mut()?;
            let step = tokio::time::timeout(state.idle, upstream.next()).await;

            match step {
                Ok(Some(Ok(chunk))) => {
                    if contains_done_marker(&chunk) {
                        state.saw_done = true;
                    }
                    return Some((Ok(chunk), state));
                }
                Ok(Some(Err(error))) => {
                    tracing::warn!(%error, "upstream stream broke mid-response");
                    state.upstream = None;
                    state.pending.push_back(error_frame(&error));
                    state.pending.push_back(Bytes::from_static(DONE_FRAME));
                }
                Ok(None) => {
                    state.upstream = None;
                    if !state.saw_done {
                        state.pending.push_back(Bytes::from_static(DONE_FRAME));
                    }
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        idle_secs = state.idle.as_secs(),
                        "idle timeout waiting for upstream chunk"
                    );
                    state.upstream = None;
                    state
                        .pending
                        .push_back(error_frame("idle read timeout waiting for upstream"));
                    state.pending.push_back(Bytes::from_static(DONE_FRAME));
                }
            }
        }
    })
}

/// SSE frame surfacing a truncated stream to the client.
fn error_frame(message: &str) -> Bytes {
    let payload = serde_json::json!({
        "error": {
            "message": message,
            "type": "stream_truncated",
        }
    });
    Bytes::from(format!("event: error\ndata: {}\n\n", payload))
}

fn contains_done_marker(chunk: &Bytes) -> bool {
    chunk
        .windows(DONE_MARKER.len())
        .any(|window| window == DONE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect<S>(stream: S) -> Vec<Bytes>
    where
        S: Stream<Item = Result<Bytes, std::convert::Infallible>>,
    {
        stream.map(|r| r.unwrap()).collect().await
    }

    fn ok(chunk: &str) -> Result<Bytes, String> {
        Ok(Bytes::from(chunk.to_string()))
    }

    #[tokio::test]
    async fn chunks_relayed_in_order() {
        let chunks = vec![
            ok("data: {\"n\":1}\n\n"),
            ok("data: {\"n\":2}\n\n"),
            ok("data: {\"n\":3}\n\n"),
            ok("data: [DONE]\n\n"),
        ];
        let out = collect(relay(futures::stream::iter(chunks))).await;

        assert_eq!(out.len(), 4);
        assert_eq!(&out[0][..], b"data: {\"n\":1}\n\n");
        assert_eq!(&out[1][..], b"data: {\"n\":2}\n\n");
        assert_eq!(&out[2][..], b"data: {\"n\":3}\n\n");
        assert_eq!(&out[3][..], b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn done_appended_when_upstream_omits_it() {
        let chunks = vec![ok("data: {\"n\":1}\n\n")];
        let out = collect(relay(futures::stream::iter(chunks))).await;

        assert_eq!(out.len(), 2);
        assert_eq!(&out[1][..], DONE_FRAME);
    }

    #[tokio::test]
    async fn done_not_duplicated() {
        let chunks = vec![ok("data: x\n\n"), ok("data: [DONE]\n\n")];
        let out = collect(relay(futures::stream::iter(chunks))).await;

        let done_frames = out
            .iter()
            .filter(|c| contains_done_marker(c))
            .count();
        assert_eq!(done_frames, 1);
    }

    #[tokio::test]
    async fn mid_stream_error_appends_error_frame_then_done() {
        let chunks = vec![ok("data: {\"n\":1}\n\n"), Err("connection reset".to_string())];
        let out = collect(relay(futures::stream::iter(chunks))).await;

        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..], b"data: {\"n\":1}\n\n");
        let error_text = std::str::from_utf8(&out[1]).unwrap();
        assert!(error_text.starts_with("event: error\ndata: "));
        assert!(error_text.contains("stream_truncated"));
        assert!(error_text.contains("connection reset"));
        assert_eq!(&out[2][..], DONE_FRAME);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_truncates_stream() {
        // An upstream that never yields: the relay gives up after the idle
        // timeout and closes with an error frame.
        let upstream = futures::stream::pending::<Result<Bytes, String>>();
        let out = collect(relay_with_timeout(upstream, Duration::from_secs(30))).await;

        assert_eq!(out.len(), 2);
        let error_text = std::str::from_utf8(&out[0]).unwrap();
        assert!(error_text.contains("idle read timeout"));
        assert_eq!(&out[1][..], DONE_FRAME);
    }

    #[tokio::test]
    async fn done_marker_detected_without_trailing_newlines() {
        assert!(contains_done_marker(&Bytes::from_static(b"data: [DONE]")));
        assert!(contains_done_marker(&Bytes::from_static(
            b"data: {\"x\":1}\n\ndata: [DONE]\n\n"
        )));
        assert!(!contains_done_marker(&Bytes::from_static(b"data: {}\n\n")));
    }
}
