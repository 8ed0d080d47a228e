//! HTTP request handlers.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::recorder::{redact_headers, Capture};
use super::server::AppState;
use super::stream;
use super::types::ChatCompletionRequest;
use crate::error::Error;
use crate::provider::{Endpoint, RequestContext};

/// Handle POST /chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, Error> {
    authorize(&state, &headers)?;

    let is_streaming = request.stream.unwrap_or(false);
    let ctx = RequestContext {
        endpoint: Endpoint::ChatCompletions,
        accept: if is_streaming {
            "text/event-stream".to_string()
        } else {
            "application/json".to_string()
        },
        stream: is_streaming,
    };

    tracing::info!(
        model = %request.model,
        stream = is_streaming,
        "received chat completion request"
    );

    let success = state.registry.execute_chat(&ctx, &request).await?;
    let upstream_status = success.response.status();
    let status =
        StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::OK);

    if is_streaming {
        if let Some(recorder) = &state.recorder {
            recorder.record(Capture {
                timestamp: chrono::Utc::now().to_rfc3339(),
                endpoint: ctx.endpoint.path().to_string(),
                provider: Some(success.provider.clone()),
                status: status.as_u16(),
                request_headers: redact_headers(&headers),
                request_body: serde_json::to_value(&request).unwrap_or_default(),
                response_body: None,
            });
        }

        let body = Body::from_stream(stream::relay(success.response.bytes_stream()));
        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    } else {
        let bytes = success
            .response
            .bytes()
            .await
            .map_err(|e| Error::UpstreamTransport(e.to_string()))?;

        if let Some(recorder) = &state.recorder {
            recorder.record(Capture {
                timestamp: chrono::Utc::now().to_rfc3339(),
                endpoint: ctx.endpoint.path().to_string(),
                provider: Some(success.provider.clone()),
                status: status.as_u16(),
                request_headers: redact_headers(&headers),
                request_body: serde_json::to_value(&request).unwrap_or_default(),
                response_body: serde_json::from_slice(&bytes).ok(),
            });
        }

        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }
}

/// Handle GET /models - union of models across providers.
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    authorize(&state, &headers)?;

    let models = state.registry.list_models().await?;
    Ok(Json(serde_json::json!({
        "object": "list",
        "data": models,
    }))
    .into_response())
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "octogate"
    }))
}

/// When a master key is configured, inbound requests must present it as a
/// bearer token. Without one, any (or no) Authorization header is accepted:
/// the gateway always authenticates upstream with its own credentials.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Error> {
    let Some(master_key) = &state.config.master_key else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if key == master_key.expose_secret() => Ok(()),
        _ => Err(Error::Unauthorized),
    }
}
