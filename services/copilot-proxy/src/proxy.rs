//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers and hands them to the
//! `RequestHandler`, which owns token selection and retries. The upstream
//! response is returned verbatim, including its status code. Dispatch failures
//! become JSON error bodies.

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use copilot_client::{Error as DispatchError, RequestHandler, UpstreamRequest};
use tracing::{debug, error, instrument, warn};

/// Largest inbound body accepted.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub handler: Arc<dyn RequestHandler>,
}

/// Where to turn off telemetry for a Copilot account.
const TELEMETRY_SETTINGS_URL: &str = "https://github.com/settings/copilot";

/// `{"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}`
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    typed_error_response(status, "proxy_error", message, request_id)
}

fn typed_error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Forward one inbound request and record its outcome.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let upstream = UpstreamRequest {
        method,
        path,
        headers,
        body,
    };

    match state.handler.handle(upstream).await {
        Ok(upstream) => {
            debug!(
                token_id = upstream.token_id,
                attempts = upstream.attempts,
                status = upstream.status.as_u16(),
                "upstream responded"
            );
            let mut response = Response::builder().status(upstream.status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(DispatchError::NoTokenAvailable(msg)) => {
            warn!(reason = %msg, "no token available");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("no token available: {msg}"),
                request_id,
            )
        }
        Err(DispatchError::TelemetryEnabled(token_id)) => {
            warn!(token_id, "refusing request on token with telemetry enabled");
            typed_error_response(
                StatusCode::FORBIDDEN,
                "telemetry_enabled",
                &format!(
                    "token {token_id} has telemetry enabled; disable it at {TELEMETRY_SETTINGS_URL}"
                ),
                request_id,
            )
        }
        Err(e @ DispatchError::UpstreamUnavailable { .. }) => {
            error!(error = %e, "upstream unavailable");
            error_response(StatusCode::BAD_GATEWAY, &e.to_string(), request_id)
        }
        Err(e @ DispatchError::Pool(copilot_pool::Error::Exchange(_))) => {
            error!(error = %e, "token exchange unreachable");
            error_response(StatusCode::BAD_GATEWAY, &e.to_string(), request_id)
        }
        Err(e @ DispatchError::Pool(_)) => {
            error!(error = %e, "token pool failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), request_id)
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
