//! Admin API for token management
//!
//! Runs on a separate listener (`proxy.admin_addr`) and is disabled when that
//! address is unset. Secrets go in, never out.
//!
//! Endpoints:
//! - GET    /admin/tokens       list every token with state, reset time and quota
//! - POST   /admin/tokens       add a token, body `{"secret": "..."}`
//! - DELETE /admin/tokens/{id}  remove a token from either set
//! - POST   /admin/rotate       force selection of the next token
//! - GET    /admin/pool         pool health summary

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use copilot_pool::TokenManager;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    manager: Arc<TokenManager>,
}

impl AdminState {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        Self { manager }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens", get(list_tokens).post(add_token))
        .route("/admin/tokens/{id}", delete(delete_token))
        .route("/admin/rotate", post(rotate))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/tokens
async fn list_tokens(State(state): State<AdminState>) -> impl IntoResponse {
    match state.manager.list_status().await {
        Ok(tokens) => json_response(StatusCode::OK, serde_json::json!({ "tokens": tokens })),
        Err(e) => {
            warn!(error = %e, "failed to list tokens");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

#[derive(Deserialize)]
struct AddTokenRequest {
    secret: String,
}

/// POST /admin/tokens
async fn add_token(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddTokenRequest>,
) -> impl IntoResponse {
    let secret = body.secret.trim();
    if secret.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "secret must not be empty" }),
        );
    }

    match state.manager.add_token(secret).await {
        Ok(id) => {
            info!(token_id = id, "token added via admin API");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "id": id, "status": "added" }),
            )
        }
        Err(e) => {
            warn!(error = %e, "failed to add token");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// DELETE /admin/tokens/{id}
async fn delete_token(State(state): State<AdminState>, Path(id): Path<u64>) -> impl IntoResponse {
    match state.manager.remove_token(id).await {
        Ok(true) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "removed" }),
        ),
        Ok(false) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("token {id} not found") }),
        ),
        Err(e) => {
            warn!(token_id = id, error = %e, "failed to remove token");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// POST /admin/rotate
async fn rotate(State(state): State<AdminState>) -> impl IntoResponse {
    let max = state.manager.settings().max_rotation_attempts;
    match state.manager.rotate(max).await {
        Ok(record) => {
            info!(token_id = record.id, "manual rotation");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "current": record.id, "status": "rotated" }),
            )
        }
        Err(e) if e.is_no_token() => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e) => {
            warn!(error = %e, "manual rotation failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.manager.health().await)
}
