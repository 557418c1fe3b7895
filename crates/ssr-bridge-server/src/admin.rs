//! Admin API handlers for worker management.
//!
//! This module provides HTTP handlers for inspecting and managing the
//! runtime worker and the renders it is serving.
//!
//! # Authentication
//!
//! All Admin API endpoints require the `X-Admin-Token` header
//! to match the configured admin token.
//!
//! # Endpoints
//!
//! - `GET /admin/worker` - Worker counters
//! - `POST /admin/worker/reset` - Replace the worker and re-import the render module
//! - `GET /admin/renders` - List in-flight renders
//! - `DELETE /admin/renders/:id` - Cancel an in-flight render

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use ssr_bridge_core::{RuntimeWorker, WorkerStatsSnapshot};

use crate::response::BridgeHttpResponse;
use crate::state::AppState;

/// Admin API state containing app state and auth token.
#[derive(Clone)]
pub struct AdminState {
    /// Application state (worker, in-flight renders).
    pub app_state: AppState,
    /// Expected admin token for authentication.
    pub admin_token: String,
}

/// Worker information for API responses.
#[derive(Serialize)]
pub struct WorkerInfo {
    /// Render module the worker imports.
    pub entry_module: String,
    /// Whether the worker was disposed.
    pub disposed: bool,
    /// Worker counters.
    pub stats: WorkerStatsSnapshot,
    /// Chunk buffers currently rented.
    pub buffers_outstanding: usize,
    /// Renders currently in flight.
    pub renders_in_flight: usize,
}

impl WorkerInfo {
    fn new(worker: &RuntimeWorker, renders_in_flight: usize) -> Self {
        Self {
            entry_module: worker.entry_module().to_string(),
            disposed: worker.is_disposed(),
            stats: worker.stats(),
            buffers_outstanding: worker.buffer_pool().outstanding(),
            renders_in_flight,
        }
    }
}

/// Build the Admin API router.
///
/// Returns a router that uses Extension to pass the admin state,
/// allowing it to be nested into routers with different state types.
pub fn build_admin_router(admin_state: AdminState) -> Router<AppState> {
    Router::new()
        .route("/worker", get(get_worker))
        .route("/worker/reset", post(reset_worker))
        .route("/renders", get(list_renders))
        .route("/renders/:id", delete(cancel_render))
        .layer(Extension(admin_state))
}

/// Verify the admin token from request headers.
fn verify_token(headers: &HeaderMap, expected: &str) -> Result<(), (StatusCode, &'static str)> {
    match headers.get("X-Admin-Token") {
        Some(token) => {
            if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid admin token"))
            }
        }
        None => Err((StatusCode::UNAUTHORIZED, "Missing X-Admin-Token header")),
    }
}

/// Get worker information.
///
/// # Request
///
/// `GET /admin/worker`
///
/// # Response
///
/// ```json
/// {
///   "entry_module": "./build/server/index.js",
///   "disposed": false,
///   "stats": { "module_imports": 1, "renders_started": 12, ... },
///   "buffers_outstanding": 0,
///   "renders_in_flight": 0
/// }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn get_worker(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let state = &admin_state.app_state;
    Json(WorkerInfo::new(&state.worker(), state.list_renders().len())).into_response()
}

/// Replace the worker.
///
/// # Request
///
/// `POST /admin/worker/reset`
///
/// # Response
///
/// The new worker's information, as for `GET /admin/worker`.
#[instrument(skip(admin_state, headers))]
pub async fn reset_worker(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let state = &admin_state.app_state;
    match state.reset_worker().await {
        Ok(worker) => {
            info!(entry_module = %worker.entry_module(), "Worker reset");
            Json(WorkerInfo::new(&worker, state.list_renders().len())).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Worker reset failed");
            BridgeHttpResponse::from_error(&e).into_axum_response()
        }
    }
}

/// List in-flight renders.
///
/// # Request
///
/// `GET /admin/renders`
///
/// # Response
///
/// ```json
/// {
///   "renders": [
///     { "key": "9b1c...", "id": "3f2a...", "method": "GET", "url": "http://localhost/", "elapsed_ms": 12 }
///   ],
///   "count": 1
/// }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn list_renders(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    let renders = admin_state.app_state.list_renders();
    let count = renders.len();

    Json(serde_json::json!({
        "renders": renders,
        "count": count
    }))
    .into_response()
}

/// Cancel an in-flight render.
///
/// `:id` is either a render key or a request id; every render with that
/// request id is cancelled.
///
/// # Request
///
/// `DELETE /admin/renders/:id`
///
/// # Response
///
/// ```json
/// {
///   "id": "3f2a...",
///   "message": "Render cancelled"
/// }
/// ```
#[instrument(skip(admin_state, headers))]
pub async fn cancel_render(
    Extension(admin_state): Extension<AdminState>,
    headers: HeaderMap,
    Path(render_id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = verify_token(&headers, &admin_state.admin_token) {
        return e.into_response();
    }

    if admin_state.app_state.cancel_render(&render_id) {
        info!(id = %render_id, "Render cancelled");
        Json(serde_json::json!({
            "id": render_id,
            "message": "Render cancelled"
        }))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            format!("Render not found: {render_id}"),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Admin-Token", "secret".parse().unwrap());

        let result = verify_token(&headers, "secret");
        assert!(result.is_ok());
    }

    #[test]
    fn test_verify_token_invalid() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Admin-Token", "wrong".parse().unwrap());

        let result = verify_token(&headers, "secret");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_verify_token_missing() {
        let headers = HeaderMap::new();

        let result = verify_token(&headers, "secret");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().0, StatusCode::UNAUTHORIZED);
    }
}
