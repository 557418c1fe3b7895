//! Request handlers for rendering.
//!
//! This module provides the catch-all render handler plus health and
//! readiness checks.

use std::io;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument};

use ssr_bridge_common::BridgeError;

use crate::request::{REQUEST_ID, request_context};
use crate::response::{
    BridgeHttpResponse, CLIENT_CLOSED_REQUEST, GuardedStream, StreamingParts, StreamingSink,
    streaming_response,
};
use crate::state::AppState;

/// Render a page for an HTTP request.
///
/// This handler:
/// 1. Converts the request into a `RequestContext`
/// 2. Starts the render on the runtime worker with a streaming sink
/// 3. Answers with the streamed body once the response head is known, or
///    with a JSON error if the render failed before that
///
/// Dropping this handler or the response body cancels the render.
#[instrument(skip(state, req), fields(method = %req.method(), path = %req.uri().path()))]
pub async fn render_page(State(state): State<AppState>, req: Request) -> Response<Body> {
    let context = request_context(&req);
    let request_id = context.id.clone();
    let guard = context.cancellation.clone().drop_guard();
    let tracked = state.track(&context);
    let worker = state.worker();

    let (sink, parts) = StreamingSink::new();
    let StreamingParts { head, body, abort } = parts;
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = worker.render(context, sink).await;
        drop(tracked);
        if let Err(e) = &result {
            // Terminates a body that is already streaming.
            let _ = abort.send(Err(io::Error::other(e.to_string()))).await;
        }
        drop(abort);
        let _ = done_tx.send(result);
    });

    if let Ok(head) = head.await {
        info!(request_id = %request_id, status = head.status, "Streaming response");
        return streaming_response(&head, &request_id, GuardedStream::new(body, guard));
    }

    let response = match done_rx.await {
        Ok(Err(e)) => {
            error!(request_id = %request_id, error = %e, kind = %e.kind(), "Render failed");
            BridgeHttpResponse::from_error(&e)
        }
        Ok(Ok(outcome)) if outcome.is_cancelled() => {
            debug!(request_id = %request_id, "Render cancelled before the response head");
            BridgeHttpResponse::error(CLIENT_CLOSED_REQUEST, "cancelled", "render cancelled")
        }
        Ok(Ok(_)) => BridgeHttpResponse::error(
            500,
            "protocol_violation",
            "render ended without a response head",
        ),
        Err(_) => BridgeHttpResponse::from_error(&BridgeError::WorkerTerminated),
    };
    drop(guard);
    response
        .with_header(REQUEST_ID, &request_id)
        .into_axum_response()
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK once the worker is running and its render module did not
/// fail to import, 503 otherwise.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let worker = state.worker();
    let stats = worker.stats();
    let ready = state.is_ready();

    let body = serde_json::json!({
        "status": if ready { "ready" } else { "unavailable" },
        "entry_module": worker.entry_module(),
        "handler_ready": stats.handler_ready,
        "import_failed": stats.import_failed,
        "disposed": worker.is_disposed(),
    });

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body))
}
