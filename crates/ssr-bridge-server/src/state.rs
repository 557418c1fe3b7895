//! Shared application state.
//!
//! This module provides [`AppState`], which holds the runtime worker and the
//! table of in-flight renders shared by all HTTP request handlers.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use ssr_bridge_common::{BridgeConfig, BridgeError};
use ssr_bridge_core::{RequestContext, RuntimeWorker};

/// A render currently in progress.
#[derive(Debug, Clone)]
struct InFlightRender {
    request_id: String,
    method: String,
    url: String,
    started: Instant,
    token: CancellationToken,
}

/// In-flight render information for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct RenderInfo {
    /// Key of the table entry, unique per render.
    pub key: String,
    /// Request id, as sent by the client or generated.
    pub id: String,
    /// HTTP method.
    pub method: String,
    /// Display URL.
    pub url: String,
    /// Time since the render started.
    pub elapsed_ms: u64,
}

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// The runtime worker. Replaced as a whole on reset.
    worker: Arc<RwLock<Arc<RuntimeWorker>>>,

    /// Configuration the worker was created with.
    config: Arc<BridgeConfig>,

    /// In-flight renders (render key -> render). Request ids may repeat.
    renders: Arc<DashMap<String, InFlightRender>>,
}

impl AppState {
    /// Create new application state.
    ///
    /// Starts the runtime worker and blocks until it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot be started.
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let worker = create_worker(config)?;

        Ok(Self {
            worker: Arc::new(RwLock::new(Arc::new(worker))),
            config: Arc::new(config.clone()),
            renders: Arc::new(DashMap::new()),
        })
    }

    /// Create new application state from an async context.
    pub async fn start(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::new(&config))
            .await
            .map_err(|e| BridgeError::runtime_init(format!("worker startup task: {e}")))?
    }

    /// Get the current runtime worker.
    pub fn worker(&self) -> Arc<RuntimeWorker> {
        self.worker.read().clone()
    }

    /// Get the bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns `true` if renders can be served.
    pub fn is_ready(&self) -> bool {
        let worker = self.worker();
        !worker.is_disposed() && !worker.stats().import_failed
    }

    /// Replace the runtime worker with a fresh one.
    ///
    /// The new worker re-imports the render module. The old worker is
    /// disposed; its in-flight renders fail with [`BridgeError::Disposed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the new worker cannot be started. The old worker
    /// keeps serving in that case.
    pub async fn reset_worker(&self) -> Result<Arc<RuntimeWorker>, BridgeError> {
        let config = Arc::clone(&self.config);
        let fresh = tokio::task::spawn_blocking(move || create_worker(&config))
            .await
            .map_err(|e| BridgeError::runtime_init(format!("worker startup task: {e}")))??;
        let fresh = Arc::new(fresh);

        let old = std::mem::replace(&mut *self.worker.write(), Arc::clone(&fresh));
        info!(entry_module = %fresh.entry_module(), "Runtime worker replaced");

        if let Err(e) = tokio::task::spawn_blocking(move || old.dispose()).await {
            warn!(error = %e, "Disposing the previous worker failed");
        }
        Ok(fresh)
    }

    /// Dispose the current worker.
    pub async fn shutdown(&self) {
        let worker = self.worker();
        if let Err(e) = tokio::task::spawn_blocking(move || worker.dispose()).await {
            warn!(error = %e, "Disposing the worker failed");
        }
    }

    /// Register an in-flight render. It is removed when the guard drops.
    pub fn track(&self, request: &RequestContext) -> RenderGuard {
        let key = Uuid::new_v4().to_string();
        self.renders.insert(
            key.clone(),
            InFlightRender {
                request_id: request.id.clone(),
                method: request.method.clone(),
                url: request.url.clone(),
                started: Instant::now(),
                token: request.cancellation.clone(),
            },
        );
        RenderGuard {
            renders: Arc::clone(&self.renders),
            key,
        }
    }

    /// Cancel in-flight renders by render key or request id.
    ///
    /// Every render sharing the request id is cancelled.
    ///
    /// # Returns
    ///
    /// `true` if at least one matching render was in flight.
    pub fn cancel_render(&self, id: &str) -> bool {
        let mut cancelled = false;
        for render in self.renders.iter() {
            if render.key() == id || render.request_id == id {
                render.token.cancel();
                cancelled = true;
            }
        }
        cancelled
    }

    /// List all in-flight renders.
    pub fn list_renders(&self) -> Vec<RenderInfo> {
        self.renders
            .iter()
            .map(|r| RenderInfo {
                key: r.key().clone(),
                id: r.request_id.clone(),
                method: r.method.clone(),
                url: r.url.clone(),
                elapsed_ms: u64::try_from(r.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
            .collect()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("worker", &self.worker.read())
            .field("renders_in_flight", &self.renders.len())
            .finish_non_exhaustive()
    }
}

/// Removes a render from the in-flight table when dropped.
#[derive(Debug)]
pub struct RenderGuard {
    renders: Arc<DashMap<String, InFlightRender>>,
    key: String,
}

impl Drop for RenderGuard {
    fn drop(&mut self) {
        self.renders.remove(&self.key);
    }
}

fn create_worker(config: &BridgeConfig) -> Result<RuntimeWorker, BridgeError> {
    let interop = ssr_bridge_host::registry(&config.worker.interop_global)?;
    RuntimeWorker::create(config, interop)
}
