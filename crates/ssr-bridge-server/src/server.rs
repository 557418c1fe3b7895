//! HTTP server implementation.
//!
//! This module provides the main [`BridgeServer`] struct for running
//! the ssr-bridge HTTP server.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use ssr_bridge_common::{AdminConfig, BridgeConfig, BridgeError, ServerConfigFile};

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Time allowed until the response head is sent, in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` section of a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not parse.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, BridgeError> {
        let bind_addr = file.bind_addr.parse().map_err(|e| {
            BridgeError::invalid_config(format!("server.bind_addr '{}': {e}", file.bind_addr))
        })?;
        Ok(Self {
            bind_addr,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// SSR bridge HTTP server.
///
/// This is the main entry point for running the HTTP server.
///
/// # Example
///
/// ```ignore
/// use ssr_bridge_common::BridgeConfig;
/// use ssr_bridge_server::{BridgeServer, ServerConfig};
///
/// let bridge_config = BridgeConfig::default();
/// let server = BridgeServer::new(&bridge_config, ServerConfig::default())?;
/// server.run().await?;
/// ```
pub struct BridgeServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
    /// Admin API configuration, if enabled.
    admin: Option<AdminRouterConfig>,
}

impl BridgeServer {
    /// Create a new server instance.
    ///
    /// Starts the runtime worker and blocks until it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime worker cannot be started.
    pub fn new(bridge_config: &BridgeConfig, server_config: ServerConfig) -> Result<Self, BridgeError> {
        Ok(Self::with_state(AppState::new(bridge_config)?, server_config))
    }

    /// Create a server around existing state.
    pub fn with_state(state: AppState, config: ServerConfig) -> Self {
        Self {
            state,
            config,
            admin: None,
        }
    }

    /// Enable the Admin API.
    ///
    /// # Errors
    ///
    /// Returns an error if the Admin API is enabled without a token.
    pub fn with_admin(mut self, admin: &AdminConfig) -> Result<Self, BridgeError> {
        if !admin.enabled {
            return Ok(self);
        }
        let Some(token) = admin.token.clone().filter(|t| !t.is_empty()) else {
            return Err(BridgeError::invalid_config(
                "admin.token is required when the Admin API is enabled",
            ));
        };
        self.admin = Some(AdminRouterConfig {
            prefix: admin.prefix.clone(),
            token,
        });
        Ok(self)
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled. The runtime worker
    /// is disposed afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), BridgeError> {
        let app = build_router_with_admin(
            self.state.clone(),
            self.config.request_timeout(),
            self.admin.clone(),
        );

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                BridgeError::server_io(format!("binding {}", self.config.bind_addr), &e)
            })?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        let served = if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        } else {
            axum::serve(listener, app).await
        };

        self.state.shutdown().await;
        served.map_err(|e| BridgeError::server_io("serving", &e))?;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0) and
    /// returns a handle that can be used to get the actual address
    /// and shut down the server.
    pub async fn start_test(bridge_config: &BridgeConfig) -> Result<TestHandle, BridgeError> {
        Self::start_test_with_admin(bridge_config, None).await
    }

    /// Start a test server with the Admin API mounted under `admin.prefix`.
    pub async fn start_test_with_admin(
        bridge_config: &BridgeConfig,
        admin: Option<AdminRouterConfig>,
    ) -> Result<TestHandle, BridgeError> {
        let state = AppState::start(bridge_config).await?;
        let app = build_router_with_admin(state.clone(), Duration::from_secs(30), admin);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| BridgeError::server_io("binding 127.0.0.1:0", &e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::server_io("reading the local address", &e))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state.
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully and dispose the worker.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
        self.state.shutdown().await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_builder() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let config = ServerConfig::default()
            .with_bind_addr(addr)
            .with_timeout(60);

        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[tokio::test]
    async fn test_run_reports_bind_failure_as_server_io() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.js"), "export default () => new Response('ok');")
            .unwrap();
        let bridge_config = BridgeConfig {
            worker: ssr_bridge_common::WorkerConfig {
                entry_module: "./index.js".to_string(),
                ..ssr_bridge_common::WorkerConfig::for_root(dir.path())
            },
            ..Default::default()
        };

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let state = AppState::start(&bridge_config).await.unwrap();
        let server = BridgeServer::with_state(
            state.clone(),
            ServerConfig {
                bind_addr: addr,
                request_timeout_secs: 5,
                graceful_shutdown: false,
            },
        );

        let err = server.run().await.unwrap_err();

        assert!(matches!(err, BridgeError::ServerIo { .. }), "{err}");
        assert!(err.to_string().contains(&addr.to_string()), "{err}");
        state.shutdown().await;
    }

    #[test]
    fn test_server_config_from_file() {
        let file = ServerConfigFile {
            bind_addr: "127.0.0.1:9000".to_string(),
            request_timeout_secs: 5,
            graceful_shutdown: false,
        };
        let config = ServerConfig::from_file(&file).unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));

        let bad = ServerConfigFile {
            bind_addr: "nope".to_string(),
            ..file
        };
        assert!(matches!(
            ServerConfig::from_file(&bad),
            Err(BridgeError::InvalidConfig { .. })
        ));
    }
}
