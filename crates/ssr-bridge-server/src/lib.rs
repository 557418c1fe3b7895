//! HTTP Server for ssr-bridge.
//!
//! This crate serves server-side rendered pages produced by the embedded
//! runtime. It handles:
//!
//! - HTTP request routing
//! - Request conversion and streamed response bodies
//! - Client disconnects, which cancel the render
//! - Health and readiness checks
//! - The Admin API (worker stats, reset, in-flight renders)
//!
//! # Quick Start
//!
//! ```ignore
//! use ssr_bridge_common::BridgeConfig;
//! use ssr_bridge_server::{BridgeServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge_config = BridgeConfig::default();
//!     let server_config = ServerConfig::default();
//!
//!     let server = BridgeServer::new(&bridge_config, server_config)?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use router::AdminRouterConfig;
pub use server::{BridgeServer, ServerConfig, TestHandle};
pub use state::AppState;
