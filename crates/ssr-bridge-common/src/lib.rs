//! Common types, errors, and configuration for ssr-bridge.
//!
//! This crate provides shared functionality used across the ssr-bridge workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the runtime worker and rendering
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{BridgeConfig, RenderConfig, WorkerConfig};
pub use config_file::{AdminConfig, ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{BridgeError, ErrorKind, InteropError, SinkError};
