//! Configuration structures for the ssr-bridge.
//!
//! This module defines configuration options for various components:
//! - [`BridgeConfig`]: Top-level configuration containing all settings
//! - [`WorkerConfig`]: Embedded runtime and worker thread settings
//! - [`RenderConfig`]: Per-request rendering settings

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::BridgeError;

/// Top-level bridge configuration.
///
/// It can be loaded from TOML or JSON, with defaults for every field.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Runtime worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Per-request rendering configuration.
    #[serde(default)]
    pub render: RenderConfig,
}

impl BridgeConfig {
    /// Validate settings that serde defaults cannot guard.
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.worker.validate()?;
        self.render.validate()
    }
}

/// Embedded runtime configuration.
///
/// One worker owns one QuickJS runtime on one dedicated thread.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Directory the render bundle lives in; module specifiers resolve against it.
    #[serde(default = "defaults::script_root")]
    pub script_root: PathBuf,

    /// Render module, relative to `script_root`. Its default export is the handler.
    #[serde(default = "defaults::entry_module")]
    pub entry_module: String,

    /// Import the render module while the worker starts.
    ///
    /// When disabled, the module is imported by the first render.
    #[serde(default = "defaults::warm_on_start")]
    pub warm_on_start: bool,

    /// Runtime heap limit in megabytes (0 = unlimited).
    #[serde(default = "defaults::memory_limit_mb")]
    pub memory_limit_mb: u32,

    /// Maximum runtime stack size in kilobytes (0 = engine default).
    #[serde(default = "defaults::max_stack_kb")]
    pub max_stack_kb: u32,

    /// Name of the dedicated runtime thread.
    #[serde(default = "defaults::thread_name")]
    pub thread_name: String,

    /// Global name the host function table is published under.
    #[serde(default = "defaults::interop_global")]
    pub interop_global: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script_root: defaults::script_root(),
            entry_module: defaults::entry_module(),
            warm_on_start: defaults::warm_on_start(),
            memory_limit_mb: defaults::memory_limit_mb(),
            max_stack_kb: defaults::max_stack_kb(),
            thread_name: defaults::thread_name(),
            interop_global: defaults::interop_global(),
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration for a script root, other fields defaulted.
    pub fn for_root(script_root: impl Into<PathBuf>) -> Self {
        Self {
            script_root: script_root.into(),
            ..Self::default()
        }
    }

    /// Runtime heap limit in bytes, if limited.
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb as usize * 1024 * 1024)
    }

    /// Runtime stack limit in bytes, if configured.
    pub fn max_stack_bytes(&self) -> Option<usize> {
        (self.max_stack_kb > 0).then(|| self.max_stack_kb as usize * 1024)
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.entry_module.trim().is_empty() {
            return Err(BridgeError::invalid_config("worker.entry_module is empty"));
        }
        if self.interop_global.trim().is_empty() {
            return Err(BridgeError::invalid_config("worker.interop_global is empty"));
        }
        Ok(())
    }
}

/// Per-request rendering configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Content type used when the handler's response has no `content-type` header.
    #[serde(default = "defaults::default_content_type")]
    pub default_content_type: String,

    /// Initial capacity of each pooled chunk buffer, in bytes.
    #[serde(default = "defaults::buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum number of idle buffers kept by the pool.
    #[serde(default = "defaults::max_pooled_buffers")]
    pub max_pooled_buffers: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            default_content_type: defaults::default_content_type(),
            buffer_capacity: defaults::buffer_capacity(),
            max_pooled_buffers: defaults::max_pooled_buffers(),
        }
    }
}

impl RenderConfig {
    fn validate(&self) -> Result<(), BridgeError> {
        if self.buffer_capacity == 0 {
            return Err(BridgeError::invalid_config(
                "render.buffer_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Default value functions for serde.
mod defaults {
    use std::path::PathBuf;

    pub fn script_root() -> PathBuf {
        PathBuf::from("./web")
    }

    pub fn entry_module() -> String {
        "./build/server/index.js".to_string()
    }

    pub const fn warm_on_start() -> bool {
        true
    }

    pub const fn memory_limit_mb() -> u32 {
        256
    }

    pub const fn max_stack_kb() -> u32 {
        1024
    }

    pub fn thread_name() -> String {
        "ssr-runtime".to_string()
    }

    pub fn interop_global() -> String {
        "host".to_string()
    }

    pub fn default_content_type() -> String {
        "text/html; charset=utf-8".to_string()
    }

    pub const fn buffer_capacity() -> usize {
        16 * 1024
    }

    pub const fn max_pooled_buffers() -> usize {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();

        assert_eq!(config.worker.script_root, PathBuf::from("./web"));
        assert_eq!(config.worker.entry_module, "./build/server/index.js");
        assert!(config.worker.warm_on_start);
        assert_eq!(config.worker.memory_limit_mb, 256);
        assert_eq!(config.worker.interop_global, "host");

        assert_eq!(
            config.render.default_content_type,
            "text/html; charset=utf-8"
        );
        assert_eq!(config.render.buffer_capacity, 16 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: BridgeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.worker.entry_module, deserialized.worker.entry_module);
        assert_eq!(
            config.render.max_pooled_buffers,
            deserialized.render.max_pooled_buffers
        );
    }

    #[test]
    fn test_limits_in_bytes() {
        let config = WorkerConfig {
            memory_limit_mb: 2,
            max_stack_kb: 0,
            ..Default::default()
        };

        assert_eq!(config.memory_limit_bytes(), Some(2 * 1024 * 1024));
        assert_eq!(config.max_stack_bytes(), None);

        let unlimited = WorkerConfig {
            memory_limit_mb: 0,
            ..Default::default()
        };
        assert_eq!(unlimited.memory_limit_bytes(), None);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"worker": {"warm_on_start": false}}"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();

        assert!(!config.worker.warm_on_start);
        assert_eq!(config.worker.thread_name, "ssr-runtime");
        assert_eq!(config.render.buffer_capacity, 16 * 1024);
    }

    #[test]
    fn test_validate_rejects_empty_entry() {
        let mut config = BridgeConfig::default();
        config.worker.entry_module = "  ".into();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.render.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_root() {
        let config = WorkerConfig::for_root("/srv/app");
        assert_eq!(config.script_root, PathBuf::from("/srv/app"));
        assert!(config.warm_on_start);
    }
}
