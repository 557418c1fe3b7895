//! Error types for the ssr-bridge.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`BridgeError`]: Top-level errors crossing the runtime boundary
//! - [`InteropError`]: Errors from host-native functions published to scripts
//! - [`SinkError`]: Errors from the outbound response sink

use std::io;

use thiserror::Error;

/// Top-level bridge errors.
///
/// Exceptions raised inside the embedded runtime are converted into these
/// values at the boundary, carrying a message and a [`ErrorKind`].
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// The render module could not be imported, or its default export is not
    /// a function.
    #[error("Import of '{specifier}' failed: {reason}")]
    ImportFailure {
        /// The module specifier that was imported.
        specifier: String,
        /// Description of the failure.
        reason: String,
    },

    /// The render handler threw or its promise rejected.
    #[error("Render handler failed: {message}")]
    InvocationFailure {
        /// The exception message (and stack, when available).
        message: String,
    },

    /// The render handler produced a value without the expected response shape.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// What was missing or malformed.
        reason: String,
    },

    /// Draining the response body failed part way through.
    #[error("Stream error: {message}")]
    StreamError {
        /// Description of the failure.
        message: String,
    },

    /// The worker was used after it was disposed.
    #[error("Runtime worker has been disposed")]
    Disposed,

    /// The runtime thread stopped without answering a scheduled task.
    #[error("Runtime worker thread terminated unexpectedly")]
    WorkerTerminated,

    /// The embedded runtime or its thread could not be created.
    #[error("Runtime initialization failed: {reason}")]
    RuntimeInit {
        /// Description of the initialization failure.
        reason: String,
    },

    /// A host-native function table error.
    #[error("Interop error: {0}")]
    Interop(#[from] InteropError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// The HTTP listener failed to bind or stopped with an I/O error.
    #[error("Server I/O error while {operation}: {reason}")]
    ServerIo {
        /// What the server was doing.
        operation: String,
        /// The underlying I/O error.
        reason: String,
    },
}

/// Classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`BridgeError::ImportFailure`].
    ImportFailure,
    /// See [`BridgeError::InvocationFailure`].
    InvocationFailure,
    /// See [`BridgeError::ProtocolViolation`].
    ProtocolViolation,
    /// See [`BridgeError::StreamError`].
    StreamError,
    /// See [`BridgeError::Disposed`] and [`BridgeError::WorkerTerminated`].
    DisposedUse,
    /// Startup, configuration and interop setup errors.
    Setup,
    /// See [`BridgeError::ServerIo`].
    ServerIo,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ImportFailure => "import_failure",
            ErrorKind::InvocationFailure => "invocation_failure",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::StreamError => "stream_error",
            ErrorKind::DisposedUse => "disposed_use",
            ErrorKind::Setup => "setup",
            ErrorKind::ServerIo => "server_io",
        };
        f.write_str(name)
    }
}

/// Errors from host-native functions.
///
/// The argument errors are raised as JavaScript `TypeError`s inside the
/// runtime; their display text is the exception message scripts see.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InteropError {
    /// The caller passed the wrong number of arguments.
    #[error("wrong number of arguments, expected {expected}, got {actual}")]
    Arity {
        /// Declared parameter count.
        expected: usize,
        /// Number of arguments received.
        actual: usize,
    },

    /// An argument had the wrong type.
    #[error("wrong argument type, expected {expected}")]
    ArgumentType {
        /// Zero-based argument position.
        index: usize,
        /// Name of the expected type.
        expected: &'static str,
    },

    /// The table was already published into this runtime.
    #[error("host table '{global}' is already published")]
    AlreadyPublished {
        /// Global name of the table.
        global: String,
    },

    /// A function with the same name already exists in the namespace.
    #[error("duplicate host function: {name}")]
    Duplicate {
        /// Qualified function name.
        name: String,
    },

    /// The host function itself failed.
    #[error("host function failed: {reason}")]
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors from the outbound response sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The receiving side (usually the HTTP client) has gone away.
    #[error("response sink closed")]
    Closed,

    /// The sink failed to write.
    #[error("response sink I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for SinkError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl BridgeError {
    /// Create a new `ImportFailure` error.
    pub fn import_failure(specifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImportFailure {
            specifier: specifier.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `InvocationFailure` error.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::InvocationFailure {
            message: message.into(),
        }
    }

    /// Create a new `ProtocolViolation` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create a new `StreamError` error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::StreamError {
            message: message.into(),
        }
    }

    /// Create a new `RuntimeInit` error.
    pub fn runtime_init(reason: impl Into<String>) -> Self {
        Self::RuntimeInit {
            reason: reason.into(),
        }
    }

    /// Create a new `ServerIo` error.
    pub fn server_io(operation: impl Into<String>, err: &io::Error) -> Self {
        Self::ServerIo {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ImportFailure { .. } => ErrorKind::ImportFailure,
            Self::InvocationFailure { .. } => ErrorKind::InvocationFailure,
            Self::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Self::StreamError { .. } => ErrorKind::StreamError,
            Self::Disposed | Self::WorkerTerminated => ErrorKind::DisposedUse,
            Self::RuntimeInit { .. } | Self::Interop(_) | Self::InvalidConfig { .. } => {
                ErrorKind::Setup
            }
            Self::ServerIo { .. } => ErrorKind::ServerIo,
        }
    }

    /// Returns `true` if the worker cannot serve further renders after this error.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ImportFailure | ErrorKind::DisposedUse | ErrorKind::Setup
        )
    }
}
