//! Guest console bridge.
//!
//! `console.*` calls made by scripts are formatted by the prelude and land
//! here as a numeric level plus a message. They are emitted through `tracing`
//! with `guest_log = true` so they can be filtered apart from host logs.

use tracing::{debug, error, info, warn};

/// Log level of a guest console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// `console.debug`
    Debug,
    /// `console.log` and `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Emit a guest console message.
pub fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(guest_log = true, "{}", message),
        LogLevel::Info => info!(guest_log = true, "{}", message),
        LogLevel::Warn => warn!(guest_log = true, "{}", message),
        LogLevel::Error => error!(guest_log = true, "{}", message),
    }
}

/// Convert a numeric level from the prelude to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error; unknown values default to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info); // Unknown defaults to Info
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }

    #[test]
    fn test_emit_does_not_panic() {
        emit(LogLevel::Error, "guest failure");
    }
}
