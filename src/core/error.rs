//! Unified error handling for the proxy.
//!
//! A single crate-wide error type keeps modules from having to depend on each
//! other's error representations.

use std::fmt;

/// Unified error types for the proxy.
#[derive(Debug)]
pub enum ProxyError {
    /// Configuration-related errors (missing/invalid fields, bad JSON).
    Configuration(String),

    /// Network and I/O errors.
    Network(std::io::Error),

    /// An I/O deadline (connect/send/read/idle) was exceeded.
    Timeout(String),

    /// The client sent a request the handler couldn't parse.
    MalformedRequest(String),

    /// Cache snapshot encode/decode failures. Never fatal; logged and ignored.
    Cache(String),

    /// Blacklist pattern compilation failures.
    Blacklist(String),

    /// Anything unexpected inside a connection worker.
    Handler(String),

    /// Internal system errors.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            ProxyError::Network(err) => write!(f, "network error: {err}"),
            ProxyError::Timeout(msg) => write!(f, "timeout: {msg}"),
            ProxyError::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            ProxyError::Cache(msg) => write!(f, "cache error: {msg}"),
            ProxyError::Blacklist(msg) => write!(f, "blacklist error: {msg}"),
            ProxyError::Handler(msg) => write!(f, "handler error: {msg}"),
            ProxyError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Network(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            ProxyError::Timeout(err.to_string())
        } else {
            ProxyError::Network(err)
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout(err.to_string())
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Helper trait for adding context to errors.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ProxyResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation, following the same shape as the
/// original single-variant constructors.
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::ProxyError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ProxyError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::ProxyError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ProxyError::Internal(format!($fmt, $($arg)*))
    };
}
