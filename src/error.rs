//! Error handling for the logging socket service.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! carries a stable [`ErrorCode`], a human-readable message and, where one
//! exists, the underlying source error.
//!
//! # Containment
//!
//! Errors fall into two groups:
//!
//! * **Connection-scoped** ([`Error::Transport`], [`Error::ResourceExhausted`]
//!   and [`Error::Io`] raised while serving a client). These terminate the
//!   affected connection and are logged; the acceptor and every other
//!   connection keep running. See [`Error::is_connection_scoped`].
//! * **Startup** errors (bind, log store creation, configuration, signal
//!   registration). These are returned before the accept loop starts and
//!   abort the process.
//!
//! # Example
//!
//! ```no_run
//! use aesd_socket::{Error, Result};
//! use std::fs::File;
//!
//! fn open_backing_file(path: &str) -> Result<File> {
//!     File::open(path).map_err(|err| {
//!         Error::io_with_source(format!("Failed to open log store at {path}"), err)
//!     })
//! }
//! ```

use std::net::SocketAddr;

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error code enum for categorizing and identifying errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    // Configuration errors: 1000-1999
    ConfigInvalid = 1000,
    ConfigParse = 1001,

    // Signal handling errors: 2000-2999
    SignalRegisterFailed = 2000,

    // Transport errors: 4000-4999
    TransportBind = 4000,
    TransportAccept = 4001,
    TransportRead = 4002,
    TransportWrite = 4003,

    // IO errors: 5000-5999
    IoError = 5000,
    LogStoreCreate = 5001,
    LogStoreWrite = 5002,
    LogStoreRead = 5003,
    LogStoreLocked = 5004,
    PidFile = 5005,

    // Runtime errors: 6000-6999
    RuntimeJoin = 6000,
    RuntimeStart = 6001,
    DaemonizeFailed = 6002,

    // Resource errors: 7000-7999
    ResourceExhaustedMemory = 7000,

    // Timeout errors: 8000-8999
    TimeoutOperation = 8000,

    // State errors: 9000-9999
    InvalidStateValue = 9000,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_str(), *self as i32)
    }
}

impl ErrorCode {
    /// Convert error code to string representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ConfigParse => "CONFIG_PARSE",

            Self::SignalRegisterFailed => "SIGNAL_REGISTER_FAILED",

            Self::TransportBind => "TRANSPORT_BIND",
            Self::TransportAccept => "TRANSPORT_ACCEPT",
            Self::TransportRead => "TRANSPORT_READ",
            Self::TransportWrite => "TRANSPORT_WRITE",

            Self::IoError => "IO_ERROR",
            Self::LogStoreCreate => "LOG_STORE_CREATE",
            Self::LogStoreWrite => "LOG_STORE_WRITE",
            Self::LogStoreRead => "LOG_STORE_READ",
            Self::LogStoreLocked => "LOG_STORE_LOCKED",
            Self::PidFile => "PID_FILE",

            Self::RuntimeJoin => "RUNTIME_JOIN",
            Self::RuntimeStart => "RUNTIME_START",
            Self::DaemonizeFailed => "DAEMONIZE_FAILED",

            Self::ResourceExhaustedMemory => "RESOURCE_EXHAUSTED_MEMORY",

            Self::TimeoutOperation => "TIMEOUT_OPERATION",

            Self::InvalidStateValue => "INVALID_STATE_VALUE",
        }
    }
}

/// Comprehensive error type for all service operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error [{code}]: {message}")]
    Config {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Signal handling errors
    #[error("Signal handling error [{code}]: {message}")]
    Signal {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Signal number if applicable
        signal: Option<i32>,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Accept, read or write failure on a socket
    #[error("Transport error [{code}]: {message}{}", peer_suffix(.peer))]
    Transport {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Remote peer, when the failure belongs to an accepted connection
        peer: Option<SocketAddr>,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Log store and filesystem errors
    #[error("I/O error [{code}]: {message}")]
    Io {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Resource exhaustion errors
    #[error("Resource exhausted [{code}]: {resource} - {message}")]
    ResourceExhausted {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Type of resource exhausted
        resource: String,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Timeout errors
    #[error("Operation timed out [{code}] after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid state errors
    #[error("Invalid state [{code}]: {message}")]
    InvalidState {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
    },

    /// Runtime errors
    #[error("Runtime error [{code}]: {message}")]
    Runtime {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

fn peer_suffix(peer: &Option<SocketAddr>) -> String {
    peer.map(|p| format!(" (peer {p})")).unwrap_or_default()
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            code: ErrorCode::ConfigInvalid,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new signal registration error for a signal number.
    pub fn signal_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        signal: i32,
        source: E,
    ) -> Self {
        Self::Signal {
            code: ErrorCode::SignalRegisterFailed,
            message: message.into(),
            signal: Some(signal),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new transport error with the failing socket operation's source.
    pub fn transport<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        code: ErrorCode,
        message: S,
        peer: Option<SocketAddr>,
        source: E,
    ) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            peer,
            source: Some(Box::new(source)),
        }
    }

    /// Create a new I/O error with source error.
    pub fn io_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::io_with_code(ErrorCode::IoError, message, source)
    }

    /// Create a new I/O error with a specific code and source error.
    pub fn io_with_code<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        code: ErrorCode,
        message: S,
        source: E,
    ) -> Self {
        Self::Io {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new runtime error with source error.
    pub fn runtime_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        code: ErrorCode,
        message: S,
        source: E,
    ) -> Self {
        Self::Runtime {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new resource exhausted error.
    pub fn resource_exhausted<S: Into<String>, M: Into<String>>(resource: S, message: M) -> Self {
        Self::ResourceExhausted {
            code: ErrorCode::ResourceExhaustedMemory,
            resource: resource.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            code: ErrorCode::TimeoutOperation,
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new invalid state error.
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            code: ErrorCode::InvalidStateValue,
            message: message.into(),
        }
    }

    /// The stable code attached to this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Config { code, .. }
            | Self::Signal { code, .. }
            | Self::Transport { code, .. }
            | Self::Io { code, .. }
            | Self::ResourceExhausted { code, .. }
            | Self::Timeout { code, .. }
            | Self::InvalidState { code, .. }
            | Self::Runtime { code, .. } => *code,
        }
    }

    /// Whether this error only affects the connection that raised it.
    #[must_use]
    pub const fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ResourceExhausted { .. } | Self::Io { .. }
        )
    }

    /// Check if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is configuration-related.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Get the error category for logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Signal { .. } => "signal",
            Self::Transport { .. } => "transport",
            Self::Io { .. } => "io",
            Self::ResourceExhausted { .. } => "resource",
            Self::Timeout { .. } => "timeout",
            Self::InvalidState { .. } => "state",
            Self::Runtime { .. } => "runtime",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_with_source("I/O operation failed", err)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config {
            code: ErrorCode::ConfigParse,
            message: format!("Configuration loading failed: {err}"),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("test message");
        assert!(err.is_config_error());
        assert_eq!(err.category(), "config");
        assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    }

    #[test]
    fn test_connection_scoped_errors() {
        let peer: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::transport(ErrorCode::TransportRead, "read failed", Some(peer), io_err);
        assert!(err.is_connection_scoped());
        assert!(err.to_string().contains("127.0.0.1:4242"));

        assert!(Error::resource_exhausted("receive buffer", "oom").is_connection_scoped());
        assert!(!Error::config("bad").is_connection_scoped());
    }

    #[test]
    fn test_timeout_error() {
        let err = Error::timeout("drain handlers", 5000);
        assert!(err.is_timeout());
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), ErrorCode::IoError);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::LogStoreLocked.to_string(), "LOG_STORE_LOCKED(5004)");
    }
}
