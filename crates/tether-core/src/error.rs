//! Error types for tether.
//!
//! One enum covers every failure a caller can observe, from socket dials
//! through frame parsing to the failover layer. Adapters convert low-level
//! I/O and serialization errors into these variants before returning.

use crate::event::Event;
use std::time::Duration;
use thiserror::Error;

/// Main error type for tether operations.
#[derive(Debug, Error)]
pub enum TetherError {
    // Connection lifecycle
    #[error("Connection to {endpoint} failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Handshake failed: {message}")]
    HandshakeFailed { message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Transport is not connected")]
    NotConnected,

    // Wire protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Stream {stream_id} reset by peer (error code {error_code})")]
    StreamClosed { stream_id: u32, error_code: u32 },

    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Remote status {code}: {message}")]
    RemoteStatus { code: u32, message: String },

    #[error("Remote error [{code}]: {message}")]
    RemoteError { code: String, message: String },

    #[error("Invalid event: {message}")]
    InvalidEvent { message: String },

    // Selection and routing
    #[error("Unsupported transport: {scheme}")]
    UnsupportedTransport { scheme: String },

    #[error("Invalid endpoint {uri}: {message}")]
    InvalidEndpoint { uri: String, message: String },

    #[error("All endpoints failed after {attempts} attempts: {last_error}")]
    AllEndpointsFailed { attempts: u32, last_error: String },

    #[error("Circuit breaker open for {endpoint}")]
    CircuitBreakerOpen { endpoint: String },

    // Sessions and credentials
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Missing required scope: {scope}")]
    InsufficientScope { scope: String },

    // Configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Underlying errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => TetherError::ConnectionClosed,
            _ => TetherError::Io {
                message: err.to_string(),
                source: Some(err),
            },
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<url::ParseError> for TetherError {
    fn from(err: url::ParseError) -> Self {
        TetherError::InvalidEndpoint {
            uri: String::new(),
            message: err.to_string(),
        }
    }
}

impl TetherError {
    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        TetherError::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for an event decode failure.
    pub fn invalid_event(message: impl Into<String>) -> Self {
        TetherError::InvalidEvent {
            message: message.into(),
        }
    }

    /// Short machine-readable symbol, used as the `code` of `Event::Error`.
    pub fn code(&self) -> &'static str {
        match self {
            TetherError::ConnectionFailed { .. } => "connection_failed",
            TetherError::HandshakeFailed { .. } => "handshake_failed",
            TetherError::Timeout(_) => "timeout",
            TetherError::ConnectionClosed => "connection_closed",
            TetherError::NotConnected => "not_connected",
            TetherError::Protocol { .. } => "protocol_error",
            TetherError::StreamClosed { .. } => "stream_closed",
            TetherError::HttpStatus { .. } => "http_status",
            TetherError::RemoteStatus { .. } => "remote_status",
            TetherError::RemoteError { .. } => "remote_error",
            TetherError::InvalidEvent { .. } => "invalid_event",
            TetherError::UnsupportedTransport { .. } => "unsupported_transport",
            TetherError::InvalidEndpoint { .. } => "invalid_endpoint",
            TetherError::AllEndpointsFailed { .. } => "all_endpoints_failed",
            TetherError::CircuitBreakerOpen { .. } => "circuit_open",
            TetherError::SessionNotFound { .. } => "session_not_found",
            TetherError::Unauthorized => "unauthorized",
            TetherError::InsufficientScope { .. } => "insufficient_scope",
            TetherError::Config { .. } => "config_error",
            TetherError::Io { .. } => "io_error",
            TetherError::Json { .. } => "json_error",
            TetherError::Other(_) => "internal",
        }
    }

    /// Check if this error may succeed when retried, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        match self {
            TetherError::ConnectionFailed { .. }
            | TetherError::HandshakeFailed { .. }
            | TetherError::Timeout(_)
            | TetherError::ConnectionClosed
            | TetherError::NotConnected
            | TetherError::Protocol { .. }
            | TetherError::StreamClosed { .. }
            | TetherError::RemoteStatus { .. }
            | TetherError::RemoteError { .. }
            | TetherError::CircuitBreakerOpen { .. }
            | TetherError::UnsupportedTransport { .. }
            | TetherError::Io { .. } => true,
            // 4xx are caller mistakes, except throttling and timeouts
            TetherError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Convert into an `Event::Error` for delivery through a stream handler.
    pub fn to_error_event(&self) -> Event {
        Event::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
