//! Centralized configuration for tether.
//!
//! Protocol constants and default limits live in constant holder structs.
//! Per-adapter runtime options are carried by [`TransportOptions`].

use crate::stream::SecureChannel;
use std::sync::Arc;
use std::time::Duration;

/// Transport-level constants and limits.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const USER_AGENT: &'static str = "tether/0.1";

    /// Upper bound on one decoded message (pipe frame, WebSocket message, gRPC message).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Upper bound on one HTTP/1.1 head or SSE line.
    pub const MAX_LINE_LENGTH: usize = 64 * 1024;
    pub const MAX_HEADER_COUNT: usize = 128;
    pub const READ_CHUNK_SIZE: usize = 8192;

    // HTTP/2
    pub const HTTP2_PREFACE: &'static [u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
    pub const HTTP2_DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
    pub const HTTP2_MAX_FRAME_SIZE_LIMIT: usize = 16_777_215;
    pub const HPACK_DEFAULT_TABLE_SIZE: usize = 4096;

    // WebSocket
    pub const WEBSOCKET_GUID: &'static str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    pub const WEBSOCKET_CLOSE_NORMAL: u16 = 1000;
}

/// Session registry defaults.
pub struct SessionConfig;

impl SessionConfig {
    /// Random bytes per session id (rendered as twice as many hex chars).
    pub const ID_BYTES: usize = 16;
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    /// Scope a credential must grant for session creation.
    pub const CREATE_SCOPE: &'static str = "session:create";
}

/// Runtime options shared by every protocol adapter.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Deadline for `connect` and for each `unary` call.
    pub timeout: Duration,
    pub user_agent: String,
    /// Extra request headers (HTTP-family adapters only).
    pub headers: Vec<(String, String)>,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub bearer_token: Option<String>,
    pub max_message_size: usize,
    /// TLS layer for secure schemes. Without one, `wss`/`grpcs` endpoints
    /// fail to connect.
    pub secure_channel: Option<Arc<dyn SecureChannel>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: TransportConfig::DEFAULT_TIMEOUT,
            user_agent: TransportConfig::USER_AGENT.to_string(),
            headers: Vec::new(),
            bearer_token: None,
            max_message_size: TransportConfig::MAX_MESSAGE_SIZE,
            secure_channel: None,
        }
    }
}

impl TransportOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect/unary deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the deadline in milliseconds.
    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    /// Add an extra request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a bearer credential.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the maximum accepted message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Install the TLS layer used for secure schemes.
    pub fn with_secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure_channel = Some(channel);
        self
    }

    /// All headers to send, including the authorization header.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        if let Some(token) = &self.bearer_token {
            headers.push(("authorization".to_string(), format!("Bearer {}", token)));
        }
        headers
    }
}
