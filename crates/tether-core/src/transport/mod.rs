//! The uniform transport contract and its protocol adapters.
//!
//! Every adapter owns exactly one connection and is driven sequentially
//! through `&mut self`. Streaming calls hand each decoded [`Event`] to a
//! synchronous handler before reading the next frame, so a slow handler
//! throttles decoding and events are seen in arrival order.

mod grpc;
mod http;
mod local_pipe;
mod quic;
mod selector;
mod sse;
mod tcp;
mod websocket;

pub use grpc::GrpcTransport;
pub use local_pipe::{LocalPipeTransport, PipeDispatch, PipeServer, PipeServerHandle};
pub use quic::{QuicEngine, QuicEngineFactory, QuicTransport};
pub use selector::{TransportPreference, TransportSelector};
pub use sse::SseTransport;
pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

use crate::config::TransportOptions;
use crate::error::{Result, TetherError};
use crate::event::Event;
use crate::stream::{ByteStream, CloseHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// Streaming callback. Invoked inline by the read loop.
pub type EventHandler<'a> = dyn FnMut(Event) + Send + 'a;

/// Which wire protocol an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    LocalPipe,
    Tcp,
    WebSocket,
    Grpc,
    Sse,
    Quic,
}

impl TransportKind {
    /// Map a URI scheme to its adapter. `None` for unknown schemes.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "stdio" => Some(TransportKind::LocalPipe),
            "tcp" => Some(TransportKind::Tcp),
            "ws" | "wss" => Some(TransportKind::WebSocket),
            "grpc" | "grpcs" => Some(TransportKind::Grpc),
            "sse" => Some(TransportKind::Sse),
            "quic" => Some(TransportKind::Quic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalPipe => "local_pipe",
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
            TransportKind::Grpc => "grpc",
            TransportKind::Sse => "sse",
            TransportKind::Quic => "quic",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed connection destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uri: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
    /// `wss` and `grpcs`.
    pub secure: bool,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| TetherError::InvalidEndpoint {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;
        let scheme = url.scheme().to_ascii_lowercase();
        let secure = matches!(scheme.as_str(), "wss" | "grpcs");
        let port = url
            .port()
            .unwrap_or_else(|| Self::default_port(&scheme, secure));

        let mut path = url.path().to_string();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            uri: uri.to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            scheme,
            port,
            path,
            secure,
        })
    }

    fn default_port(scheme: &str, secure: bool) -> u16 {
        match scheme {
            "quic" => 443,
            _ if secure => 443,
            _ => 80,
        }
    }

    /// `host:port` form used in `Host`/`:authority` headers and logs.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Join the endpoint's base path with a call route.
    pub fn target(&self, route: &str) -> String {
        let base = self.path.trim_end_matches('/');
        let route = route.trim_start_matches('/');
        match (base.is_empty(), route.is_empty()) {
            (_, true) if base.is_empty() => "/".to_string(),
            (_, true) => base.to_string(),
            (true, false) => format!("/{}", route),
            (false, false) => format!("{}/{}", base, route),
        }
    }

    pub fn require_host(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(TetherError::InvalidEndpoint {
                uri: self.uri.clone(),
                message: "missing host".to_string(),
            });
        }
        Ok(())
    }
}

/// How a `server_stream` call ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer sent `Done`.
    Completed,
    /// The peer sent an `Error` event; it was delivered to the handler.
    Failed,
    /// The peer ended the stream cleanly before any terminal event.
    Closed,
}

/// Uniform contract implemented by every protocol adapter.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Establish the connection and run any handshake. Connecting an
    /// already-connected transport is a no-op.
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Send one request and wait for one complete response.
    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>>;

    /// Send one request and deliver every decoded event to `handler` until a
    /// terminal event arrives or the peer closes the stream.
    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd>;

    /// Graceful shutdown. Safe to call repeatedly.
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Handle that aborts the current connection from another task.
    fn close_handle(&self) -> CloseHandle;
}

/// Hand one event to the handler, reporting whether it ended the stream.
pub(crate) fn deliver(event: Event, handler: &mut EventHandler<'_>) -> Option<StreamEnd> {
    let end = match &event {
        Event::Done => Some(StreamEnd::Completed),
        Event::Error { .. } => Some(StreamEnd::Failed),
        _ => None,
    };
    handler(event);
    end
}

/// Run `fut` under the call deadline.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TetherError::Timeout(timeout))?
}

/// Dial the endpoint's host, through the secure channel when required, and
/// attach the adapter's close handle.
pub(crate) async fn dial(
    endpoint: &Endpoint,
    options: &TransportOptions,
    close: &CloseHandle,
) -> Result<ByteStream> {
    endpoint.require_host()?;
    let stream = if endpoint.secure {
        let channel =
            options
                .secure_channel
                .as_deref()
                .ok_or_else(|| TetherError::UnsupportedTransport {
                    scheme: format!("{} (no secure channel installed)", endpoint.scheme),
                })?;
        ByteStream::connect_secure(&endpoint.host, endpoint.port, options.timeout, channel).await?
    } else {
        ByteStream::connect(&endpoint.host, endpoint.port, options.timeout).await?
    };
    close.reset();
    Ok(stream.with_close_handle(close))
}
