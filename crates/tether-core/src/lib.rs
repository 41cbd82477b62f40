//! Tether Core - transport-agnostic RPC and event streaming.
//!
//! A caller issues unary or streaming requests to a remote peer over one of
//! several wire protocols and observes a single normalized [`Event`]
//! vocabulary regardless of which protocol carried it.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{Event, TransportPreference, TransportSelector, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let selector = TransportSelector::new(TransportOptions::new().with_timeout_ms(5_000));
//!     let mut transport = selector
//!         .select("ws://localhost:8080/chat", TransportPreference::Auto)
//!         .await?;
//!
//!     transport
//!         .server_stream("complete", br#"{"prompt":"hi"}"#, &mut |event| {
//!             if let Event::Token { text } = event {
//!                 print!("{}", text);
//!             }
//!         })
//!         .await?;
//!
//!     transport.disconnect().await
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod session;
pub mod stream;
pub mod translate;
pub mod transport;

// Re-export commonly used types
pub use auth::{AuthDecision, CredentialValidator, StaticCredentialValidator};
pub use config::{SessionConfig, TransportConfig, TransportOptions};
pub use error::{Result, TetherError};
pub use event::{EventCodec, Event, Frame, JsonEventCodec, PatchOp, StreamState, TextRange};
pub use session::{Session, SessionRegistry, SessionState};
pub use stream::{ByteStream, CloseHandle, SecureChannel};
pub use translate::{JsonPassthrough, PayloadTranslator, ProviderRequest, ProviderResponse};
pub use transport::{
    Endpoint, EventHandler, GrpcTransport, LocalPipeTransport, PipeDispatch, PipeServer,
    PipeServerHandle, QuicEngine, QuicEngineFactory, QuicTransport, SseTransport, StreamEnd,
    TcpTransport, Transport, TransportKind, TransportPreference, TransportSelector,
    WebSocketTransport,
};
