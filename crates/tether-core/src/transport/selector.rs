//! Scheme to adapter policy.
//!
//! This is the only place that maps a destination URI to a protocol
//! adapter. Unknown schemes fall back to the local pipe, so selection
//! always yields an adapter or a typed error.

use super::{
    Endpoint, GrpcTransport, LocalPipeTransport, QuicEngineFactory, QuicTransport, SseTransport,
    TcpTransport, Transport, TransportKind, WebSocketTransport,
};
use crate::config::TransportOptions;
use crate::error::Result;
use crate::event::{EventCodec, JsonEventCodec};
use std::sync::Arc;
use tracing::{debug, info};

/// How to choose the adapter for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    /// Decide from the URI scheme.
    #[default]
    Auto,
    Explicit(TransportKind),
}

impl From<Option<TransportKind>> for TransportPreference {
    fn from(kind: Option<TransportKind>) -> Self {
        match kind {
            Some(kind) => TransportPreference::Explicit(kind),
            None => TransportPreference::Auto,
        }
    }
}

/// Builds and connects adapters.
#[derive(Clone)]
pub struct TransportSelector {
    options: TransportOptions,
    codec: Arc<dyn EventCodec>,
    quic_engine: Option<QuicEngineFactory>,
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("options", &self.options)
            .field("quic_engine", &self.quic_engine.is_some())
            .finish()
    }
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::new(TransportOptions::default())
    }
}

impl TransportSelector {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            codec: Arc::new(JsonEventCodec),
            quic_engine: None,
        }
    }

    /// Install the engine used for `quic://` destinations.
    pub fn with_quic_engine(mut self, factory: QuicEngineFactory) -> Self {
        self.quic_engine = Some(factory);
        self
    }

    /// Codec for framed transports (gRPC message bodies).
    pub fn with_event_codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the adapter options, keeping the codec and QUIC engine.
    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Adapter kind for an endpoint under a preference.
    pub fn resolve(&self, endpoint: &Endpoint, preference: TransportPreference) -> TransportKind {
        match preference {
            TransportPreference::Explicit(kind) => kind,
            TransportPreference::Auto => {
                TransportKind::from_scheme(&endpoint.scheme).unwrap_or_else(|| {
                    debug!(
                        "Unrecognized scheme {:?}, falling back to local pipe",
                        endpoint.scheme
                    );
                    TransportKind::LocalPipe
                })
            }
        }
    }

    /// Construct an unconnected adapter of the given kind.
    pub fn build(&self, kind: TransportKind) -> Box<dyn Transport> {
        let options = self.options.clone();
        match kind {
            TransportKind::LocalPipe => Box::new(LocalPipeTransport::new(options)),
            TransportKind::Tcp => Box::new(TcpTransport::new(options)),
            TransportKind::WebSocket => Box::new(WebSocketTransport::new(options)),
            TransportKind::Grpc => Box::new(GrpcTransport::with_codec(options, self.codec.clone())),
            TransportKind::Sse => Box::new(SseTransport::new(options)),
            TransportKind::Quic => match &self.quic_engine {
                Some(factory) => Box::new(QuicTransport::with_engine(options, factory())),
                None => Box::new(QuicTransport::new(options)),
            },
        }
    }

    /// Parse `uri`, build the matching adapter, and connect it.
    pub async fn select(
        &self,
        uri: &str,
        preference: TransportPreference,
    ) -> Result<Box<dyn Transport>> {
        let endpoint = Endpoint::parse(uri)?;
        self.select_endpoint(&endpoint, preference).await
    }

    pub async fn select_endpoint(
        &self,
        endpoint: &Endpoint,
        preference: TransportPreference,
    ) -> Result<Box<dyn Transport>> {
        let kind = self.resolve(endpoint, preference);
        let mut transport = self.build(kind);
        transport.connect(endpoint).await?;
        info!("Selected {} transport for {}", kind, endpoint.uri);
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;

    fn resolve(uri: &str) -> TransportKind {
        let selector = TransportSelector::default();
        selector.resolve(&Endpoint::parse(uri).unwrap(), TransportPreference::Auto)
    }

    #[test]
    fn test_auto_resolution_by_scheme() {
        assert_eq!(resolve("stdio://"), TransportKind::LocalPipe);
        assert_eq!(resolve("tcp://localhost:8080"), TransportKind::Tcp);
        assert_eq!(resolve("ws://localhost:8080/ws"), TransportKind::WebSocket);
        assert_eq!(resolve("wss://example.com/ws"), TransportKind::WebSocket);
        assert_eq!(resolve("grpc://localhost:50051"), TransportKind::Grpc);
        assert_eq!(resolve("grpcs://example.com"), TransportKind::Grpc);
        assert_eq!(resolve("sse://localhost:8080/events"), TransportKind::Sse);
        assert_eq!(resolve("quic://localhost:4433"), TransportKind::Quic);
        assert_eq!(resolve("mystery://localhost:1"), TransportKind::LocalPipe);
    }

    #[test]
    fn test_explicit_preference_wins() {
        let selector = TransportSelector::default();
        let endpoint = Endpoint::parse("ws://localhost:1").unwrap();
        let kind = selector.resolve(&endpoint, TransportPreference::Explicit(TransportKind::Sse));
        assert_eq!(kind, TransportKind::Sse);
        assert_eq!(selector.build(kind).kind(), TransportKind::Sse);
        assert_eq!(TransportPreference::from(None), TransportPreference::Auto);
    }

    #[tokio::test]
    async fn test_select_surfaces_typed_errors() {
        let selector = TransportSelector::default();
        assert!(matches!(
            selector.select("quic://localhost:4433", TransportPreference::Auto).await,
            Err(TetherError::UnsupportedTransport { .. })
        ));
        assert!(matches!(
            selector.select("::not a uri::", TransportPreference::Auto).await,
            Err(TetherError::InvalidEndpoint { .. })
        ));
        // Secure schemes need a secure channel
        assert!(matches!(
            selector.select("wss://localhost:1/ws", TransportPreference::Auto).await,
            Err(TetherError::UnsupportedTransport { .. })
        ));
    }
}
