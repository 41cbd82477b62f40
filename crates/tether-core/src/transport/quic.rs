//! QUIC adapter slot.
//!
//! QUIC wire behavior (handshake, encryption, stream multiplexing) belongs to
//! an external engine. [`QuicTransport`] adapts an injected [`QuicEngine`]
//! to the transport contract and fails with `UnsupportedTransport` when no
//! engine is installed.

use super::{Endpoint, EventHandler, StreamEnd, Transport, TransportKind};
use crate::config::TransportOptions;
use crate::error::{Result, TetherError};
use crate::event::Event;
use crate::stream::CloseHandle;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// External QUIC implementation.
#[async_trait]
pub trait QuicEngine: Send {
    async fn connect(&mut self, endpoint: &Endpoint, options: &TransportOptions) -> Result<()>;
    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>>;
    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd>;
    async fn close(&mut self) -> Result<()>;
}

/// Builds one engine per transport instance.
pub type QuicEngineFactory = Arc<dyn Fn() -> Box<dyn QuicEngine> + Send + Sync>;

pub struct QuicTransport {
    options: TransportOptions,
    engine: Option<Box<dyn QuicEngine>>,
    connected: bool,
    close: CloseHandle,
}

impl QuicTransport {
    /// Placeholder with no engine; every call fails.
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            engine: None,
            connected: false,
            close: CloseHandle::new(),
        }
    }

    pub fn with_engine(options: TransportOptions, engine: Box<dyn QuicEngine>) -> Self {
        Self {
            engine: Some(engine),
            ..Self::new(options)
        }
    }

    fn unsupported() -> TetherError {
        TetherError::UnsupportedTransport {
            scheme: "quic (no engine installed)".to_string(),
        }
    }

    fn engine(&mut self) -> Result<&mut Box<dyn QuicEngine>> {
        if !self.connected {
            return Err(TetherError::NotConnected);
        }
        self.engine.as_mut().ok_or_else(Self::unsupported)
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let engine = self.engine.as_mut().ok_or_else(Self::unsupported)?;
        tokio::time::timeout(self.options.timeout, engine.connect(endpoint, &self.options))
            .await
            .map_err(|_| TetherError::Timeout(self.options.timeout))??;
        self.close.reset();
        self.connected = true;
        info!("QUIC connected to {}", endpoint.authority());
        Ok(())
    }

    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.options.timeout;
        let engine = self.engine()?;
        tokio::time::timeout(timeout, engine.unary(route, request))
            .await
            .map_err(|_| TetherError::Timeout(timeout))?
    }

    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        let close = self.close.clone();
        let engine = self.engine()?;
        // Suppress delivery once the close handle fires
        let mut guarded = |event: Event| {
            if !close.is_closed() {
                handler(event);
            }
        };
        let end = engine.server_stream(route, request, &mut guarded).await?;
        if close.is_closed() {
            return Err(TetherError::ConnectionClosed);
        }
        Ok(end)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close.close();
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.close().await {
                debug!("QUIC engine close failed: {}", e);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedEngine {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QuicEngine for CannedEngine {
        async fn connect(
            &mut self,
            _endpoint: &Endpoint,
            _options: &TransportOptions,
        ) -> Result<()> {
            Ok(())
        }

        async fn unary(&mut self, _route: &str, request: &[u8]) -> Result<Vec<u8>> {
            Ok(request.iter().rev().copied().collect())
        }

        async fn server_stream(
            &mut self,
            _route: &str,
            _request: &[u8],
            handler: &mut EventHandler<'_>,
        ) -> Result<StreamEnd> {
            handler(Event::token("q"));
            handler(Event::Done);
            Ok(StreamEnd::Completed)
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_without_engine_is_unsupported() {
        let mut transport = QuicTransport::new(TransportOptions::new());
        let endpoint = Endpoint::parse("quic://localhost:4433").unwrap();
        assert!(matches!(
            transport.connect(&endpoint).await,
            Err(TetherError::UnsupportedTransport { .. })
        ));
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_delegates_to_engine() {
        let closes = Arc::new(AtomicUsize::new(0));
        let engine = Box::new(CannedEngine {
            closes: closes.clone(),
        });
        let mut transport = QuicTransport::with_engine(TransportOptions::new(), engine);
        let endpoint = Endpoint::parse("quic://localhost:4433").unwrap();

        assert!(matches!(
            transport.unary("r", b"ab").await,
            Err(TetherError::NotConnected)
        ));
        transport.connect(&endpoint).await.unwrap();
        assert_eq!(transport.unary("r", b"ab").await.unwrap(), b"ba");

        let mut events = Vec::new();
        let end = transport
            .server_stream("r", b"", &mut |e| events.push(e))
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(events, vec![Event::token("q"), Event::Done]);

        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
