//! WebSocket adapter (RFC 6455 client).
//!
//! The connection path selects the remote service, so the per-call route is
//! not carried on the wire. Each call sends one message and reads
//! messages back: one for `unary`, a sequence of events for
//! `server_stream`.

use super::{
    deliver, dial, with_deadline, Endpoint, EventHandler, StreamEnd, Transport, TransportKind,
};
use crate::codec::http1::{RequestHead, ResponseHead};
use crate::codec::websocket::{Opcode, WsFrame};
use crate::config::{TransportConfig, TransportOptions};
use crate::error::{Result, TetherError};
use crate::event::decode_event_payload;
use crate::stream::{ByteStream, CloseHandle};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

pub struct WebSocketTransport {
    options: TransportOptions,
    stream: Option<ByteStream>,
    close: CloseHandle,
}

impl WebSocketTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            stream: None,
            close: CloseHandle::new(),
        }
    }

    /// 16 random bytes, base64-encoded.
    fn generate_key() -> String {
        let key: [u8; 16] = rand::random();
        BASE64.encode(key)
    }

    async fn handshake(
        stream: &mut ByteStream,
        endpoint: &Endpoint,
        options: &TransportOptions,
    ) -> Result<()> {
        let key = Self::generate_key();
        let head = RequestHead::new("GET", endpoint.path.clone())
            .header("Host", endpoint.authority())
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", key)
            .header("Sec-WebSocket-Version", "13")
            .header("User-Agent", options.user_agent.clone())
            .headers(options.request_headers());
        stream.send(&head.encode(&[])).await?;

        let response = ResponseHead::read_final(stream).await?;
        if response.status != 101 {
            return Err(TetherError::HandshakeFailed {
                message: format!(
                    "expected status 101, got {} {}",
                    response.status, response.reason
                ),
            });
        }
        let upgraded = response
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if !upgraded {
            return Err(TetherError::HandshakeFailed {
                message: "response is missing Upgrade: websocket".to_string(),
            });
        }
        if response.header("sec-websocket-accept").is_none() {
            return Err(TetherError::HandshakeFailed {
                message: "response is missing Sec-WebSocket-Accept".to_string(),
            });
        }
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut ByteStream> {
        self.stream.as_mut().ok_or(TetherError::NotConnected)
    }

    /// Masked outbound data frame; text when the payload is UTF-8.
    fn data_frame(payload: &[u8]) -> WsFrame {
        let frame = match std::str::from_utf8(payload) {
            Ok(text) => WsFrame::text(text),
            Err(_) => WsFrame::binary(payload),
        };
        frame.with_mask(rand::random())
    }
}

/// Read one complete data message, answering control frames on the way.
///
/// Returns `None` once the peer has closed the connection.
async fn read_message(stream: &mut ByteStream, max_size: usize) -> Result<Option<Vec<u8>>> {
    let mut fragments: Option<Vec<u8>> = None;
    loop {
        let Some(frame) = stream
            .read_frame_with(|buf| WsFrame::decode(buf, max_size))
            .await?
        else {
            return Ok(None);
        };

        match frame.opcode {
            Opcode::Ping => {
                let pong = WsFrame::pong(frame.payload).with_mask(rand::random());
                stream.send(&pong.encode()).await?;
            }
            Opcode::Pong => {}
            Opcode::Close => {
                let (code, reason) = frame
                    .close_reason()
                    .unwrap_or((TransportConfig::WEBSOCKET_CLOSE_NORMAL, String::new()));
                debug!("WebSocket peer closed ({}): {}", code, reason);
                let reply = WsFrame::close(code, "").with_mask(rand::random());
                let _ = stream.send(&reply.encode()).await;
                return Ok(None);
            }
            Opcode::Text | Opcode::Binary => {
                if fragments.is_some() {
                    return Err(TetherError::protocol(
                        "new WebSocket message started inside a fragmented one",
                    ));
                }
                if frame.fin {
                    return Ok(Some(frame.payload));
                }
                fragments = Some(frame.payload);
            }
            Opcode::Continuation => {
                let Some(buf) = fragments.as_mut() else {
                    return Err(TetherError::protocol("continuation frame without a message"));
                };
                if buf.len() + frame.payload.len() > max_size {
                    return Err(TetherError::protocol(format!(
                        "WebSocket message exceeds maximum {}",
                        max_size
                    )));
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    return Ok(fragments.take());
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let options = &self.options;
        let close = &self.close;
        // Deadline covers the dial and the upgrade
        let stream = with_deadline(options.timeout, async {
            let mut stream = dial(endpoint, options, close).await?;
            Self::handshake(&mut stream, endpoint, options).await?;
            Ok(stream)
        })
        .await?;

        info!("WebSocket connected to {}{}", endpoint.authority(), endpoint.path);
        self.stream = Some(stream);
        Ok(())
    }

    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>> {
        debug!("WebSocket unary call (route {:?})", route);
        let timeout = self.options.timeout;
        let max = self.options.max_message_size;
        let stream = self.stream_mut()?;

        let result = with_deadline(timeout, async {
            stream.send(&Self::data_frame(request).encode()).await?;
            read_message(stream, max)
                .await?
                .ok_or(TetherError::ConnectionClosed)
        })
        .await;

        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        debug!("WebSocket stream call (route {:?})", route);
        let max = self.options.max_message_size;
        let close = self.close.clone();
        let stream = self.stream_mut()?;

        let result = async {
            stream.send(&Self::data_frame(request).encode()).await?;
            loop {
                let Some(message) = read_message(stream, max).await? else {
                    return Ok(None);
                };
                let event = match decode_event_payload(&message) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping undecodable WebSocket message: {}", e);
                        continue;
                    }
                };
                if close.is_closed() {
                    return Err(TetherError::ConnectionClosed);
                }
                if let Some(end) = deliver(event, handler) {
                    return Ok(Some(end));
                }
            }
        }
        .await;

        match result {
            Ok(Some(end)) => Ok(end),
            Ok(None) => {
                self.stream = None;
                Ok(StreamEnd::Closed)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close.close();
        if let Some(mut stream) = self.stream.take() {
            let frame = WsFrame::close(TransportConfig::WEBSOCKET_CLOSE_NORMAL, "");
            if let Err(e) = stream.send(&frame.encode()).await {
                debug!("WebSocket close frame not sent: {}", e);
            }
            stream.shutdown().await;
            debug!("WebSocket to {} disconnected", stream.peer());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}
