//! Stream adapter: HTTP/1.1 over a plain TCP socket.
//!
//! `unary` is a JSON POST whose response body is returned whole.
//! `server_stream` posts the same request with `Accept: text/event-stream`
//! and reads the body line by line, decoding every `data: ` line as one
//! event.

use super::http::HttpConnection;
use super::{deliver, Endpoint, EventHandler, StreamEnd, Transport, TransportKind};
use crate::codec::http1::BodyLines;
use crate::config::TransportOptions;
use crate::error::{Result, TetherError};
use crate::event::{decode_event_payload, Event};
use crate::stream::CloseHandle;
use async_trait::async_trait;
use tracing::warn;

/// Payload that marks the end of an OpenAI-style event stream.
pub(crate) const DONE_SENTINEL: &str = "[DONE]";

/// Decode the payload of one `data:` field.
pub(crate) fn decode_data(data: &str) -> Result<Event> {
    if data.trim() == DONE_SENTINEL {
        return Ok(Event::Done);
    }
    decode_event_payload(data.as_bytes())
}

/// Value of a `field:` line with the single optional leading space removed.
pub(crate) fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub struct TcpTransport {
    conn: HttpConnection,
}

impl TcpTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            conn: HttpConnection::new(options),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.conn.connect(endpoint).await
    }

    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>> {
        let head = self
            .conn
            .head("POST", route)?
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        self.conn.request(&head, request).await
    }

    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        let head = self
            .conn
            .head("POST", route)?
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        let response = self.conn.open_stream(&head, request).await?;
        let mut lines = BodyLines::new(response.body_kind()?);
        let close = self.conn.close_handle();

        let result = async {
            loop {
                let Some(line) = lines.next_line(self.conn.stream_mut()?).await? else {
                    return Ok(StreamEnd::Closed);
                };
                let Some(data) = field_value(&line, "data") else {
                    continue;
                };
                let event = match decode_data(data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping undecodable stream line: {}", e);
                        continue;
                    }
                };
                if close.is_closed() {
                    return Err(TetherError::ConnectionClosed);
                }
                if let Some(end) = deliver(event, handler) {
                    return Ok(end);
                }
            }
        }
        .await;

        if result.is_err() || !lines.is_finished() || response.connection_close() {
            self.conn.release();
        }
        result
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.conn.disconnect().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    fn close_handle(&self) -> CloseHandle {
        self.conn.close_handle()
    }
}
