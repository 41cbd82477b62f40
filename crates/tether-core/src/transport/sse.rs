//! Server-Sent Events adapter.
//!
//! Lines are accumulated into a message buffer and flushed on a blank line;
//! the joined `data` of each message decodes to one event. The last seen
//! `id` is sent back as `Last-Event-ID` on the next stream.

use super::http::HttpConnection;
use super::tcp::{decode_data, field_value};
use super::{deliver, Endpoint, EventHandler, StreamEnd, Transport, TransportKind};
use crate::codec::http1::BodyLines;
use crate::config::TransportOptions;
use crate::error::{Result, TetherError};
use crate::stream::CloseHandle;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Line-level SSE field parser.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    /// Feed one line. Returns a message when a blank line completes one.
    pub(crate) fn push_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let name = &line[..pos];
                (name, field_value(line, name).unwrap_or_default())
            }
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage {
            event,
            data,
            id: self.id.clone(),
        })
    }

    pub(crate) fn retry(&self) -> Option<Duration> {
        self.retry
    }
}

pub struct SseTransport {
    conn: HttpConnection,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            conn: HttpConnection::new(options),
            last_event_id: None,
            retry: None,
        }
    }

    /// Id of the last message received, resent as `Last-Event-ID`.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay most recently advertised by the server.
    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry
    }

    fn method_for(request: &[u8]) -> &'static str {
        if request.is_empty() {
            "GET"
        } else {
            "POST"
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.conn.connect(endpoint).await
    }

    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>> {
        let mut head = self.conn.head(Self::method_for(request), route)?;
        if !request.is_empty() {
            head = head.header("Content-Type", "application/json");
        }
        self.conn.request(&head, request).await
    }

    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        let mut head = self
            .conn
            .head(Self::method_for(request), route)?
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if !request.is_empty() {
            head = head.header("Content-Type", "application/json");
        }
        if let Some(id) = &self.last_event_id {
            head = head.header("Last-Event-ID", id.clone());
        }

        let response = self.conn.open_stream(&head, request).await?;
        let mut lines = BodyLines::new(response.body_kind()?);
        let mut parser = SseParser::default();
        let close = self.conn.close_handle();
        let conn = &mut self.conn;
        let last_event_id = &mut self.last_event_id;

        let result = async {
            loop {
                let Some(line) = lines.next_line(conn.stream_mut()?).await? else {
                    return Ok(StreamEnd::Closed);
                };
                let Some(message) = parser.push_line(&line) else {
                    continue;
                };
                if message.id.is_some() {
                    *last_event_id = message.id.clone();
                }
                let event = match decode_data(&message.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            "Skipping undecodable SSE message (event {:?}): {}",
                            message.event, e
                        );
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

        if let Some(retry) = parser.retry() {
            debug!("SSE server advertised retry interval {:?}", retry);
            self.retry = Some(retry);
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_flushes_on_blank_line() {
        let mut parser = SseParser::default();
        assert_eq!(parser.push_line(": keepalive"), None);
        assert_eq!(parser.push_line("event: token"), None);
        assert_eq!(parser.push_line("id: 7"), None);
        assert_eq!(parser.push_line("data: line one"), None);
        assert_eq!(parser.push_line("data:line two"), None);
        assert_eq!(
            parser.push_line(""),
            Some(SseMessage {
                event: Some("token".to_string()),
                data: "line one\nline two".to_string(),
                id: Some("7".to_string()),
            })
        );
        // Event type resets, id persists
        parser.push_line("data: x");
        let next = parser.push_line("").unwrap();
        assert_eq!(next.event, None);
        assert_eq!(next.id.as_deref(), Some("7"));
    }

    #[test]
    fn test_parser_ignores_empty_messages_and_reads_retry() {
        let mut parser = SseParser::default();
        parser.push_line("event: ping");
        assert_eq!(parser.push_line(""), None);
        parser.push_line("retry: 2500");
        parser.push_line("retry: soon");
        assert_eq!(parser.retry(), Some(Duration::from_millis(2500)));
        parser.push_line("data");
        assert_eq!(parser.push_line("").unwrap().data, "");
    }
}
