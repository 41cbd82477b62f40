//! HTTP/2 RPC adapter (gRPC framing).
//!
//! One connection, one active client stream at a time. Stream ids start at
//! 1 and grow by 2. A request is a HEADERS frame followed by DATA frames
//! holding one length-prefixed message; the response is read until a frame
//! on the same stream carries END_STREAM, then `grpc-status` is checked.

use super::{
    deliver, dial, with_deadline, Endpoint, EventHandler, StreamEnd, Transport, TransportKind,
};
use crate::codec::grpc::{encode_message, MessageDecoder};
use crate::codec::hpack::{encode_headers, HpackDecoder};
use crate::codec::http2::{
    error_code, flags, parse_goaway, parse_rst_stream, parse_settings, settings, FrameType,
    Http2Frame,
};
use crate::config::{TransportConfig, TransportOptions};
use crate::error::{Result, TetherError};
use crate::event::{EventCodec, JsonEventCodec};
use crate::stream::{ByteStream, CloseHandle};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Response state of one client stream.
#[derive(Debug)]
struct CallState {
    stream_id: u32,
    decoder: MessageDecoder,
    headers: Option<Vec<(String, String)>>,
    trailers: Vec<(String, String)>,
    ended: bool,
}

impl CallState {
    fn new(stream_id: u32, max_message_size: usize) -> Self {
        Self {
            stream_id,
            decoder: MessageDecoder::new(max_message_size),
            headers: None,
            trailers: Vec::new(),
            ended: false,
        }
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.trailers
            .iter()
            .chain(self.headers.iter().flatten())
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Final status once the stream has ended.
    fn status(&self) -> Result<()> {
        if self.decoder.pending() > 0 {
            return Err(TetherError::protocol("stream ended inside a gRPC message"));
        }
        match self.field("grpc-status") {
            None => Err(TetherError::protocol("stream ended without grpc-status")),
            Some("0") => Ok(()),
            Some(code) => Err(TetherError::RemoteStatus {
                code: code.parse().unwrap_or(2),
                message: self.field("grpc-message").unwrap_or_default().to_string(),
            }),
        }
    }
}

pub struct GrpcTransport {
    options: TransportOptions,
    codec: Arc<dyn EventCodec>,
    endpoint: Option<Endpoint>,
    stream: Option<ByteStream>,
    close: CloseHandle,
    hpack: HpackDecoder,
    next_stream_id: u32,
    peer_max_frame_size: usize,
}

impl GrpcTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self::with_codec(options, Arc::new(JsonEventCodec))
    }

    /// Use a custom mapping between message bodies and events.
    pub fn with_codec(options: TransportOptions, codec: Arc<dyn EventCodec>) -> Self {
        Self {
            options,
            codec,
            endpoint: None,
            stream: None,
            close: CloseHandle::new(),
            hpack: HpackDecoder::default(),
            next_stream_id: 1,
            peer_max_frame_size: TransportConfig::HTTP2_DEFAULT_MAX_FRAME_SIZE,
        }
    }

    async fn establish(&mut self, endpoint: &Endpoint) -> Result<()> {
        let options = &self.options;
        let close = &self.close;
        let stream = with_deadline(options.timeout, async {
            let mut stream = dial(endpoint, options, close).await?;
            let mut preface = TransportConfig::HTTP2_PREFACE.to_vec();
            preface.extend(Http2Frame::settings(&[]).encode()?);
            stream.send(&preface).await?;
            Ok(stream)
        })
        .await?;

        info!("HTTP/2 connection to {} established", endpoint.authority());
        self.stream = Some(stream);
        self.hpack = HpackDecoder::default();
        self.next_stream_id = 1;
        self.peer_max_frame_size = TransportConfig::HTTP2_DEFAULT_MAX_FRAME_SIZE;
        Ok(())
    }

    /// Redial after a dropped connection, as long as `connect` was called.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint.clone().ok_or(TetherError::NotConnected)?;
        self.establish(&endpoint).await
    }

    fn stream_mut(&mut self) -> Result<&mut ByteStream> {
        self.stream.as_mut().ok_or(TetherError::NotConnected)
    }

    async fn send_frame(&mut self, frame: &Http2Frame) -> Result<()> {
        let bytes = frame.encode()?;
        self.stream_mut()?.send(&bytes).await
    }

    fn header_block(&self, endpoint: &Endpoint, route: &str) -> Vec<u8> {
        let path = endpoint.target(route);
        let authority = endpoint.authority();
        let scheme = if endpoint.secure { "https" } else { "http" };
        let extra = self.options.request_headers();
        let fixed = [
            (":method", "POST"),
            (":scheme", scheme),
            (":path", path.as_str()),
            (":authority", authority.as_str()),
            ("content-type", "application/grpc"),
            ("te", "trailers"),
            ("user-agent", self.options.user_agent.as_str()),
        ];
        encode_headers(
            fixed
                .into_iter()
                .chain(extra.iter().map(|(n, v)| (n.as_str(), v.as_str()))),
        )
    }

    /// Open a new stream and send the request on it.
    async fn start_call(&mut self, route: &str, request: &[u8]) -> Result<CallState> {
        self.ensure_connected().await?;
        let endpoint = self.endpoint.clone().ok_or(TetherError::NotConnected)?;

        let stream_id = self.next_stream_id;
        if stream_id > MAX_STREAM_ID {
            self.stream = None;
            return Err(TetherError::protocol("HTTP/2 stream ids exhausted"));
        }
        self.next_stream_id += 2;

        let max_frame = self.peer_max_frame_size;
        let mut wire = Vec::new();
        let block = self.header_block(&endpoint, route);
        let mut chunks = block.chunks(max_frame).peekable();
        let first = chunks.next().unwrap_or_default();
        let mut frame = Http2Frame::headers(stream_id, first.to_vec(), false);
        if chunks.peek().is_some() {
            frame.flags &= !flags::END_HEADERS;
        }
        wire.extend(frame.encode()?);
        while let Some(chunk) = chunks.next() {
            let f = if chunks.peek().is_none() { flags::END_HEADERS } else { 0 };
            let continuation =
                Http2Frame::new(FrameType::Continuation, f, stream_id, chunk.to_vec());
            wire.extend(continuation.encode()?);
        }

        let message = encode_message(request)?;
        let mut parts = message.chunks(max_frame).peekable();
        while let Some(part) = parts.next() {
            let last = parts.peek().is_none();
            wire.extend(Http2Frame::data(stream_id, part.to_vec(), last).encode()?);
        }

        debug!("Opening HTTP/2 stream {} for {}", stream_id, endpoint.target(route));
        self.stream_mut()?.send(&wire).await?;
        Ok(CallState::new(stream_id, self.options.max_message_size))
    }

    async fn read_frame(&mut self) -> Result<Http2Frame> {
        // We never advertise a larger SETTINGS_MAX_FRAME_SIZE
        let max = TransportConfig::HTTP2_DEFAULT_MAX_FRAME_SIZE;
        self.stream_mut()?
            .read_frame_with(|buf| Http2Frame::decode(buf, max))
            .await?
            .ok_or(TetherError::ConnectionClosed)
    }

    /// Read a HEADERS block and any CONTINUATION frames that complete it.
    async fn read_header_block(&mut self, first: &Http2Frame) -> Result<Vec<(String, String)>> {
        let mut block = first.body()?.to_vec();
        let mut done = first.has_flag(flags::END_HEADERS);
        while !done {
            let next = self.read_frame().await?;
            if next.frame_type != FrameType::Continuation || next.stream_id != first.stream_id {
                return Err(TetherError::protocol("expected CONTINUATION frame"));
            }
            block.extend_from_slice(&next.payload);
            done = next.has_flag(flags::END_HEADERS);
        }
        self.hpack.decode(&block)
    }

    /// Next message on the call's stream, or `None` once it has ended.
    async fn next_message(&mut self, call: &mut CallState) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(message) = call.decoder.next_message()? {
                return Ok(Some(message));
            }
            if call.ended {
                call.status()?;
                return Ok(None);
            }
            let frame = self.read_frame().await?;
            self.handle_frame(frame, call).await?;
        }
    }

    async fn handle_frame(&mut self, frame: Http2Frame, call: &mut CallState) -> Result<()> {
        match frame.frame_type {
            FrameType::Settings => {
                if frame.has_flag(flags::ACK) {
                    return Ok(());
                }
                for (id, value) in parse_settings(&frame.payload)? {
                    if id == settings::MAX_FRAME_SIZE {
                        let size = value as usize;
                        if !(TransportConfig::HTTP2_DEFAULT_MAX_FRAME_SIZE
                            ..=TransportConfig::HTTP2_MAX_FRAME_SIZE_LIMIT)
                            .contains(&size)
                        {
                            return Err(TetherError::protocol(format!(
                                "invalid SETTINGS_MAX_FRAME_SIZE {}",
                                size
                            )));
                        }
                        self.peer_max_frame_size = size;
                    }
                }
                self.send_frame(&Http2Frame::settings_ack()).await
            }
            FrameType::Ping => {
                if frame.has_flag(flags::ACK) {
                    return Ok(());
                }
                self.send_frame(&Http2Frame::ping_ack(frame.payload)).await
            }
            FrameType::Goaway => {
                let (last_stream, code) = parse_goaway(&frame.payload)?;
                warn!(
                    "HTTP/2 peer sent GOAWAY (last stream {}, error code {})",
                    last_stream, code
                );
                self.stream = None;
                Err(TetherError::ConnectionClosed)
            }
            FrameType::PushPromise => Err(TetherError::protocol("server push is not supported")),
            FrameType::Headers => {
                // Decode every block so the HPACK table stays in sync
                let fields = self.read_header_block(&frame).await?;
                if frame.stream_id != call.stream_id {
                    return Ok(());
                }
                match call.headers {
                    None => {
                        let status = fields
                            .iter()
                            .find(|(n, _)| n == ":status")
                            .map(|(_, v)| v.as_str());
                        if status != Some("200") {
                            return Err(TetherError::HttpStatus {
                                status: status.and_then(|s| s.parse().ok()).unwrap_or(0),
                                body: String::new(),
                            });
                        }
                        call.headers = Some(fields);
                    }
                    Some(_) => call.trailers.extend(fields),
                }
                call.ended |= frame.is_end_stream();
                Ok(())
            }
            FrameType::Data => {
                let consumed = frame.length() as u32;
                if frame.stream_id != call.stream_id {
                    if consumed > 0 {
                        self.send_frame(&Http2Frame::window_update(0, consumed)).await?;
                    }
                    return Ok(());
                }
                call.decoder.push(&frame.body()?);
                call.ended |= frame.is_end_stream();
                if consumed > 0 {
                    let mut update = Http2Frame::window_update(0, consumed).encode()?;
                    if !call.ended {
                        let stream_update = Http2Frame::window_update(call.stream_id, consumed);
                        update.extend(stream_update.encode()?);
                    }
                    self.stream_mut()?.send(&update).await?;
                }
                Ok(())
            }
            FrameType::RstStream if frame.stream_id == call.stream_id => {
                let error_code = parse_rst_stream(&frame.payload)?;
                Err(TetherError::StreamClosed {
                    stream_id: frame.stream_id,
                    error_code,
                })
            }
            FrameType::Continuation => Err(TetherError::protocol("unexpected CONTINUATION frame")),
            // WINDOW_UPDATE, PRIORITY, resets of old streams, unknown types
            _ => Ok(()),
        }
    }

    /// Drop the connection after a failure that may have left it mid-frame.
    fn drop_on_error<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result {
            if !matches!(e, TetherError::RemoteStatus { .. } | TetherError::StreamClosed { .. }) {
                self.stream = None;
            }
        }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Grpc
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.establish(endpoint).await?;
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.options.timeout;
        let result = with_deadline(timeout, async {
            let mut call = self.start_call(route, request).await?;
            let mut response = None;
            while let Some(message) = self.next_message(&mut call).await? {
                if response.is_none() {
                    response = Some(message);
                }
            }
            response.ok_or_else(|| TetherError::protocol("stream ended without a response message"))
        })
        .await;
        self.drop_on_error(&result);
        result
    }

    async fn server_stream(
        &mut self,
        route: &str,
        request: &[u8],
        handler: &mut EventHandler<'_>,
    ) -> Result<StreamEnd> {
        let codec = self.codec.clone();
        let close = self.close.clone();
        let result = async {
            let mut call = self.start_call(route, request).await?;
            while let Some(message) = self.next_message(&mut call).await? {
                let event = match codec.decode(&message) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            "Skipping undecodable gRPC message on stream {}: {}",
                            call.stream_id, e
                        );
                        continue;
                    }
                };
                if close.is_closed() {
                    return Err(TetherError::ConnectionClosed);
                }
                if let Some(end) = deliver(event, handler) {
                    if !call.ended {
                        self.send_frame(&Http2Frame::rst_stream(call.stream_id, error_code::CANCEL))
                            .await?;
                    }
                    return Ok(end);
                }
            }
            Ok(StreamEnd::Closed)
        }
        .await;
        self.drop_on_error(&result);
        result
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close.close();
        self.endpoint = None;
        if let Some(mut stream) = self.stream.take() {
            match Http2Frame::goaway(0, error_code::NO_ERROR).encode() {
                Ok(goaway) => {
                    if let Err(e) = stream.send(&goaway).await {
                        debug!("GOAWAY not sent: {}", e);
                    }
                }
                Err(e) => debug!("GOAWAY not encoded: {}", e),
            }
            stream.shutdown().await;
            debug!("HTTP/2 connection to {} closed", stream.peer());
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
