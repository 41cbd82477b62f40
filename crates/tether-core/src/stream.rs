//! Buffered byte stream shared by every protocol adapter.
//!
//! Wraps any `AsyncRead + AsyncWrite` (a TCP socket, one side of an
//! in-process duplex, process stdio) with a read-ahead buffer, line reads,
//! exact reads, and incremental frame parsing.
//!
//! # Closing from another task
//!
//! Adapters are driven through `&mut self`, so a running read loop cannot be
//! interrupted by calling `disconnect` on the same instance. A [`CloseHandle`]
//! can be cloned out beforehand; triggering it makes every pending and future
//! read on the stream fail with `ConnectionClosed`.

use crate::error::{Result, TetherError};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::config::TransportConfig;

/// Object-safe alias for a bidirectional async byte pipe.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Encryption layer for `wss://` and `grpcs://` endpoints.
///
/// TLS itself is provided by the embedding application; the adapters only
/// hand over the dialed socket and the server name.
#[async_trait::async_trait]
pub trait SecureChannel: Send + Sync + std::fmt::Debug {
    async fn wrap(&self, tcp: TcpStream, server_name: &str) -> Result<Box<dyn AsyncIo>>;
}

/// Cloneable trigger that closes a [`ByteStream`] from outside its owner.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal every subscribed stream to stop reading.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Re-arm after a reconnect.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Buffered stream over one connection.
pub struct ByteStream {
    io: Box<dyn AsyncIo>,
    buf: BytesMut,
    peer: String,
    close_rx: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("peer", &self.peer)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

impl ByteStream {
    /// Dial a TCP peer, failing with `Timeout` if the deadline passes first.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let stream = Self::dial_tcp(host, port, timeout).await?;
        Ok(Self::from_io(stream, format!("{}:{}", host, port)))
    }

    /// Dial a TCP peer and wrap the socket in a [`SecureChannel`].
    pub async fn connect_secure(
        host: &str,
        port: u16,
        timeout: Duration,
        channel: &dyn SecureChannel,
    ) -> Result<Self> {
        let stream = Self::dial_tcp(host, port, timeout).await?;
        let io = channel.wrap(stream, host).await?;
        Ok(Self::from_io(io, format!("{}:{}", host, port)))
    }

    async fn dial_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        let peer = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TetherError::Timeout(timeout))?
            .map_err(|e| TetherError::ConnectionFailed {
                endpoint: peer.clone(),
                message: e.to_string(),
            })?;
        // Latency matters more than throughput for small RPC frames
        let _ = stream.set_nodelay(true);

        debug!("Connected to {}", peer);
        Ok(stream)
    }

    /// Wrap an already-established pipe.
    pub fn from_io<T: AsyncIo + 'static>(io: T, peer: impl Into<String>) -> Self {
        Self {
            io: Box::new(io),
            buf: BytesMut::with_capacity(TransportConfig::READ_CHUNK_SIZE),
            peer: peer.into(),
            close_rx: None,
        }
    }

    /// Attach a close handle. Reads fail with `ConnectionClosed` once it fires.
    pub fn with_close_handle(mut self, handle: &CloseHandle) -> Self {
        self.close_rx = Some(handle.subscribe());
        self
    }

    /// Label of the remote end, for logs and errors.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Bytes read ahead but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Write all of `data` and flush.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read more bytes into the buffer. Returns 0 on clean EOF.
    pub async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; TransportConfig::READ_CHUNK_SIZE];
        let n = match self.close_rx.as_mut() {
            Some(rx) => loop {
                if *rx.borrow_and_update() {
                    return Err(TetherError::ConnectionClosed);
                }
                tokio::select! {
                    read = self.io.read(&mut chunk) => break read?,
                    changed = rx.changed() => {
                        // Handle dropped with its owner: nothing can close us anymore
                        if changed.is_err() {
                            break self.io.read(&mut chunk).await?;
                        }
                    }
                }
            },
            None => self.io.read(&mut chunk).await?,
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Return whatever is buffered, reading once if the buffer is empty.
    ///
    /// An empty result means the peer closed the connection.
    pub async fn recv(&mut self, max: usize) -> Result<Bytes> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(Bytes::new());
        }
        let n = max.min(self.buf.len());
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read exactly `n` bytes. EOF before that is `ConnectionClosed`.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(TetherError::ConnectionClosed);
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read one line, stripping the trailing `\n` or `\r\n`.
    ///
    /// Returns `None` on clean EOF. A final unterminated line is returned as
    /// is. Lines longer than `max_len` are a protocol error.
    pub async fn read_line(&mut self, max_len: usize) -> Result<Option<String>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|b| *b == b'\n') {
                let end = scanned + pos;
                let mut line = self.buf.split_to(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(end - 1);
                }
                return String::from_utf8(line.to_vec())
                    .map(Some)
                    .map_err(|_| TetherError::protocol("line is not valid UTF-8"));
            }
            scanned = self.buf.len();
            if scanned > max_len {
                return Err(TetherError::protocol(format!(
                    "line exceeds maximum length {}",
                    max_len
                )));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = self.buf.split().to_vec();
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|_| TetherError::protocol("line is not valid UTF-8"));
            }
        }
    }

    /// Read one frame using an incremental parser.
    ///
    /// `parse` returns `Ok(None)` while the buffer holds an incomplete frame
    /// and `Ok(Some((frame, consumed)))` once a full frame is available.
    /// Returns `None` on clean EOF between frames; EOF inside a frame is
    /// `ConnectionClosed`.
    pub async fn read_frame_with<T, F>(&mut self, mut parse: F) -> Result<Option<T>>
    where
        F: FnMut(&[u8]) -> Result<Option<(T, usize)>>,
    {
        loop {
            if let Some((frame, consumed)) = parse(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(frame));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TetherError::ConnectionClosed);
            }
        }
    }

    /// Best-effort write-side shutdown.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }
}
