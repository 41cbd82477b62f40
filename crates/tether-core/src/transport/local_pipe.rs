//! Local pipe adapter and its serving side.
//!
//! The client speaks length-prefixed frames over process stdio, an
//! in-process duplex, or a loopback TCP socket. [`PipeServer`] is the
//! matching peer: it reads calls, hands them to a [`PipeDispatch`]
//! implementation, and writes the replies.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime with one spawned task per
//! connection. The dispatcher is shared via `Arc` and must do its own
//! synchronization.

use super::{
    deliver, dial, with_deadline, Endpoint, EventHandler, StreamEnd, Transport, TransportKind,
};
use crate::codec::pipe::{encode_frame, parse_frame, PipeRequest, PipeResponse};
use crate::config::TransportOptions;
use crate::error::{Result, TetherError};
use crate::event::{decode_event_payload, Event, Frame};
use crate::stream::{AsyncIo, ByteStream, CloseHandle};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Most concurrent connections a TCP-bound server accepts.
const MAX_PIPE_CONNECTIONS: usize = 64;
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Process stdin/stdout as one bidirectional pipe.
struct StdioPipe {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
}

impl AsyncRead for StdioPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioPipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

/// Client side of the local pipe protocol.
pub struct LocalPipeTransport {
    options: TransportOptions,
    stream: Option<ByteStream>,
    close: CloseHandle,
    next_id: u64,
}

impl LocalPipeTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            stream: None,
            close: CloseHandle::new(),
            next_id: 1,
        }
    }

    /// Use an already-open pipe (for example one half of `tokio::io::duplex`).
    /// The transport is connected immediately.
    pub fn from_io<T: AsyncIo + 'static>(io: T, options: TransportOptions) -> Self {
        let mut transport = Self::new(options);
        let stream = ByteStream::from_io(io, "pipe").with_close_handle(&transport.close);
        transport.stream = Some(stream);
        transport
    }

    fn stream_mut(&mut self) -> Result<&mut ByteStream> {
        self.stream.as_mut().ok_or(TetherError::NotConnected)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a call and read the reply header.
    async fn start_call(
        stream: &mut ByteStream,
        request: &PipeRequest,
        body: &[u8],
        max_size: usize,
    ) -> Result<()> {
        let mut wire = encode_frame(&serde_json::to_vec(request)?)?;
        wire.extend(encode_frame(body)?);
        stream.send(&wire).await?;

        let header = read_pipe_frame(stream, max_size)
            .await?
            .ok_or(TetherError::ConnectionClosed)?;
        let response: PipeResponse = serde_json::from_slice(&header)
            .map_err(|e| TetherError::protocol(format!("invalid pipe response header: {}", e)))?;
        if response.id != request.id {
            return Err(TetherError::protocol(format!(
                "pipe response id {} does not match request id {}",
                response.id, request.id
            )));
        }
        if let Some(err) = response.error {
            return Err(TetherError::RemoteError {
                code: err.code,
                message: err.message,
            });
        }
        Ok(())
    }
}

async fn read_pipe_frame(stream: &mut ByteStream, max_size: usize) -> Result<Option<Vec<u8>>> {
    stream.read_frame_with(|buf| parse_frame(buf, max_size)).await
}

#[async_trait]
impl Transport for LocalPipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalPipe
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        // A host means a same-machine pipe server on loopback TCP
        let stream = if endpoint.host.is_empty() {
            self.close.reset();
            let pipe = StdioPipe {
                stdin: tokio::io::stdin(),
                stdout: tokio::io::stdout(),
            };
            ByteStream::from_io(pipe, "stdio").with_close_handle(&self.close)
        } else {
            dial(endpoint, &self.options, &self.close).await?
        };
        debug!("Local pipe connected via {}", stream.peer());
        self.stream = Some(stream);
        Ok(())
    }

    async fn unary(&mut self, route: &str, request: &[u8]) -> Result<Vec<u8>> {
        let id = self.next_id();
        let max = self.options.max_message_size;
        let timeout = self.options.timeout;
        let call = PipeRequest::new(id, route, false);
        let stream = self.stream_mut()?;

        let result = with_deadline(timeout, async {
            Self::start_call(stream, &call, request, max).await?;
            read_pipe_frame(stream, max)
                .await?
                .ok_or(TetherError::ConnectionClosed)
        })
        .await;

        if matches!(result, Err(TetherError::Timeout(_))) {
            // Reply framing is unknown after an abandoned call
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
        let id = self.next_id();
        let max = self.options.max_message_size;
        let close = self.close.clone();
        let call = PipeRequest::new(id, route, true);
        let stream = self.stream_mut()?;

        Self::start_call(stream, &call, request, max).await?;
        loop {
            let Some(payload) = read_pipe_frame(stream, max).await? else {
                return Ok(StreamEnd::Closed);
            };
            let event = match decode_event_payload(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping undecodable pipe event: {}", e);
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

    async fn disconnect(&mut self) -> Result<()> {
        self.close.close();
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
            debug!("Local pipe to {} disconnected", stream.peer());
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

/// Handles calls arriving on a pipe server.
#[async_trait]
pub trait PipeDispatch: Send + Sync + 'static {
    /// Answer a unary call with one response body.
    async fn unary(&self, route: &str, body: Vec<u8>) -> Result<Vec<u8>>;

    /// Produce a stream of frames. The server appends `Done` if the stream
    /// returns without sending a terminal event, or an `Error` event if it
    /// fails.
    async fn stream(&self, route: &str, body: Vec<u8>, frames: mpsc::Sender<Frame>) -> Result<()>;
}

/// Handle to a running TCP pipe server. Dropping shuts down the server.
pub struct PipeServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PipeServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every active connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for PipeServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Serving side of the local pipe protocol.
pub struct PipeServer;

impl PipeServer {
    /// Listen on an OS-assigned loopback port.
    pub async fn start<D: PipeDispatch>(dispatch: Arc<D>) -> Result<PipeServerHandle> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!("Pipe server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(PipeServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// Serve one already-open pipe until the peer closes it.
    pub async fn serve<D, T>(io: T, dispatch: Arc<D>) -> Result<()>
    where
        D: PipeDispatch,
        T: AsyncIo + 'static,
    {
        let stream = ByteStream::from_io(io, "pipe");
        Self::handle_connection(stream, &*dispatch, None).await
    }

    async fn accept_loop<D: PipeDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Pipe server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((socket, peer_addr)) => {
                            if active.load(Ordering::Relaxed) >= MAX_PIPE_CONNECTIONS {
                                warn!(
                                    "Rejecting pipe connection from {}: at max capacity ({})",
                                    peer_addr, MAX_PIPE_CONNECTIONS
                                );
                                continue;
                            }
                            active.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Pipe connection from {}", peer_addr);
                                let _ = socket.set_nodelay(true);
                                let stream = ByteStream::from_io(socket, peer_addr.to_string());
                                let shutdown = Some(conn_shutdown);
                                if let Err(e) =
                                    Self::handle_connection(stream, &*dispatch, shutdown).await
                                {
                                    debug!("Pipe connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Pipe accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: PipeDispatch>(
        mut stream: ByteStream,
        dispatch: &D,
        mut shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let max = crate::config::TransportConfig::MAX_MESSAGE_SIZE;
        loop {
            let header = tokio::select! {
                result = read_pipe_frame(&mut stream, max) => match result? {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => return Ok(()),
            };
            let body = read_pipe_frame(&mut stream, max)
                .await?
                .ok_or(TetherError::ConnectionClosed)?;

            let request: PipeRequest = match serde_json::from_slice(&header) {
                Ok(request) => request,
                Err(e) => {
                    // Without an id the reply cannot be matched; drop the connection
                    return Err(TetherError::protocol(format!(
                        "invalid pipe request header: {}",
                        e
                    )));
                }
            };

            if request.stream {
                Self::serve_stream(&mut stream, dispatch, request, body).await?;
            } else {
                let reply = match dispatch.unary(&request.route, body).await {
                    Ok(response) => {
                        let reply_header = serde_json::to_vec(&PipeResponse::ok(request.id))?;
                        let mut wire = encode_frame(&reply_header)?;
                        wire.extend(encode_frame(&response)?);
                        wire
                    }
                    Err(e) => encode_frame(&serde_json::to_vec(&PipeResponse::error(
                        request.id,
                        e.code(),
                        e.to_string(),
                    ))?)?,
                };
                stream.send(&reply).await?;
            }
        }
    }

    async fn serve_stream<D: PipeDispatch>(
        stream: &mut ByteStream,
        dispatch: &D,
        request: PipeRequest,
        body: Vec<u8>,
    ) -> Result<()> {
        stream
            .send(&encode_frame(&serde_json::to_vec(&PipeResponse::ok(request.id))?)?)
            .await?;

        let (tx, mut rx) = mpsc::channel::<Frame>(STREAM_CHANNEL_CAPACITY);
        let producer = dispatch.stream(&request.route, body, tx);
        tokio::pin!(producer);

        let mut outcome = None;
        let mut session_id = String::new();
        let mut terminated = false;
        loop {
            tokio::select! {
                result = &mut producer, if outcome.is_none() => outcome = Some(result),
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if terminated {
                            continue;
                        }
                        terminated = frame.event.is_terminal();
                        session_id.clone_from(&frame.session_id);
                        stream.send(&encode_frame(&frame.encode()?)?).await?;
                    }
                    None => break,
                },
            }
        }
        // The sender lives inside the producer, so the channel only closes
        // once the producer has finished.
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => producer.await,
        };

        if !terminated {
            let event = match outcome {
                Ok(()) => Event::Done,
                Err(e) => e.to_error_event(),
            };
            stream
                .send(&encode_frame(&Frame::new(session_id, event).encode()?)?)
                .await?;
        }
        Ok(())
    }
}

async fn wait_for_shutdown(rx: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoDispatch;

    #[async_trait]
    impl PipeDispatch for EchoDispatch {
        async fn unary(&self, route: &str, body: Vec<u8>) -> Result<Vec<u8>> {
            match route {
                "echo" => Ok(body),
                _ => Err(TetherError::Other(format!("unknown route {}", route))),
            }
        }

        async fn stream(
            &self,
            route: &str,
            body: Vec<u8>,
            frames: mpsc::Sender<Frame>,
        ) -> Result<()> {
            match route {
                "words" => {
                    let text = String::from_utf8_lossy(&body).into_owned();
                    for word in text.split_whitespace() {
                        let _ = frames.send(Frame::new("s1", Event::token(word))).await;
                    }
                    Ok(())
                }
                _ => Err(TetherError::Other("stream failed".to_string())),
            }
        }
    }

    fn in_process_pair() -> LocalPipeTransport {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(PipeServer::serve(server, Arc::new(EchoDispatch)));
        LocalPipeTransport::from_io(client, TransportOptions::new())
    }

    #[tokio::test]
    async fn test_unary_over_duplex() {
        let mut transport = in_process_pair();
        assert!(transport.is_connected());
        assert_eq!(transport.unary("echo", b"ping").await.unwrap(), b"ping");
        assert_eq!(transport.unary("echo", b"").await.unwrap(), b"");

        let err = transport.unary("missing", b"x").await.unwrap_err();
        assert!(err.to_string().contains("unknown route"));
        // Connection remains usable after an application error
        assert_eq!(transport.unary("echo", b"again").await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_stream_appends_done() {
        let mut transport = in_process_pair();
        let mut events = Vec::new();
        let end = transport
            .server_stream("words", b"hello pipe world", &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(
            events,
            vec![
                Event::token("hello"),
                Event::token("pipe"),
                Event::token("world"),
                Event::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_failure_becomes_error_event() {
        let mut transport = in_process_pair();
        let mut events = Vec::new();
        let end = transport
            .server_stream("broken", b"", &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Failed);
        assert!(matches!(events.as_slice(), [Event::Error { .. }]));
    }

    #[tokio::test]
    async fn test_malformed_event_frame_is_skipped() {
        let (client, server) = tokio::io::duplex(4096);
        let mut transport = LocalPipeTransport::from_io(client, TransportOptions::new());

        tokio::spawn(async move {
            let mut peer = ByteStream::from_io(server, "peer");
            let header = read_pipe_frame(&mut peer, 1024).await.unwrap().unwrap();
            let request: PipeRequest = serde_json::from_slice(&header).unwrap();
            let _body = read_pipe_frame(&mut peer, 1024).await.unwrap().unwrap();

            let reply = serde_json::to_vec(&PipeResponse::ok(request.id)).unwrap();
            let mut wire = encode_frame(&reply).unwrap();
            wire.extend(encode_frame(br#"{"type":"token","text":"a"}"#).unwrap());
            wire.extend(encode_frame(b"not json").unwrap());
            wire.extend(encode_frame(br#"{"type":"done"}"#).unwrap());
            peer.send(&wire).await.unwrap();
        });

        let mut count = 0;
        let end = transport
            .server_stream("x", b"", &mut |_| count += 1)
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_tcp_server_and_disconnect() {
        let mut server = PipeServer::start(Arc::new(EchoDispatch)).await.unwrap();
        let endpoint = Endpoint::parse(&format!("pipe://{}", server.addr())).unwrap();

        let mut transport = LocalPipeTransport::new(TransportOptions::new());
        transport.connect(&endpoint).await.unwrap();
        transport.connect(&endpoint).await.unwrap();
        assert_eq!(transport.unary("echo", b"tcp").await.unwrap(), b"tcp");

        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.unary("echo", b"x").await,
            Err(TetherError::NotConnected)
        ));

        server.shutdown();
    }
}
