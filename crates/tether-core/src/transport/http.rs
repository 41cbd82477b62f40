//! HTTP/1.1 connection shared by the stream and SSE adapters.
//!
//! Keeps one persistent connection and redials lazily when the server asked
//! to close it, when a body was left unread, or after a failed exchange.

use super::{dial, with_deadline, Endpoint};
use crate::codec::http1::{BodyDecoder, BodyKind, RequestHead, ResponseHead};
use crate::config::TransportOptions;
use crate::error::{Result, TetherError};
use crate::stream::{ByteStream, CloseHandle};
use tracing::debug;

/// Longest error body kept in an `HttpStatus` error.
const MAX_ERROR_BODY: usize = 512;

pub(crate) struct HttpConnection {
    pub(crate) options: TransportOptions,
    endpoint: Option<Endpoint>,
    stream: Option<ByteStream>,
    close: CloseHandle,
}

impl HttpConnection {
    pub(crate) fn new(options: TransportOptions) -> Self {
        Self {
            options,
            endpoint: None,
            stream: None,
            close: CloseHandle::new(),
        }
    }

    pub(crate) async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.endpoint.is_some() {
            return Ok(());
        }
        let stream = dial(endpoint, &self.options, &self.close).await?;
        debug!("HTTP/1.1 connection to {} established", stream.peer());
        self.stream = Some(stream);
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    pub(crate) fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Request head with the headers every call carries.
    pub(crate) fn head(&self, method: &str, route: &str) -> Result<RequestHead> {
        let endpoint = self.endpoint.as_ref().ok_or(TetherError::NotConnected)?;
        Ok(RequestHead::new(method, endpoint.target(route))
            .header("Host", endpoint.authority())
            .header("User-Agent", self.options.user_agent.clone())
            .headers(self.options.request_headers()))
    }

    /// Drop the socket; the next call redials.
    pub(crate) fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!("Released HTTP/1.1 connection");
        }
    }

    async fn stream(&mut self) -> Result<&mut ByteStream> {
        if self.stream.is_none() {
            let endpoint = self.endpoint.clone().ok_or(TetherError::NotConnected)?;
            debug!("Redialing {}", endpoint.authority());
            self.stream = Some(dial(&endpoint, &self.options, &self.close).await?);
        }
        self.stream.as_mut().ok_or(TetherError::NotConnected)
    }

    pub(crate) fn stream_mut(&mut self) -> Result<&mut ByteStream> {
        self.stream.as_mut().ok_or(TetherError::NotConnected)
    }

    /// Send a request and read the final response head.
    pub(crate) async fn exchange(
        &mut self,
        head: &RequestHead,
        body: &[u8],
    ) -> Result<ResponseHead> {
        let result = async {
            let stream = self.stream().await?;
            stream.send(&head.encode(body)).await?;
            ResponseHead::read_final(stream).await
        }
        .await;
        if result.is_err() {
            self.release();
        }
        result
    }

    /// Read the complete body that follows `head`.
    pub(crate) async fn read_body(&mut self, head: &ResponseHead) -> Result<Vec<u8>> {
        let max = self.options.max_message_size;
        let kind = head.body_kind()?;
        let result = async {
            let stream = self.stream_mut()?;
            BodyDecoder::new(kind).read_to_end(stream, max).await
        }
        .await;
        if result.is_err() || head.connection_close() || kind == BodyKind::UntilClose {
            self.release();
        }
        result
    }

    /// Full request/response under the call deadline. Non-2xx responses
    /// become `HttpStatus`.
    pub(crate) async fn request(&mut self, head: &RequestHead, body: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.options.timeout;
        let result = with_deadline(timeout, async {
            let response = self.exchange(head, body).await?;
            let data = self.read_body(&response).await?;
            if !response.is_success() {
                return Err(status_error(&response, &data));
            }
            Ok(data)
        })
        .await;
        if matches!(result, Err(TetherError::Timeout(_))) {
            self.release();
        }
        result
    }

    /// Send a streaming request and return the head of a successful response.
    pub(crate) async fn open_stream(
        &mut self,
        head: &RequestHead,
        body: &[u8],
    ) -> Result<ResponseHead> {
        let response = self.exchange(head, body).await?;
        if !response.is_success() {
            let data = self.read_body(&response).await?;
            return Err(status_error(&response, &data));
        }
        Ok(response)
    }

    pub(crate) async fn disconnect(&mut self) {
        self.close.close();
        self.endpoint = None;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
            debug!("HTTP/1.1 connection to {} closed", stream.peer());
        }
    }
}

fn status_error(head: &ResponseHead, body: &[u8]) -> TetherError {
    let body = &body[..body.len().min(MAX_ERROR_BODY)];
    TetherError::HttpStatus {
        status: head.status,
        body: String::from_utf8_lossy(body).into_owned(),
    }
}
