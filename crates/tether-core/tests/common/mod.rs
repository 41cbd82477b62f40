//! Scripted peers for adapter integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use tether_core::ByteStream;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Accept `connections` sockets in turn and run `script` on each.
pub async fn serve<F, Fut>(connections: usize, script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: Fn(ByteStream, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        for n in 0..connections {
            let (socket, peer) = listener.accept().await.unwrap();
            script(ByteStream::from_io(socket, peer.to_string()), n).await;
        }
    });
    (addr, handle)
}

/// Read an HTTP/1.1 request head, returning its lines without the blank terminator.
pub async fn read_head(stream: &mut ByteStream) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = stream.read_line(64 * 1024).await.unwrap() {
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    lines
}

/// Value of a header in request head lines, case-insensitively.
pub fn header<'a>(lines: &'a [String], name: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// Read a request head plus its `Content-Length` body.
pub async fn read_request(stream: &mut ByteStream) -> (Vec<String>, Vec<u8>) {
    let head = read_head(stream).await;
    let len = header(&head, "content-length")
        .map(|v| v.parse::<usize>().unwrap())
        .unwrap_or(0);
    let body = stream.read_exact(len).await.unwrap().to_vec();
    (head, body)
}
