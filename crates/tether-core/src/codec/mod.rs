//! Wire codecs.
//!
//! Pure parse/encode functions over byte slices. Nothing here performs I/O
//! except the pipe framing helpers and the HTTP/1.1 head/body readers,
//! which read from a [`ByteStream`](crate::stream::ByteStream).

pub mod grpc;
pub mod hpack;
pub mod http1;
pub mod http2;
pub mod huffman;
pub mod pipe;
pub mod websocket;

pub use grpc::{encode_message, MessageDecoder};
pub use hpack::HpackDecoder;
pub use http2::{FrameType, Http2Frame};
pub use pipe::{PipeRequest, PipeResponse};
pub use websocket::{Opcode, WsFrame};
