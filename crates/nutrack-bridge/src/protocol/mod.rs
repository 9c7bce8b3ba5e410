//! Pipe wire protocol.
//!
//! Newline-delimited UTF-8 JSON shared by the host and the backend child.
//!
//! - **Message**: the tagged [`FramedMessage`] union (`request`, `response`, `push-event`)
//! - **Codec**: permissive line framing over raw byte chunks and async streams

pub mod codec;
pub mod message;

pub use codec::{decode_line, encode, write_frame, FrameReader, LineCodec};
pub use message::{FramedMessage, PushFrame, RequestFrame, ResponseFrame};
