//! Newline-delimited JSON framing.
//!
//! Input is permissive: the child's stdout interleaves diagnostic text with
//! protocol frames, so any line that does not decode as a [`FramedMessage`]
//! is skipped without disturbing the lines around it. Partial lines stay
//! buffered until their terminator arrives.

use super::message::FramedMessage;
use crate::config::PipeConfig;
use crate::error::{BridgeError, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Incremental line splitter and frame decoder.
#[derive(Debug)]
pub struct LineCodec {
    buffer: BytesMut,
    max_line_bytes: usize,
    /// Set after an overlong line was dropped; skip up to the next newline.
    discarding: bool,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(PipeConfig::MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_line_bytes,
            discarding: false,
            scanned: 0,
        }
    }

    /// Append a chunk and lazily yield every complete frame it finishes.
    ///
    /// Lines the iterator does not reach stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.push(chunk);
        Frames { codec: self }
    }

    /// Append a chunk without decoding anything.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete line (without its terminator).
    pub fn next_line(&mut self) -> Option<Bytes> {
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);
            let Some(pos) = found else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_line_bytes {
                    warn!(
                        "Discarding {} bytes of unterminated pipe output",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                }
                return None;
            };

            let mut line = self.buffer.split_to(pos + 1);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }

            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            return Some(line.freeze());
        }
    }

    /// Flush whatever is left once the stream has ended.
    ///
    /// A final line without a terminator still counts.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        Some(self.buffer.split().freeze())
    }

    /// Bytes currently held waiting for a terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Lazy iterator over the frames completed by a [`LineCodec::feed`] call.
pub struct Frames<'a> {
    codec: &'a mut LineCodec,
}

impl Iterator for Frames<'_> {
    type Item = FramedMessage;

    fn next(&mut self) -> Option<FramedMessage> {
        while let Some(line) = self.codec.next_line() {
            if let Some(frame) = decode_line(&line) {
                return Some(frame);
            }
        }
        None
    }
}

/// Decode one line, returning a `ProtocolDecode` error if it is not a frame.
pub fn try_decode_line(line: &[u8]) -> Result<FramedMessage> {
    serde_json::from_slice(line).map_err(|e| BridgeError::ProtocolDecode {
        message: e.to_string(),
    })
}

/// Decode one line, skipping blanks and non-protocol output.
pub fn decode_line(line: &[u8]) -> Option<FramedMessage> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match try_decode_line(line) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("Skipping non-protocol line ({}): {}", e, String::from_utf8_lossy(line));
            None
        }
    }
}

/// Serialize a frame as a single `\n`-terminated line.
pub fn encode(frame: &FramedMessage) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &FramedMessage) -> Result<()> {
    let line = encode(frame)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads lines and frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    codec: LineCodec,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            codec: LineCodec::new(),
            chunk: vec![0u8; PipeConfig::READ_CHUNK_BYTES],
            eof: false,
        }
    }

    /// Next raw line, or `None` on end of stream.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(line) = self.codec.next_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(self.codec.finish());
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.codec.push(&self.chunk[..n]);
            }
        }
    }

    /// Next decodable frame, skipping non-protocol lines; `None` on end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<FramedMessage>> {
        while let Some(line) = self.next_line().await? {
            if let Some(frame) = decode_line(&line) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_line(id: &str) -> String {
        format!("{{\"type\":\"response\",\"requestId\":\"{}\",\"data\":{{}}}}\n", id)
    }

    #[test]
    fn test_malformed_line_between_frames_is_skipped() {
        let mut codec = LineCodec::new();
        let input = format!(
            "{}2024/01/01 Request received [a]: {{broken\n{}",
            response_line("a"),
            response_line("b")
        );

        let frames: Vec<_> = codec.feed(input.as_bytes()).collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].request_id(), Some("a"));
        assert_eq!(frames[1].request_id(), Some("b"));
    }

    #[test]
    fn test_split_chunk_reassembly() {
        let line = response_line("split");
        let (head, tail) = line.as_bytes().split_at(17);

        let mut whole = LineCodec::new();
        let expected: Vec<_> = whole.feed(line.as_bytes()).collect();

        let mut codec = LineCodec::new();
        assert_eq!(codec.feed(head).count(), 0);
        let frames: Vec<_> = codec.feed(tail).collect();

        assert_eq!(frames, expected);
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_byte_at_a_time_resumes_scan() {
        let input = format!("{}{}", response_line("a"), response_line("b"));
        let mut codec = LineCodec::new();
        let mut ids = vec![];

        for byte in input.as_bytes() {
            ids.extend(
                codec
                    .feed(std::slice::from_ref(byte))
                    .map(|f| f.request_id().map(str::to_string)),
            );
            assert!(codec.scanned <= codec.buffered_len());
        }

        assert_eq!(ids, vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_unconsumed_lines_stay_buffered() {
        let mut codec = LineCodec::new();
        let input = format!("{}{}", response_line("1"), response_line("2"));

        let first = codec.feed(input.as_bytes()).next();
        assert_eq!(first.unwrap().request_id(), Some("1"));

        let rest: Vec<_> = codec.feed(b"").collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].request_id(), Some("2"));
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut codec = LineCodec::new();
        let frames: Vec<_> = codec
            .feed(b"\r\n\n{\"type\":\"push-event\",\"data\":\"DB_UPDATED\"}\r\n")
            .collect();
        assert_eq!(frames, vec![FramedMessage::push(json!("DB_UPDATED"))]);
    }

    #[test]
    fn test_json_that_is_not_a_frame_is_skipped() {
        let mut codec = LineCodec::new();
        let frames: Vec<_> = codec.feed(b"{\"level\":\"info\"}\n[1,2]\n").collect();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_overlong_line_discarded_without_losing_next() {
        let mut codec = LineCodec::with_max_line_bytes(16);
        assert_eq!(codec.feed(&[b'x'; 40]).count(), 0);
        assert_eq!(codec.buffered_len(), 0);

        let input = format!("more garbage\n{}", response_line("ok"));
        let frames: Vec<_> = codec.feed(input.as_bytes()).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_id(), Some("ok"));
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let line = encode(&FramedMessage::push(json!({"a": "b\nc"}))).unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn test_frame_reader_handles_unterminated_tail() {
        let input = format!(
            "noise\n{}{{\"type\":\"push-event\",\"data\":1}}",
            response_line("r")
        );
        let mut reader = FrameReader::new(input.as_bytes());

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first.request_id(), Some("r"));
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(second, FramedMessage::push(json!(1)));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_frame_roundtrip_through_reader() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &FramedMessage::error_response("x", "nope"))
            .await
            .unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, FramedMessage::error_response("x", "nope"));
    }
}
