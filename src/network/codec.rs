//! Frame codec.
//!
//! Control sockets carry NDJSON: one JSON object per `\n`-terminated line.
//! [`FrameReader`] buffers incoming bytes, yields complete lines, and keeps
//! partial trailing content for the next read. A line that fails to parse is
//! logged and dropped; the stream continues.
//!
//! A raw file-stream socket announces itself with the 12-byte literal prefix
//! `FILE_STREAM:` followed by the fileId and a terminating `\n`. Such a
//! socket is detached from the NDJSON path and handed, with any residual
//! buffered bytes, to the file-transfer engine.

use crate::error::{Error, Result};
use crate::network::protocol::ControlMessage;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Header prefix of a dedicated file-stream socket.
pub const FILE_STREAM_PREFIX: &[u8; 12] = b"FILE_STREAM:";

/// Maximum accepted line length, so a peer cannot exhaust memory by
/// withholding the newline.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Encode a control message as one NDJSON frame.
pub fn encode_frame(msg: &ControlMessage) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

/// Build the header line of a dedicated file-stream socket.
pub fn file_stream_header(file_id: &str) -> Vec<u8> {
    let mut header = Vec::with_capacity(FILE_STREAM_PREFIX.len() + file_id.len() + 1);
    header.extend_from_slice(FILE_STREAM_PREFIX);
    header.extend_from_slice(file_id.as_bytes());
    header.push(b'\n');
    header
}

/// If `line` is a file-stream header, return the fileId it names.
pub fn parse_file_stream_header(line: &[u8]) -> Option<&str> {
    let rest = line.strip_prefix(FILE_STREAM_PREFIX.as_slice())?;
    let id = std::str::from_utf8(rest).ok()?.trim();
    if id.is_empty() {
        return None;
    }
    Some(id)
}

/// Buffered line reader over a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next complete line, without its terminating `\n`.
    /// `Ok(None)` means clean EOF; trailing bytes without a newline are
    /// discarded (the frame never completed).
    pub async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return Ok(Some(line));
            }

            if self.buf.len() > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame exceeds maximum length",
                ));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    warn!(bytes = self.buf.len(), "discarding incomplete trailing frame");
                    self.buf.clear();
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read the next well-formed control frame, skipping malformed lines.
    pub async fn next_frame(&mut self) -> io::Result<Option<ControlMessage>> {
        loop {
            let line = match self.next_line().await? {
                Some(line) => line,
                None => return Ok(None),
            };
            match serde_json::from_slice::<ControlMessage>(&line) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame line");
                }
            }
        }
    }

    /// Hand back the underlying stream together with any buffered residual
    /// bytes (used when a socket turns out to be a file stream).
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buf)
    }
}

/// Parse a single line as a control frame, for contexts where a malformed
/// line is fatal (the handshake).
pub fn decode_frame(line: &[u8]) -> Result<ControlMessage> {
    serde_json::from_slice(line).map_err(|e| Error::FrameParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::MessageBody;
    use std::io::Cursor;

    fn msg(text: &str) -> ControlMessage {
        ControlMessage::Message {
            from: "a".into(),
            id: "m".into(),
            ts: 1,
            body: MessageBody::Text { text: text.into() },
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = msg("hello");
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(*encoded.last().unwrap(), b'\n');

        let mut reader = FrameReader::new(Cursor::new(encoded));
        let decoded = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lines_split_across_reads() {
        // A reader that feeds one byte at a time exercises partial-line
        // retention.
        struct OneByte(Cursor<Vec<u8>>);
        impl AsyncRead for OneByte {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                let mut tmp = [0u8; 1];
                let mut one = tokio::io::ReadBuf::new(&mut tmp);
                match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut one) {
                    std::task::Poll::Ready(Ok(())) => {
                        buf.put_slice(one.filled());
                        std::task::Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
        }

        let mut bytes = encode_frame(&msg("one")).unwrap();
        bytes.extend_from_slice(&encode_frame(&msg("two")).unwrap());

        let mut reader = FrameReader::new(OneByte(Cursor::new(bytes)));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), msg("one"));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), msg("two"));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let mut bytes = b"{not json at all\n".to_vec();
        bytes.extend_from_slice(&encode_frame(&msg("after")).unwrap());

        let mut reader = FrameReader::new(Cursor::new(bytes));
        // The bad line is dropped, the stream continues.
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), msg("after"));
    }

    #[tokio::test]
    async fn test_incomplete_trailing_frame_discarded() {
        let mut bytes = encode_frame(&msg("full")).unwrap();
        bytes.extend_from_slice(b"{\"type\":\"MESS");

        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), msg("full"));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlong_line_is_fatal() {
        let bytes = vec![b'x'; MAX_FRAME_LEN + 2];
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(reader.next_line().await.is_err());
    }

    #[tokio::test]
    async fn test_file_stream_detection_with_residual() {
        let file_id = "550e8400-e29b-41d4-a716-446655440000";
        let mut bytes = file_stream_header(file_id);
        bytes.extend_from_slice(b"ciphertext-follows");

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let line = reader.next_line().await.unwrap().unwrap();
        assert_eq!(parse_file_stream_header(&line), Some(file_id));

        let (_stream, residual) = reader.into_parts();
        assert_eq!(residual, b"ciphertext-follows");
    }

    #[test]
    fn test_header_parse_rejects_non_headers() {
        assert_eq!(parse_file_stream_header(b"{\"type\":\"PING\"}"), None);
        assert_eq!(parse_file_stream_header(b"FILE_STREAM:"), None);
    }
}
