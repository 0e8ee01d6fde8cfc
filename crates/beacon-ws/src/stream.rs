//! Frame-level reader and writer over an async byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{WsError, WsResult};
use crate::frame::{decode, encode_text, parse_frame, Frame, Opcode};

/// Why an inbound frame was dropped without reaching the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// FIN clear or continuation opcode.
    Fragmented,
    /// Binary, ping, pong or reserved opcode.
    NonText,
    /// Text frame whose payload is not UTF-8.
    InvalidUtf8,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fragmented => "fragmented",
            Self::NonText => "non_text",
            Self::InvalidUtf8 => "invalid_utf8",
        }
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete text message.
    Text(String),
    /// Peer sent a close frame.
    Close,
    /// Frame ignored by this server.
    Dropped { opcode: Opcode, reason: DropReason },
}

impl From<Frame> for Inbound {
    fn from(frame: Frame) -> Self {
        if frame.opcode == Opcode::Close {
            return Self::Close;
        }
        if !frame.fin || frame.opcode == Opcode::Continuation {
            return Self::Dropped {
                opcode: frame.opcode,
                reason: DropReason::Fragmented,
            };
        }
        if frame.opcode != Opcode::Text {
            return Self::Dropped {
                opcode: frame.opcode,
                reason: DropReason::NonText,
            };
        }
        match String::from_utf8(frame.payload) {
            Ok(text) => Self::Text(text),
            Err(_) => Self::Dropped {
                opcode: frame.opcode,
                reason: DropReason::InvalidUtf8,
            },
        }
    }
}

/// Buffered reader yielding one inbound frame at a time.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with an empty buffer.
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self::with_leftover(inner, Vec::new(), max_payload)
    }

    /// Create a reader seeded with bytes already read during the handshake.
    pub fn with_leftover(inner: R, leftover: Vec<u8>, max_payload: usize) -> Self {
        Self {
            inner,
            buf: leftover,
            max_payload,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream on a frame boundary.
    pub async fn next_frame(&mut self) -> WsResult<Option<Frame>> {
        loop {
            if let Some((frame, used)) = parse_frame(&self.buf, self.max_payload)? {
                self.buf.drain(..used);
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return match decode(&self.buf) {
                    Err(e) => Err(e),
                    Ok(_) => Err(WsError::Closed),
                };
            }
        }
    }

    /// Read and classify the next frame.
    pub async fn next_inbound(&mut self) -> WsResult<Option<Inbound>> {
        Ok(self.next_frame().await?.map(Inbound::from))
    }
}

/// Writer for pre-encoded or text frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write an already encoded frame.
    pub async fn write_frame(&mut self, frame: &[u8]) -> WsResult<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and write a text frame.
    pub async fn send_text(&mut self, text: &str) -> WsResult<()> {
        self.write_frame(&encode_text(text.as_bytes())).await
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> WsResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, encode_masked_text};

    const MASK: [u8; 4] = [9, 8, 7, 6];

    #[tokio::test]
    async fn test_reader_handles_split_reads() {
        let frame = encode_masked_text(b"{\"type\":\"heartbeat\"}", MASK);
        let (head, tail) = frame.split_at(3);
        let stream = tokio_test::io::Builder::new().read(head).read(tail).build();

        let mut reader = FrameReader::new(stream, 1024);
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Text("{\"type\":\"heartbeat\"}".to_string()))
        );
        assert_eq!(reader.next_inbound().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_uses_leftover_first() {
        let first = encode_masked_text(b"one", MASK);
        let second = encode_masked_text(b"two", MASK);
        let stream = tokio_test::io::Builder::new().read(&second).build();

        let mut reader = FrameReader::with_leftover(stream, first, 1024);
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Text("one".to_string()))
        );
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Text("two".to_string()))
        );
    }

    #[tokio::test]
    async fn test_reader_drops_control_and_fragments() {
        let mut bytes = encode_frame(true, Opcode::Ping, b"", Some(MASK));
        bytes.extend(encode_frame(false, Opcode::Text, b"par", Some(MASK)));
        bytes.extend(encode_frame(true, Opcode::Binary, &[0xff], Some(MASK)));
        bytes.extend(encode_masked_text(b"ok", MASK));
        bytes.extend(encode_frame(true, Opcode::Close, b"", Some(MASK)));
        let stream = tokio_test::io::Builder::new().read(&bytes).build();

        let mut reader = FrameReader::new(stream, 1024);
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Dropped {
                opcode: Opcode::Ping,
                reason: DropReason::NonText
            })
        );
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Dropped {
                opcode: Opcode::Text,
                reason: DropReason::Fragmented
            })
        );
        assert!(matches!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Dropped {
                reason: DropReason::NonText,
                ..
            })
        ));
        assert_eq!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Text("ok".to_string()))
        );
        assert_eq!(reader.next_inbound().await.unwrap(), Some(Inbound::Close));
    }

    #[tokio::test]
    async fn test_reader_drops_invalid_utf8() {
        let bytes = encode_frame(true, Opcode::Text, &[0xc3, 0x28], Some(MASK));
        let stream = tokio_test::io::Builder::new().read(&bytes).build();

        let mut reader = FrameReader::new(stream, 1024);
        assert!(matches!(
            reader.next_inbound().await.unwrap(),
            Some(Inbound::Dropped {
                reason: DropReason::InvalidUtf8,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reader_rejects_unmasked() {
        let bytes = encode_text(b"plain");
        let stream = tokio_test::io::Builder::new().read(&bytes).build();

        let mut reader = FrameReader::new(stream, 1024);
        let err = reader.next_inbound().await.unwrap_err();
        assert!(matches!(err, WsError::UnmaskedFrame));
    }

    #[tokio::test]
    async fn test_reader_eof_mid_frame_is_truncated() {
        let frame = encode_masked_text(b"incomplete", MASK);
        let stream = tokio_test::io::Builder::new()
            .read(&frame[..frame.len() - 2])
            .build();

        let mut reader = FrameReader::new(stream, 1024);
        let err = reader.next_inbound().await.unwrap_err();
        assert!(matches!(err, WsError::Truncated { .. }));
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_writer_sends_unmasked_text() {
        let expected = encode_text(b"{\"type\":\"error\"}");
        let stream = tokio_test::io::Builder::new().write(&expected).build();

        let mut writer = FrameWriter::new(stream);
        writer.send_text("{\"type\":\"error\"}").await.unwrap();
    }
}
