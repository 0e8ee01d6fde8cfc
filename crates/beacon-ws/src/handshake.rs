//! Opening handshake.
//!
//! Reads the HTTP upgrade request, locates `Sec-WebSocket-Key` and answers
//! with `101 Switching Protocols`. Only the key is required; everything else
//! in the request is ignored.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

use crate::error::{WsError, WsResult};

/// Upper bound on the request head.
pub const MAX_REQUEST_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const KEY_HEADER: &str = "sec-websocket-key";

/// Completed handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Client-supplied `Sec-WebSocket-Key`.
    pub key: String,
    /// Computed `Sec-WebSocket-Accept`.
    pub accept: String,
    /// Bytes received after the request head (start of the first frame).
    pub leftover: Vec<u8>,
}

/// Find the `Sec-WebSocket-Key` value in a request head.
///
/// Header names are matched case-insensitively; the request line is skipped.
pub fn find_websocket_key(request: &str) -> Option<&str> {
    request.split("\r\n").skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case(KEY_HEADER) {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    })
}

/// `base64(SHA-1(key ++ GUID))`.
pub fn accept_key(key: &str) -> String {
    derive_accept_key(key.as_bytes())
}

/// Response sent for a valid upgrade request.
pub fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Response sent before dropping a request without a key.
pub fn bad_request_response() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
}

/// Offset just past the blank line ending the request head.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Run the server side of the handshake on a freshly accepted stream.
pub async fn accept<S>(stream: &mut S, timeout: Duration) -> WsResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout_ms = timeout.as_millis() as u64;
    tokio::time::timeout(timeout, accept_inner(stream))
        .await
        .map_err(|_| WsError::HandshakeTimeout(timeout_ms))?
}

async fn accept_inner<S>(stream: &mut S) -> WsResult<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let end = loop {
        match header_end(&buf) {
            Some(end) if end <= MAX_REQUEST_BYTES => break end,
            Some(_) => return Err(head_too_large()),
            None if buf.len() >= MAX_REQUEST_BYTES => return Err(head_too_large()),
            None => {}
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(WsError::Handshake(
                "connection closed before request head completed".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let request = std::str::from_utf8(&buf[..end])
        .map_err(|_| WsError::Handshake("request head is not valid UTF-8".to_string()))?;

    let key = match find_websocket_key(request) {
        Some(key) => key.to_string(),
        None => {
            // Best effort; the connection is dropped either way.
            let _ = stream.write_all(bad_request_response().as_bytes()).await;
            return Err(WsError::Handshake(
                "missing Sec-WebSocket-Key header".to_string(),
            ));
        }
    };

    let accept = accept_key(&key);
    stream
        .write_all(switching_protocols_response(&accept).as_bytes())
        .await?;
    stream.flush().await?;

    debug!(accept = %accept, leftover = buf.len() - end, "Handshake completed");

    Ok(Handshake {
        key,
        accept,
        leftover: buf[end..].to_vec(),
    })
}

fn head_too_large() -> WsError {
    WsError::Handshake(format!("request head exceeds {MAX_REQUEST_BYTES} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_masked_text;

    // Sample key and accept value from RFC 6455 section 1.3.
    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn upgrade_request(key_line: &str) -> String {
        format!(
            "GET /ws HTTP/1.1\r\n\
             Host: localhost:8765\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             {key_line}\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
    }

    #[test]
    fn test_accept_key_matches_rfc_sample() {
        assert_eq!(accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn test_accept_key_is_deterministic() {
        let key = "x3JJHMbDL1EzLkh9GBhXDw==";
        assert_eq!(accept_key(key), accept_key(key));
        assert_ne!(accept_key(key), accept_key(RFC_KEY));
    }

    #[test]
    fn test_find_key_case_insensitive() {
        let request = upgrade_request(&format!("sec-WEBSOCKET-key:   {RFC_KEY}  \r\n"));
        assert_eq!(find_websocket_key(&request), Some(RFC_KEY));
    }

    #[test]
    fn test_find_key_missing_or_empty() {
        assert_eq!(find_websocket_key(&upgrade_request("")), None);
        assert_eq!(
            find_websocket_key(&upgrade_request("Sec-WebSocket-Key: \r\n")),
            None
        );
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn test_accept_writes_switching_protocols() {
        let request = upgrade_request(&format!("Sec-WebSocket-Key: {RFC_KEY}\r\n"));
        let response = switching_protocols_response(RFC_ACCEPT);
        let mut stream = tokio_test::io::Builder::new()
            .read(request.as_bytes())
            .write(response.as_bytes())
            .build();

        let handshake = accept(&mut stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(handshake.key, RFC_KEY);
        assert_eq!(handshake.accept, RFC_ACCEPT);
        assert!(handshake.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_accept_keeps_bytes_after_head() {
        let frame = encode_masked_text(b"{\"type\":\"heartbeat\"}", [1, 2, 3, 4]);
        let mut bytes = upgrade_request(&format!("Sec-WebSocket-Key: {RFC_KEY}\r\n")).into_bytes();
        bytes.extend_from_slice(&frame);

        let mut stream = tokio_test::io::Builder::new()
            .read(&bytes)
            .write(switching_protocols_response(RFC_ACCEPT).as_bytes())
            .build();

        let handshake = accept(&mut stream, Duration::from_secs(1)).await.unwrap();
        assert_eq!(handshake.leftover, frame);
    }

    #[tokio::test]
    async fn test_accept_rejects_missing_key() {
        let mut stream = tokio_test::io::Builder::new()
            .read(upgrade_request("").as_bytes())
            .write(bad_request_response().as_bytes())
            .build();

        let err = accept(&mut stream, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_accept_rejects_early_eof() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n")
            .build();

        let err = accept(&mut stream, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_accept_rejects_oversized_head() {
        let (mut server, mut client) = tokio::io::duplex(16 * 1024);
        let mut head = b"GET /ws HTTP/1.1\r\nX-Pad: ".to_vec();
        head.resize(MAX_REQUEST_BYTES + 512, b'a');
        client.write_all(&head).await.unwrap();

        let err = accept(&mut server, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(ref msg) if msg.contains("exceeds")));
    }

    #[tokio::test]
    async fn test_accept_rejects_head_ending_past_limit() {
        let key_line = |pad: &str| format!("Sec-WebSocket-Key: {RFC_KEY}\r\nX-Pad: {pad}\r\n");
        let base = upgrade_request(&key_line("")).len();
        let request = upgrade_request(&key_line(&"a".repeat(MAX_REQUEST_BYTES + 8 - base)));
        assert_eq!(request.len(), MAX_REQUEST_BYTES + 8);

        // A short first read makes a later read cross the limit and the
        // blank line in one go.
        let mut stream = tokio_test::io::Builder::new()
            .read(&request.as_bytes()[..100])
            .read(&request.as_bytes()[100..])
            .build();

        let err = accept(&mut stream, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(ref msg) if msg.contains("exceeds")));
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let (mut server, _client) = tokio::io::duplex(64);
        let err = accept(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::HandshakeTimeout(50)));
    }
}
