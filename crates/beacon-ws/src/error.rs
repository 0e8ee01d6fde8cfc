//! WebSocket protocol error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("Inbound frame is not masked")]
    UnmaskedFrame,

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u64, max: usize },

    #[error("Connection closed by peer")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// Protocol violations drop the connection without touching other clients.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_)
                | Self::HandshakeTimeout(_)
                | Self::UnmaskedFrame
                | Self::Truncated { .. }
                | Self::FrameTooLarge { .. }
        )
    }
}

pub type WsResult<T> = Result<T, WsError>;
