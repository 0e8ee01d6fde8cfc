//! Hand-rolled WebSocket protocol layer for the beacon server.
//!
//! Provides:
//! - Opening handshake (`Sec-WebSocket-Key` / `Sec-WebSocket-Accept`)
//! - Frame codec: unmasked single-frame text out, masked frames in
//! - Buffered frame reader/writer over any tokio byte stream
//!
//! Fragmentation, ping/pong and close handshakes are not implemented.
//! Such frames are surfaced as [`Inbound::Dropped`] or [`Inbound::Close`]
//! so the caller decides what to do with them.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod stream;

pub use error::{WsError, WsResult};
pub use frame::{
    apply_mask, decode, encode_frame, encode_masked_text, encode_text, parse_frame, Frame, Opcode,
};
pub use handshake::{accept, accept_key, find_websocket_key, Handshake};
pub use stream::{DropReason, FrameReader, FrameWriter, Inbound};
