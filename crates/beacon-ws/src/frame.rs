//! Frame codec.
//!
//! Server-to-client frames are always a single final text frame, unmasked.
//! Client-to-server frames must carry a mask and are unmasked on decode.
//! Fragmentation and control frames are not reassembled or answered here;
//! they are surfaced as-is so the caller can drop them.

use crate::error::{WsError, WsResult};

/// FIN flag in the first header byte.
pub const FIN_BIT: u8 = 0x80;
/// MASK flag in the second header byte.
pub const MASK_BIT: u8 = 0x80;

const OPCODE_BITS: u8 = 0x0F;
const LENGTH_BITS: u8 = 0x7F;
/// Largest payload length that fits in the 7-bit field.
const SHORT_LEN_MAX: usize = 125;
/// Marker for a 16-bit extended length.
const LEN_16: u8 = 126;
/// Marker for a 64-bit extended length.
const LEN_64: u8 = 127;
const MASK_KEY_LEN: usize = 4;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    /// Parse the low nibble of the first header byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & OPCODE_BITS {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Wire value of this opcode.
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & OPCODE_BITS,
        }
    }

    /// Control opcodes (close, ping, pong).
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continuation => write!(f, "continuation"),
            Self::Text => write!(f, "text"),
            Self::Binary => write!(f, "binary"),
            Self::Close => write!(f, "close"),
            Self::Ping => write!(f, "ping"),
            Self::Pong => write!(f, "pong"),
            Self::Reserved(bits) => write!(f, "reserved(0x{bits:x})"),
        }
    }
}

/// A decoded (unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A complete, unfragmented text frame.
    pub fn is_final_text(&self) -> bool {
        self.fin && self.opcode == Opcode::Text
    }
}

/// Encode a server-to-client text frame (FIN set, unmasked).
pub fn encode_text(payload: &[u8]) -> Vec<u8> {
    encode_frame(true, Opcode::Text, payload, None)
}

/// Encode a client-to-server text frame with the given mask key.
pub fn encode_masked_text(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    encode_frame(true, Opcode::Text, payload, Some(mask))
}

/// Encode an arbitrary frame.
///
/// The length field uses the shortest form that fits the payload.
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mask_len = if mask.is_some() { MASK_KEY_LEN } else { 0 };
    let mut out = Vec::with_capacity(length_field_len(payload.len()) + 1 + mask_len + payload.len());

    let fin_bit = if fin { FIN_BIT } else { 0 };
    out.push(fin_bit | opcode.bits());

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let len = payload.len();
    if len <= SHORT_LEN_MAX {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Bytes used by the length field (including the 7-bit marker byte).
fn length_field_len(len: usize) -> usize {
    if len <= SHORT_LEN_MAX {
        1
    } else if len <= u16::MAX as usize {
        3
    } else {
        9
    }
}

/// XOR `payload[i]` with `mask[i % 4]`. Applying it twice is the identity.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % MASK_KEY_LEN];
    }
}

struct Header {
    fin: bool,
    opcode: Opcode,
    mask: [u8; 4],
    header_len: usize,
    payload_len: usize,
}

enum HeaderParse {
    Incomplete { needed: usize },
    Complete(Header),
}

fn parse_header(buf: &[u8], max_payload: usize) -> WsResult<HeaderParse> {
    if buf.len() < 2 {
        return Ok(HeaderParse::Incomplete { needed: 2 });
    }

    let fin = buf[0] & FIN_BIT != 0;
    let opcode = Opcode::from_bits(buf[0]);

    if buf[1] & MASK_BIT == 0 {
        return Err(WsError::UnmaskedFrame);
    }

    let (declared, mut offset) = match buf[1] & LENGTH_BITS {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(HeaderParse::Incomplete { needed: 4 + MASK_KEY_LEN });
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(HeaderParse::Incomplete { needed: 10 + MASK_KEY_LEN });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        short => (u64::from(short), 2),
    };

    let payload_len = match usize::try_from(declared) {
        Ok(len) if len <= max_payload => len,
        _ => {
            return Err(WsError::FrameTooLarge {
                len: declared,
                max: max_payload,
            })
        }
    };

    if buf.len() < offset + MASK_KEY_LEN {
        return Ok(HeaderParse::Incomplete {
            needed: (offset + MASK_KEY_LEN).saturating_add(payload_len),
        });
    }
    let mask = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
    offset += MASK_KEY_LEN;

    Ok(HeaderParse::Complete(Header {
        fin,
        opcode,
        mask,
        header_len: offset,
        payload_len,
    }))
}

/// Try to parse one inbound frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a whole frame, or the
/// frame plus the number of bytes it occupied.
pub fn parse_frame(buf: &[u8], max_payload: usize) -> WsResult<Option<(Frame, usize)>> {
    let header = match parse_header(buf, max_payload)? {
        HeaderParse::Incomplete { .. } => return Ok(None),
        HeaderParse::Complete(header) => header,
    };

    let total = header.header_len.saturating_add(header.payload_len);
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[header.header_len..total].to_vec();
    apply_mask(&mut payload, header.mask);

    Ok(Some((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        },
        total,
    )))
}

/// Decode a buffer that is expected to hold one complete inbound frame.
pub fn decode(buf: &[u8]) -> WsResult<Frame> {
    match parse_header(buf, usize::MAX)? {
        HeaderParse::Incomplete { needed } => Err(WsError::Truncated {
            needed,
            available: buf.len(),
        }),
        HeaderParse::Complete(header) => {
            let needed = header.header_len.saturating_add(header.payload_len);
            match parse_frame(buf, usize::MAX)? {
                Some((frame, _)) => Ok(frame),
                None => Err(WsError::Truncated {
                    needed,
                    available: buf.len(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    /// Declared length and header size of an unmasked outbound frame.
    fn outbound_length(frame: &[u8]) -> (usize, usize) {
        match frame[1] & LENGTH_BITS {
            LEN_16 => (u16::from_be_bytes([frame[2], frame[3]]) as usize, 4),
            LEN_64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&frame[2..10]);
                (u64::from_be_bytes(raw) as usize, 10)
            }
            short => (short as usize, 2),
        }
    }

    #[test]
    fn test_encode_sets_fin_and_text_opcode() {
        let frame = encode_text(b"hello");
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 5);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn test_encode_length_forms() {
        for (len, header) in [(0, 2), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let payload = payload_of(len);
            let frame = encode_text(&payload);
            let (declared, header_len) = outbound_length(&frame);
            assert_eq!(header_len, header, "header size for {len}");
            assert_eq!(declared, len, "declared length for {len}");
            assert_eq!(frame.len(), header_len + len);
            assert_eq!(&frame[header_len..], &payload[..]);
            assert_eq!(frame[1] & MASK_BIT, 0, "outbound frames are never masked");
        }
    }

    #[test]
    fn test_masked_round_trip_boundary_sizes() {
        for len in [0, 1, 125, 126, 65535, 65536] {
            let payload = payload_of(len);
            let frame = encode_masked_text(&payload, MASK);
            let decoded = decode(&frame).unwrap();
            assert!(decoded.is_final_text());
            assert_eq!(decoded.payload, payload, "round trip for {len}");
        }
    }

    #[test]
    fn test_masking_actually_scrambles_payload() {
        let frame = encode_masked_text(b"abcd", MASK);
        assert_ne!(&frame[6..], b"abcd");
    }

    #[test]
    fn test_unmasked_inbound_rejected() {
        let frame = encode_text(b"{\"type\":\"heartbeat\"}");
        assert!(matches!(decode(&frame), Err(WsError::UnmaskedFrame)));
        assert!(matches!(
            parse_frame(&frame, 1024),
            Err(WsError::UnmaskedFrame)
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = encode_masked_text(b"hello world", MASK);
        match decode(&frame[..frame.len() - 1]) {
            Err(WsError::Truncated { needed, available }) => {
                assert_eq!(needed, frame.len());
                assert_eq!(available, frame.len() - 1);
            }
            other => panic!("expected truncated, got {other:?}"),
        }
        assert!(matches!(decode(&[0x81]), Err(WsError::Truncated { .. })));
    }

    #[test]
    fn test_parse_frame_incremental() {
        let frame = encode_masked_text(&payload_of(300), MASK);
        for cut in 0..frame.len() {
            assert!(parse_frame(&frame[..cut], 1 << 20).unwrap().is_none());
        }
        let (decoded, used) = parse_frame(&frame, 1 << 20).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(decoded.payload, payload_of(300));
    }

    #[test]
    fn test_parse_frame_consumes_one_frame_at_a_time() {
        let mut buf = encode_masked_text(b"first", MASK);
        buf.extend(encode_masked_text(b"second", MASK));

        let (first, used) = parse_frame(&buf, 1024).unwrap().unwrap();
        assert_eq!(first.payload, b"first");
        let (second, rest) = parse_frame(&buf[used..], 1024).unwrap().unwrap();
        assert_eq!(second.payload, b"second");
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_frame_too_large() {
        let frame = encode_masked_text(&payload_of(200), MASK);
        assert!(matches!(
            parse_frame(&frame, 100),
            Err(WsError::FrameTooLarge { len: 200, max: 100 })
        ));
    }

    #[test]
    fn test_control_and_fragment_frames_are_surfaced() {
        let ping = encode_frame(true, Opcode::Ping, b"", Some(MASK));
        let decoded = decode(&ping).unwrap();
        assert_eq!(decoded.opcode, Opcode::Ping);
        assert!(decoded.opcode.is_control());
        assert!(!decoded.is_final_text());

        let fragment = encode_frame(false, Opcode::Text, b"part", Some(MASK));
        let decoded = decode(&fragment).unwrap();
        assert!(!decoded.fin);
        assert!(!decoded.is_final_text());
    }

    #[test]
    fn test_opcode_bits_round_trip() {
        for bits in 0u8..16 {
            assert_eq!(Opcode::from_bits(bits).bits(), bits);
        }
    }
}
