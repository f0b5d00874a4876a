//! WebSocket frame codec (RFC 6455 §5).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status codes (RFC 6455 §7.4.1).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;

    /// Whether a peer may put `code` on the wire. 1005, 1006 and 1015 are
    /// local-only markers; other gaps are unassigned.
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: &'static str },

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: usize },
}

impl FrameError {
    fn invalid(reason: &'static str) -> Self {
        Self::InvalidFrame { reason }
    }
}

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// One WebSocket frame.
///
/// Decoded frames always hold the unmasked payload; `mask` records the key
/// the peer used so callers can enforce the client-must-mask rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// A final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    /// Sets the masking key used by [`encode`](Self::encode).
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold the whole frame, and
    /// `Ok(Some((frame, consumed)))` otherwise. Payloads longer than
    /// `max_payload` are rejected before any of their bytes are buffered.
    ///
    /// # Errors
    ///
    /// [`FrameError::InvalidFrame`] for reserved bits, unknown opcodes,
    /// malformed control frames and 64-bit lengths with the high bit set;
    /// [`FrameError::PayloadTooLarge`] when the declared length exceeds `max_payload`.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        if b0 & 0x70 != 0 {
            return Err(FrameError::invalid("reserved bits set"));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F).ok_or(FrameError::invalid("unknown opcode"))?;
        let masked = b1 & 0x80 != 0;

        let mut offset = 2;
        let len = match b1 & 0x7F {
            126 => {
                let Some(ext) = buf.get(2..4) else {
                    return Ok(None);
                };
                offset = 4;
                u64::from(u16::from_be_bytes([ext[0], ext[1]]))
            }
            127 => {
                let Some(ext) = buf.get(2..10) else {
                    return Ok(None);
                };
                offset = 10;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(ext);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(FrameError::invalid("64-bit length with the high bit set"));
                }
                len
            }
            n => u64::from(n),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::invalid("fragmented control frame"));
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::invalid("control frame payload longer than 125 bytes"));
            }
        }
        if len > max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: max_payload,
            });
        }
        let len = usize::try_from(len).map_err(|_| FrameError::invalid("length overflows usize"))?;

        let mask = if masked {
            let Some(key) = buf.get(offset..offset + 4) else {
                return Ok(None);
            };
            offset += 4;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        if buf.len() - offset < len {
            return Ok(None);
        }

        let mut payload = buf[offset..offset + len].to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some((
            Frame {
                fin,
                opcode,
                mask,
                payload: Bytes::from(payload),
            },
            offset + len,
        )))
    }

    /// Decodes a single complete frame.
    ///
    /// # Errors
    ///
    /// Everything [`parse`](Self::parse) rejects, plus
    /// [`FrameError::InvalidFrame`] when the declared length exceeds the bytes available.
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        match Self::parse(bytes, usize::MAX)? {
            Some((frame, _)) => Ok(frame),
            None => Err(FrameError::invalid(
                "declared length exceeds available bytes",
            )),
        }
    }

    /// Encodes the frame, masking the payload when a key is set.
    pub fn encode(&self) -> BytesMut {
        let len = self.payload.len();
        let mut buf = BytesMut::with_capacity(len + 14);

        let fin = if self.fin { 0x80 } else { 0x00 };
        buf.put_u8(fin | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if len <= 125 {
            buf.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }

        match self.mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            None => buf.put_slice(&self.payload),
        }

        buf
    }
}

/// Encodes a final, unmasked server-to-client frame.
pub fn encode(payload: &[u8], opcode: Opcode) -> BytesMut {
    Frame::new(opcode, Bytes::copy_from_slice(payload)).encode()
}

/// Encodes a text frame.
pub fn encode_text(text: &str) -> BytesMut {
    encode(text.as_bytes(), Opcode::Text)
}

/// Encodes a close frame: 2-byte big-endian status code followed by the UTF-8 reason.
pub fn encode_close(code: u16, reason: &str) -> BytesMut {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    // Control payloads are capped at 125 bytes; keep the reason on a char boundary.
    let mut cut = payload.len().min(MAX_CONTROL_PAYLOAD);
    while cut > 2 && std::str::from_utf8(&payload[2..cut]).is_err() {
        cut -= 1;
    }
    payload.truncate(cut);
    encode(&payload, Opcode::Close)
}

/// Splits a close payload into its status code and reason.
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    match payload {
        [hi, lo, reason @ ..] => (
            Some(u16::from_be_bytes([*hi, *lo])),
            String::from_utf8_lossy(reason).into_owned(),
        ),
        _ => (None, String::new()),
    }
}

/// XORs `buf` in place with `key[i % 4]`. Applying it twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
