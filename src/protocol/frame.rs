//! WebSocket frame encoding and decoding (RFC 6455 Section 5).

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::mask::apply_mask_fast;
use crate::protocol::OpCode;

/// Maximum payload size for control frames (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Decoded frame header, shared between the header peek and the full parse.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: usize,
    pub header_len: usize,
}

/// Parse a frame header from the start of `buf`.
///
/// Handles all three length encodings (7-bit, 16-bit, 64-bit big-endian)
/// and the optional 4-byte mask key.
///
/// # Errors
///
/// - `Error::IncompleteFrame` if the header is not fully buffered yet
/// - `Error::InvalidOpcode` / `Error::ReservedOpcode` for bad opcodes
pub(crate) fn parse_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < 2 {
        return Err(Error::IncompleteFrame {
            needed: 2 - buf.len(),
        });
    }

    let byte0 = buf[0];
    let byte1 = buf[1];

    let fin = (byte0 & 0x80) != 0;
    let rsv1 = (byte0 & 0x40) != 0;
    let rsv2 = (byte0 & 0x20) != 0;
    let rsv3 = (byte0 & 0x10) != 0;
    let opcode = OpCode::from_u8(byte0 & 0x0F)?;

    let masked = (byte1 & 0x80) != 0;
    let len7 = byte1 & 0x7F;

    let (payload_len, len_end) = match len7 {
        0..=125 => (len7 as usize, 2),
        126 => {
            if buf.len() < 4 {
                return Err(Error::IncompleteFrame {
                    needed: 4 - buf.len(),
                });
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Err(Error::IncompleteFrame {
                    needed: 10 - buf.len(),
                });
            }
            let len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            let len = usize::try_from(len).map_err(|_| {
                Error::InvalidFrame("payload length exceeds platform limits".into())
            })?;
            (len, 10)
        }
        _ => unreachable!(),
    };

    let header_len = if masked { len_end + 4 } else { len_end };
    if buf.len() < header_len {
        return Err(Error::IncompleteFrame {
            needed: header_len - buf.len(),
        });
    }

    let mask = if masked {
        Some([buf[len_end], buf[len_end + 1], buf[len_end + 2], buf[len_end + 3]])
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        mask,
        payload_len,
        header_len,
    })
}

/// A single WebSocket frame.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                 Masking key (if MASK set)                     |
/// +---------------------------------------------------------------+
/// |                         Payload data                          |
/// +---------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Set on the first frame of a permessage-deflate compressed message.
    pub rsv1: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given parameters and `RSV1` clear.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            payload,
        }
    }

    /// Create a final text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a final binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a close frame with an optional status code and reason.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut data = code.to_be_bytes().to_vec();
                data.extend_from_slice(reason.as_bytes());
                data
            }
            None => Vec::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Parse one frame from the start of `buf`.
    ///
    /// Returns the frame (payload unmasked) and the number of bytes consumed.
    /// Frames with `RSV2` or `RSV3` set are rejected; no extension negotiated
    /// by this client uses them.
    ///
    /// # Errors
    ///
    /// - `Error::IncompleteFrame` if the frame is not fully buffered yet
    /// - `Error::ReservedOpcode` / `Error::InvalidOpcode` for bad opcodes
    /// - `Error::ProtocolViolation` if RSV2/RSV3 are set
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let header = parse_header(buf)?;

        if header.rsv2 || header.rsv3 {
            return Err(Error::ProtocolViolation("reserved bits RSV2/RSV3 set".into()));
        }

        let total = header
            .header_len
            .checked_add(header.payload_len)
            .ok_or_else(|| Error::InvalidFrame("frame length overflow".into()))?;

        if buf.len() < total {
            return Err(Error::IncompleteFrame {
                needed: total - buf.len(),
            });
        }

        let mut payload = buf[header.header_len..total].to_vec();
        if let Some(mask) = header.mask {
            apply_mask_fast(&mut payload, mask);
        }

        Ok((
            Frame {
                fin: header.fin,
                rsv1: header.rsv1,
                opcode: header.opcode,
                payload,
            },
            total,
        ))
    }

    /// Validate control-frame rules (RFC 6455 Section 5.5).
    ///
    /// # Errors
    ///
    /// - `Error::FragmentedControlFrame` if a control frame has `FIN=0`
    /// - `Error::ControlFrameTooLarge` if a control payload exceeds 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }
        Ok(())
    }

    /// Serialize this frame into `buf`, masking the payload when a key is given.
    pub fn write_to(&self, buf: &mut BytesMut, mask: Option<[u8; 4]>) {
        buf.reserve(self.wire_len(mask.is_some()));

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        buf.put_u8(byte0);

        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        let len = self.payload.len();
        if len <= 125 {
            buf.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask_fast(&mut buf[start..], key);
            }
            None => buf.put_slice(&self.payload),
        }
    }

    /// Serialize this frame into a fresh buffer.
    #[must_use]
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_len(mask.is_some()));
        self.write_to(&mut buf, mask);
        buf.to_vec()
    }

    /// Number of bytes this frame occupies on the wire.
    #[must_use]
    pub fn wire_len(&self, masked: bool) -> usize {
        let len = self.payload.len();
        let ext = if len <= 125 {
            0
        } else if len <= u16::MAX as usize {
            2
        } else {
            8
        };
        2 + ext + if masked { 4 } else { 0 } + len
    }
}
