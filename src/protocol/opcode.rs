//! WebSocket frame opcodes as defined in RFC 6455.

use crate::error::{Error, Result};

/// WebSocket frame opcode.
///
/// Defines the interpretation of the payload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum OpCode {
    /// Continuation frame (0x0), part of a fragmented message.
    Continuation = 0x0,

    /// Text frame (0x1). Payload must be valid UTF-8 once assembled.
    Text = 0x1,

    /// Binary frame (0x2). Payload is arbitrary bytes.
    Binary = 0x2,

    /// Close frame (0x8). Carries an optional status code and reason.
    Close = 0x8,

    /// Ping frame (0x9). Liveness probe.
    Ping = 0x9,

    /// Pong frame (0xA). Liveness acknowledgement.
    Pong = 0xA,
}

impl OpCode {
    /// Create an `OpCode` from its raw 4-bit value.
    ///
    /// # Errors
    ///
    /// Returns `Error::ReservedOpcode` for values reserved by RFC 6455 and
    /// `Error::InvalidOpcode` for values outside the 4-bit range.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x3..=0x7 => Err(Error::ReservedOpcode(byte)),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            0xB..=0xF => Err(Error::ReservedOpcode(byte)),
            _ => Err(Error::InvalidOpcode(byte)),
        }
    }

    /// Raw 4-bit value of this opcode.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this is a control frame opcode (Close, Ping, Pong).
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Whether this is a data frame opcode (Continuation, Text, Binary).
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Continuation => "Continuation",
            OpCode::Text => "Text",
            OpCode::Binary => "Binary",
            OpCode::Close => "Close",
            OpCode::Ping => "Ping",
            OpCode::Pong => "Pong",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_valid() {
        assert_eq!(OpCode::from_u8(0x0).unwrap(), OpCode::Continuation);
        assert_eq!(OpCode::from_u8(0x1).unwrap(), OpCode::Text);
        assert_eq!(OpCode::from_u8(0x2).unwrap(), OpCode::Binary);
        assert_eq!(OpCode::from_u8(0x8).unwrap(), OpCode::Close);
        assert_eq!(OpCode::from_u8(0x9).unwrap(), OpCode::Ping);
        assert_eq!(OpCode::from_u8(0xA).unwrap(), OpCode::Pong);
    }

    #[test]
    fn test_from_u8_reserved() {
        for reserved in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(matches!(
                OpCode::from_u8(reserved),
                Err(Error::ReservedOpcode(_))
            ));
        }
    }

    #[test]
    fn test_as_u8_roundtrip() {
        for code in [
            OpCode::Continuation,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            assert_eq!(OpCode::from_u8(code.as_u8()).unwrap(), code);
        }
    }

    #[test]
    fn test_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_is_data() {
        assert!(OpCode::Continuation.is_data());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(!OpCode::Close.is_data());
    }
}
