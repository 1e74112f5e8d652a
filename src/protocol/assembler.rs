//! Reassembly of fragmented WebSocket messages (RFC 6455 Section 5.4).

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::protocol::{Frame, OpCode};

/// Reassembles data frames into complete messages.
///
/// The opcode of the message is captured from the first (non-continuation)
/// data frame; continuation frames inherit it. Control frames may interleave
/// with the fragments of a message and are ignored here.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    opcode: Option<OpCode>,
}

/// A fully assembled message body with its effective opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// Opcode of the first frame of the message (Text or Binary).
    pub opcode: OpCode,
    /// Concatenated payload of all fragments, in arrival order.
    pub payload: Vec<u8>,
}

impl MessageAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            opcode: None,
        }
    }

    /// Add a data frame to the message being assembled.
    ///
    /// Returns `Some` when the frame carried `FIN=1` and the message is
    /// complete; the internal buffer is released at that point. Control
    /// frames return `None` without touching assembly state.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolViolation` for a continuation frame with no
    /// message in progress, or a fresh data frame while one is in progress.
    pub fn push(&mut self, frame: Frame) -> Result<Option<AssembledMessage>> {
        if frame.opcode.is_control() {
            return Ok(None);
        }

        if frame.opcode == OpCode::Continuation {
            if self.opcode.is_none() {
                return Err(Error::ProtocolViolation(
                    "unexpected continuation frame".into(),
                ));
            }
        } else {
            if self.opcode.is_some() {
                return Err(Error::ProtocolViolation(
                    "expected continuation frame".into(),
                ));
            }
            self.opcode = Some(frame.opcode);
        }

        self.buffer.extend_from_slice(&frame.payload);

        if frame.fin {
            let payload = self.buffer.split().to_vec();
            let opcode = self.opcode.take().unwrap();
            Ok(Some(AssembledMessage { opcode, payload }))
        } else {
            Ok(None)
        }
    }

    /// Whether a message is currently mid-assembly.
    #[must_use]
    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }

    /// Discard any partially assembled message.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.opcode = None;
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}
