//! Incremental frame parsing over a stream of TCP chunks.
//!
//! [`FrameParser`] owns the receive accumulator: bytes arrive in arbitrary
//! chunks via [`feed`](FrameParser::feed), and [`next_frame`](FrameParser::next_frame)
//! yields complete frames as soon as they are fully buffered. The unconsumed
//! buffer is always either empty or a prefix of one or more unparsed frames.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::frame::{parse_header, Frame};

/// Streaming WebSocket frame parser.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    /// Maximum accepted wire size (header + payload) per frame; 0 = unbounded.
    max_frame_len: usize,
}

impl FrameParser {
    /// Create a parser with the given frame size limit (0 disables the limit).
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_len,
        }
    }

    /// Append a chunk of bytes from the socket to the accumulator.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The size limit is
    /// enforced as soon as the header is decodable, before the payload has
    /// arrived, so an oversized frame is rejected without buffering it.
    ///
    /// # Errors
    ///
    /// - `Error::FrameTooLarge` when header + payload exceed the limit
    ///   (the caller closes with status 1009)
    /// - opcode / reserved-bit errors from frame parsing
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match parse_header(&self.buf) {
            Ok(header) => header,
            Err(Error::IncompleteFrame { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if self.max_frame_len != 0 {
            let total = header.header_len.saturating_add(header.payload_len);
            if total > self.max_frame_len {
                return Err(Error::FrameTooLarge {
                    size: total,
                    max: self.max_frame_len,
                });
            }
        }

        match Frame::parse(&self.buf) {
            Ok((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(Error::IncompleteFrame { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Number of buffered, not-yet-parsed bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
