//! WebSocket protocol core (RFC 6455): framing, parsing, reassembly, handshake.

pub mod assembler;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod parser;

pub use assembler::{AssembledMessage, MessageAssembler};
pub use frame::Frame;
pub use handshake::{compute_accept_key, HandshakeRequest, HandshakeResponse, WS_GUID};
pub use mask::{apply_mask, apply_mask_fast};
pub use opcode::OpCode;
pub use parser::FrameParser;
