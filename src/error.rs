//! Error types for the WebSocket client.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while connecting, framing, or exchanging messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid frame structure or header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Protocol violation detected on the wire.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 in a text message body.
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Frame (or inflated message) exceeds the configured maximum.
    #[error("Frame is too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Observed size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Incomplete frame data.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },

    /// Invalid opcode value.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame fragmented (RFC violation).
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// The server answered the Upgrade request with something other than 101.
    #[error("Unexpected HTTP response: {status}")]
    UnexpectedResponse {
        /// HTTP status code received.
        status: u16,
    },

    /// The server's `Sec-WebSocket-Accept` did not match the derived key.
    #[error("Server accept key mismatch")]
    InvalidServerKey,

    /// Malformed or incomplete handshake exchange.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The endpoint URL could not be parsed or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid close code.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// The connection has been closed.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// An operation requires an open connection.
    #[error("Connection is not open")]
    NotConnected,

    /// `connect` was called on a connection that is already active.
    #[error("Connection is already active")]
    AlreadyConnected,

    /// Compression or decompression failure.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Payload cipher failure.
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}
