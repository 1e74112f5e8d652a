//! Message payloads and the payload-level codec.
//!
//! The wire carries text or binary frames; the configured payload kind
//! decides how complete message bodies are interpreted on the way in and
//! produced on the way out: JSON stringify/parse, optional URI-component
//! encoding, and an optional symmetric cipher supplied by the caller.

use std::fmt;
use std::sync::Arc;

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;

use crate::error::Result;
use crate::protocol::OpCode;

/// Characters escaped by the URI-component codec: everything outside the
/// unreserved set of `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// How message bodies are interpreted and produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum PayloadKind {
    /// UTF-8 text messages.
    #[default]
    Text,
    /// Raw binary messages.
    Binary,
    /// Raw binary messages (alias kept for configuration compatibility).
    Buffer,
    /// JSON values carried over text frames.
    Json,
}

impl PayloadKind {
    /// Whether this kind travels as binary frames.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, PayloadKind::Binary | PayloadKind::Buffer)
    }
}

/// A decoded message delivered to (or accepted from) the application.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Payload {
    /// A UTF-8 text message.
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// A JSON value.
    Json(serde_json::Value),
}

impl Payload {
    /// Create a text payload.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Text(s.into())
    }

    /// Create a binary payload.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Payload::Binary(data.into())
    }

    /// Create a JSON payload.
    #[must_use]
    pub fn json(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }

    /// Borrow the text content, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the binary content, if this is a binary payload.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// Borrow the JSON value, if this is a JSON payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(data)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Symmetric payload encryption collaborator.
///
/// Applied to outbound bodies after JSON stringification and before the
/// optional URI-component encoding; inbound in the mirrored order. Ciphers
/// producing non-UTF-8 output need the URI-component option enabled, since
/// inbound text bodies pass a UTF-8 gate before decryption.
pub trait PayloadCipher: Send + Sync {
    /// Encrypt a plaintext body.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    /// Decrypt a ciphertext body.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Payload codec for one connection.
#[derive(Clone)]
pub struct PayloadCodec {
    kind: PayloadKind,
    encode_decode: bool,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("kind", &self.kind)
            .field("encode_decode", &self.encode_decode)
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

impl PayloadCodec {
    /// Create a codec for the configured kind and options.
    #[must_use]
    pub fn new(
        kind: PayloadKind,
        encode_decode: bool,
        cipher: Option<Arc<dyn PayloadCipher>>,
    ) -> Self {
        Self {
            kind,
            encode_decode,
            cipher,
        }
    }

    /// Encode an outbound payload into frame opcode and body bytes.
    ///
    /// `raw` skips JSON stringification for text handed over in `json` mode.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cipher` on cipher failure. JSON serialization of a
    /// `serde_json::Value` is infallible.
    pub fn encode(&self, payload: Payload, raw: bool) -> Result<(OpCode, Vec<u8>)> {
        if self.kind.is_binary() {
            let bytes = match payload {
                Payload::Binary(data) => data,
                Payload::Text(s) => s.into_bytes(),
                Payload::Json(value) => value.to_string().into_bytes(),
            };
            return Ok((OpCode::Binary, bytes));
        }

        let mut bytes = match payload {
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Text(s) => {
                if self.kind == PayloadKind::Json && !raw {
                    serde_json::Value::String(s).to_string().into_bytes()
                } else {
                    s.into_bytes()
                }
            }
            Payload::Binary(data) => data,
        };

        if let Some(ref cipher) = self.cipher {
            bytes = cipher.encrypt(&bytes)?;
        }
        if self.encode_decode {
            bytes = percent_encode(&bytes, COMPONENT).to_string().into_bytes();
        }

        Ok((OpCode::Text, bytes))
    }

    /// Decode a complete inbound message body.
    ///
    /// Returns `Ok(None)` for bodies that are silently dropped: malformed
    /// UTF-8 in text modes and malformed JSON in `json` mode.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cipher` on cipher failure.
    pub fn decode(&self, body: Vec<u8>) -> Result<Option<Payload>> {
        if self.kind.is_binary() {
            return Ok(Some(Payload::Binary(body)));
        }

        let mut text = match String::from_utf8(body) {
            Ok(text) => text,
            Err(_) => {
                warn!("dropping message with invalid UTF-8 body");
                return Ok(None);
            }
        };

        if let Some(ref cipher) = self.cipher {
            // Ciphertext is arbitrary bytes, so the URI-component decoding
            // happens at the byte level before decryption.
            let ciphertext: Vec<u8> = if self.encode_decode {
                percent_decode_str(&text).collect()
            } else {
                std::mem::take(&mut text).into_bytes()
            };
            let plain = cipher.decrypt(&ciphertext)?;
            text = match String::from_utf8(plain) {
                Ok(text) => text,
                Err(_) => {
                    warn!("dropping message: decrypted body is not valid UTF-8");
                    return Ok(None);
                }
            };
        } else if self.encode_decode {
            // On any percent-decoding failure the string is delivered
            // unchanged.
            let decoded = match percent_decode_str(&text).decode_utf8() {
                Ok(cow) => Some(cow.into_owned()),
                Err(_) => None,
            };
            if let Some(decoded) = decoded {
                text = decoded;
            }
        }

        if self.kind == PayloadKind::Json {
            return match serde_json::from_str(&text) {
                Ok(value) => Ok(Some(Payload::Json(value))),
                Err(_) => {
                    warn!("dropping non-JSON message in json mode");
                    Ok(None)
                }
            };
        }

        Ok(Some(Payload::Text(text)))
    }
}
