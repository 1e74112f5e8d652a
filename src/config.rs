//! Connection configuration.
//!
//! A [`Config`] is handed to the client once and is immutable for the life of
//! the connection, including across reconnects.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::payload::{PayloadCipher, PayloadKind};

/// TLS material and verification options for `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip server certificate verification when `false`.
    ///
    /// Disabling verification is for test harnesses only.
    pub reject_unauthorized: bool,
    /// PEM file with the client private key, for mutual TLS.
    pub key: Option<PathBuf>,
    /// PEM file with the client certificate chain, for mutual TLS.
    pub cert: Option<PathBuf>,
}

impl TlsOptions {
    /// Verification on, no client certificate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reject_unauthorized: true,
            key: None,
            cert: None,
        }
    }
}

/// WebSocket client configuration.
#[derive(Clone)]
pub struct Config {
    /// Payload coding for inbound and outbound messages.
    pub kind: PayloadKind,

    /// Mask outbound frames.
    ///
    /// RFC 6455 requires client frames to be masked; `false` is a
    /// non-conforming knob for test harnesses.
    pub masking: bool,

    /// Offer `permessage-deflate` during the handshake.
    pub compress: bool,

    /// Delay before reconnecting after a connection is lost.
    ///
    /// `Duration::ZERO` disables reconnection.
    pub reconnect: Duration,

    /// Retry immediately (instead of after `reconnect`) when the server
    /// answers the Upgrade with a non-101 response.
    pub reconnect_on_http_error: bool,

    /// URI-component-encode outbound text and decode inbound text.
    pub encode_decode: bool,

    /// Optional symmetric payload cipher.
    pub cipher: Option<Arc<dyn PayloadCipher>>,

    /// Maximum accepted frame size on the wire and inflated message size,
    /// in bytes. `0` = unbounded. Exceeding it closes with status 1009.
    pub max_frame_len: usize,

    /// Extra headers appended to the Upgrade request.
    pub headers: Vec<(String, String)>,

    /// Cookies joined into a single `Cookie` header.
    pub cookies: Vec<(String, String)>,

    /// TLS options for `wss://` endpoints.
    pub tls: TlsOptions,

    /// Connect through a UNIX domain socket instead of TCP.
    ///
    /// The URL still provides the `Host` header and request path.
    #[cfg(unix)]
    pub unix_socket: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: PayloadKind::Text,
            masking: true,
            compress: true,
            reconnect: Duration::ZERO,
            reconnect_on_http_error: false,
            encode_decode: false,
            cipher: None,
            max_frame_len: 0,
            headers: Vec::new(),
            cookies: Vec::new(),
            tls: TlsOptions::new(),
            #[cfg(unix)]
            unix_socket: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("kind", &self.kind)
            .field("masking", &self.masking)
            .field("compress", &self.compress)
            .field("reconnect", &self.reconnect)
            .field("reconnect_on_http_error", &self.reconnect_on_http_error)
            .field("encode_decode", &self.encode_decode)
            .field("cipher", &self.cipher.is_some())
            .field("max_frame_len", &self.max_frame_len)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Config {
    /// Create a configuration with defaults: text payloads, masking on,
    /// compression offered, reconnection disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload kind.
    #[must_use]
    pub fn with_kind(mut self, kind: PayloadKind) -> Self {
        self.kind = kind;
        self
    }

    /// Enable or disable outbound frame masking (test harnesses only).
    #[must_use]
    pub fn with_masking(mut self, masking: bool) -> Self {
        self.masking = masking;
        self
    }

    /// Enable or disable the `permessage-deflate` offer.
    #[must_use]
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the reconnect delay; `Duration::ZERO` disables reconnection.
    #[must_use]
    pub fn with_reconnect(mut self, delay: Duration) -> Self {
        self.reconnect = delay;
        self
    }

    /// Retry immediately on a non-101 Upgrade response.
    #[must_use]
    pub fn with_reconnect_on_http_error(mut self, enabled: bool) -> Self {
        self.reconnect_on_http_error = enabled;
        self
    }

    /// Enable URI-component encoding of outbound and decoding of inbound text.
    #[must_use]
    pub fn with_encode_decode(mut self, enabled: bool) -> Self {
        self.encode_decode = enabled;
        self
    }

    /// Install a symmetric payload cipher.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Set the maximum accepted frame / inflated message size (0 = unbounded).
    #[must_use]
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Append an extra Upgrade request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a cookie to the `Cookie` header.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Set TLS options.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Connect through a UNIX domain socket instead of TCP.
    #[cfg(unix)]
    #[must_use]
    pub fn with_unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(path.into());
        self
    }
}
