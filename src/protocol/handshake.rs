//! Client-side WebSocket opening handshake (RFC 6455 Section 4).
//!
//! Builds the HTTP/1.1 Upgrade request, parses the server's response, and
//! verifies the `Sec-WebSocket-Accept` derivation.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{Error, Result};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response headers that must not appear more than once.
const SECURITY_HEADERS: [&str; 3] = ["upgrade", "connection", "sec-websocket-accept"];

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// The accept key is `base64(SHA1(key || GUID))`.
///
/// # Example
///
/// ```
/// use tether::protocol::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| Error::Io(format!("random nonce generation failed: {e}")))?;
    Ok(BASE64.encode(nonce))
}

/// Find the end of the HTTP header block (`\r\n\r\n`) in `buf`.
///
/// Returns the index of the first byte after the blank line.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse HTTP header lines into a case-insensitive map.
///
/// Rejects duplicated security-critical headers.
fn parse_headers<'a, I>(lines: I) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name_lower = name.trim().to_lowercase();
            if SECURITY_HEADERS.contains(&name_lower.as_str())
                && headers.contains_key(&name_lower)
            {
                return Err(Error::InvalidHandshake(format!(
                    "duplicate header: {}",
                    name.trim()
                )));
            }
            headers.insert(name_lower, value.trim().to_string());
        }
    }

    Ok(headers)
}

/// An outgoing Upgrade request.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// `Host` header value (`host` or `host:port` for non-default ports).
    pub host: String,
    /// Request target: path plus optional query string.
    pub path: String,
    /// The generated `Sec-WebSocket-Key`.
    pub key: String,
    /// Optional subprotocol token to request.
    pub protocol: Option<String>,
    /// Optional origin, sent as `Sec-WebSocket-Origin`.
    pub origin: Option<String>,
    /// Whether to offer `permessage-deflate`.
    pub compress: bool,
    /// Extra user headers appended verbatim.
    pub headers: Vec<(String, String)>,
    /// Cookies, joined into a single `Cookie` header as `name=value` pairs.
    pub cookies: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// Build a request for `url` with a freshly generated key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if the URL has no host, or `Error::Io` if
    /// the random nonce cannot be generated.
    pub fn new(url: &Url) -> Result<Self> {
        let host_str = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("missing host: {url}")))?;
        let host = match url.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str.to_string(),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            host,
            path,
            key: generate_key()?,
            protocol: None,
            origin: None,
            compress: false,
            headers: Vec::new(),
            cookies: Vec::new(),
        })
    }

    /// Serialize the request as HTTP/1.1 bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&format!("GET {} HTTP/1.1\r\n", self.path));
        out.push_str(&format!("Host: {}\r\n", self.host));
        out.push_str("Upgrade: websocket\r\n");
        out.push_str("Connection: Upgrade\r\n");
        out.push_str("Sec-WebSocket-Version: 13\r\n");
        out.push_str(&format!("Sec-WebSocket-Key: {}\r\n", self.key));

        if let Some(ref protocol) = self.protocol {
            out.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        if let Some(ref origin) = self.origin {
            out.push_str(&format!("Sec-WebSocket-Origin: {origin}\r\n"));
        }
        if self.compress {
            out.push_str("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n");
        }
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if !self.cookies.is_empty() {
            let joined: Vec<String> = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            out.push_str(&format!("Cookie: {}\r\n", joined.join(", ")));
        }

        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// A parsed Upgrade response from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Sec-WebSocket-Accept` header, if present.
    pub accept: Option<String>,
    /// Subprotocol selected by the server, if any.
    pub protocol: Option<String>,
    /// Comma-separated `Sec-WebSocket-Extensions` tokens.
    pub extensions: Vec<String>,
}

impl HandshakeResponse {
    /// Parse a response header block.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHandshake` for malformed status lines, missing
    /// or wrong `Upgrade`/`Connection` headers on a 101 response, or
    /// duplicated security-critical headers.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("response is not valid UTF-8".into()))?;

        let mut lines = text.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("empty response".into()))?;

        let mut parts = status_line.split_whitespace();
        let version = parts
            .next()
            .ok_or_else(|| Error::InvalidHandshake("missing HTTP version".into()))?;
        if !version.starts_with("HTTP/1.1") {
            return Err(Error::InvalidHandshake(format!(
                "expected HTTP/1.1, got: {status_line}"
            )));
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| Error::InvalidHandshake(format!("bad status line: {status_line}")))?;

        let headers = parse_headers(lines)?;

        if status == 101 {
            let upgrade = headers
                .get("upgrade")
                .ok_or_else(|| Error::InvalidHandshake("missing Upgrade header".into()))?;
            if !upgrade.eq_ignore_ascii_case("websocket") {
                return Err(Error::InvalidHandshake(format!(
                    "invalid Upgrade header: {upgrade}"
                )));
            }
            let connection = headers
                .get("connection")
                .ok_or_else(|| Error::InvalidHandshake("missing Connection header".into()))?;
            if !connection.to_lowercase().contains("upgrade") {
                return Err(Error::InvalidHandshake(format!(
                    "invalid Connection header: {connection}"
                )));
            }
        }

        let extensions = headers
            .get("sec-websocket-extensions")
            .map(|value| value.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(Self {
            status,
            accept: headers.get("sec-websocket-accept").cloned(),
            protocol: headers.get("sec-websocket-protocol").cloned(),
            extensions,
        })
    }

    /// Verify the protocol switch against the key we sent.
    ///
    /// # Errors
    ///
    /// - `Error::UnexpectedResponse` for any status other than 101
    /// - `Error::InvalidServerKey` if `Sec-WebSocket-Accept` is missing or
    ///   does not byte-equal the expected derivation
    pub fn verify(&self, key: &str) -> Result<()> {
        if self.status != 101 {
            return Err(Error::UnexpectedResponse {
                status: self.status,
            });
        }
        let expected = compute_accept_key(key);
        match self.accept {
            Some(ref accept) if accept.as_bytes() == expected.as_bytes() => Ok(()),
            _ => Err(Error::InvalidServerKey),
        }
    }

    /// Whether the server agreed to a deflate extension.
    ///
    /// Matches any extension token containing `-deflate`.
    #[must_use]
    pub fn negotiated_deflate(&self) -> bool {
        self.extensions
            .iter()
            .any(|token| token.split(';').next().unwrap_or("").contains("-deflate"))
    }
}
