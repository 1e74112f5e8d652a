//! The connection driver task.
//!
//! One task owns the socket, the frame parser, the message assembler, and
//! the compression engine for the current connection generation. It multiplexes
//! socket reads against user commands, delivers events to subscribers, and
//! schedules reconnection. Everything per-socket dies with the generation;
//! the event registry, configuration, and reconnect counter live across
//! generations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::client::events::EventDispatcher;
use crate::client::state::{ConnectionState, StateHandle};
use crate::client::stream::MaybeTlsStream;
use crate::config::Config;
use crate::deflate::{DeflateEngine, DeflateParams};
use crate::error::{Error, Result};
use crate::payload::{Payload, PayloadCodec};
use crate::protocol::handshake::{find_header_end, HandshakeRequest, HandshakeResponse};
use crate::protocol::{Frame, FrameParser, MessageAssembler, OpCode};

/// Largest accepted handshake response head.
const MAX_HANDSHAKE_LEN: usize = 8192;

/// Liveness probe payloads. The responder answers pings with the literal
/// `PONG` rather than echoing, matching the peer implementation this client
/// was built against.
const PING_PAYLOAD: &[u8] = b"PING";
const PONG_PAYLOAD: &[u8] = b"PONG";

/// User commands forwarded into the driver task.
#[derive(Debug)]
pub(crate) enum Command {
    Send { payload: Payload, raw: bool },
    Ping,
    Close { code: u16, reason: String, resume: bool },
}

/// How a connection generation ended.
struct SessionEnd {
    code: u16,
    reason: String,
    /// Whether the reconnect schedule may fire for this exit.
    reconnect: bool,
}

/// Why the connect phase stopped before a session ran.
enum ConnectOutcome {
    Established(Box<Session>),
    Failed(Error),
    Aborted { code: u16, reason: String, resume: bool },
    HandlesGone,
}

/// Per-socket state for one connection generation.
struct Session {
    stream: MaybeTlsStream,
    parser: FrameParser,
    assembler: MessageAssembler,
    deflate: Option<DeflateEngine>,
    /// Whether the message currently being assembled arrived compressed.
    msg_compressed: bool,
    write_buf: BytesMut,
    mask_state: u32,
    masking: bool,
}

impl Session {
    fn next_mask(&mut self) -> [u8; 4] {
        // Counter-scrambled PRNG; masks need to be unpredictable enough to
        // defeat cache poisoning, not cryptographically strong.
        self.mask_state = self.mask_state.wrapping_add(0x9E37_79B9);
        let a = self.mask_state;
        let b = a.wrapping_mul(0x85EB_CA6B);
        let c = b ^ (b >> 13);
        let d = c.wrapping_mul(0xC2B2_AE35);
        d.to_le_bytes()
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mask = if self.masking {
            Some(self.next_mask())
        } else {
            None
        };
        self.write_buf.clear();
        frame.write_to(&mut self.write_buf, mask);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn random_mask_seed() -> u32 {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_ok() {
        u32::from_le_bytes(buf)
    } else {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(0x1234_5678)
    }
}

/// The driver task state.
pub(crate) struct Driver {
    pub(crate) config: Config,
    pub(crate) events: EventDispatcher,
    pub(crate) state: StateHandle,
    pub(crate) reconnects: Arc<AtomicU64>,
    pub(crate) alive: Arc<AtomicBool>,
    pub(crate) cmd_rx: mpsc::UnboundedReceiver<Command>,
    pub(crate) url: Url,
    pub(crate) protocol: Option<String>,
    pub(crate) origin: Option<String>,
}

impl Driver {
    /// Run the connection lifecycle until it settles in `Closed` with
    /// reconnection disabled or exhausted.
    pub(crate) async fn run(mut self) {
        loop {
            self.state.set(ConnectionState::Connecting);

            match self.connect_phase().await {
                ConnectOutcome::Established(session) => {
                    let mut session = *session;
                    self.state.set(ConnectionState::Open);
                    info!(url = %self.url, "websocket open");
                    self.events.emit_open();

                    let end = self.session_loop(&mut session).await;

                    self.state.set(ConnectionState::Closed);
                    info!(code = end.code, reason = %end.reason, "websocket closed");
                    self.events.emit_close(end.code, &end.reason);
                    drop(session);

                    if !end.reconnect || !self.backoff_then_reconnect().await {
                        return;
                    }
                }
                ConnectOutcome::Failed(error) => {
                    self.state.set(ConnectionState::Closed);
                    self.events.emit_error(&error);

                    let retry = match error {
                        // A spoken HTTP answer frees the connection unless
                        // immediate retry was asked for.
                        Error::UnexpectedResponse { .. } => {
                            if self.config.reconnect_on_http_error {
                                self.reconnects.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            false
                        }
                        // Handshake verification failures are not transient.
                        Error::InvalidServerKey
                        | Error::InvalidHandshake(_)
                        | Error::InvalidUrl(_) => false,
                        // Transport-level failures follow the reconnect
                        // schedule.
                        _ => self.backoff_then_reconnect().await,
                    };
                    if !retry {
                        return;
                    }
                }
                ConnectOutcome::Aborted {
                    code,
                    reason,
                    resume,
                } => {
                    self.state.set(ConnectionState::Closed);
                    self.events.emit_close(code, &reason);
                    if !resume || !self.backoff_then_reconnect().await {
                        return;
                    }
                }
                ConnectOutcome::HandlesGone => {
                    self.state.set(ConnectionState::Closed);
                    return;
                }
            }
        }
    }

    /// Connect and handshake, watching for user aborts.
    async fn connect_phase(&mut self) -> ConnectOutcome {
        let establish = establish(
            &self.config,
            &self.url,
            self.protocol.as_deref(),
            self.origin.as_deref(),
        );
        tokio::pin!(establish);

        loop {
            tokio::select! {
                result = &mut establish => {
                    return match result {
                        Ok(session) => ConnectOutcome::Established(Box::new(session)),
                        Err(error) => ConnectOutcome::Failed(error),
                    };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Close { code, reason, resume }) => {
                        return ConnectOutcome::Aborted { code, reason, resume };
                    }
                    // Sends and pings race a connection that is not open yet;
                    // they are dropped, matching their not-open contract.
                    Some(_) => continue,
                    None => return ConnectOutcome::HandlesGone,
                },
            }
        }
    }

    /// Wait out the reconnect delay. Returns whether reconnection should
    /// proceed; a final close during the backoff cancels it.
    async fn backoff_then_reconnect(&mut self) -> bool {
        let delay = self.config.reconnect;
        if delay.is_zero() {
            return false;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(attempt = self.reconnects.load(Ordering::Relaxed), "reconnecting");
                    return true;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Close { resume: false, .. }) | None => return false,
                    Some(_) => continue,
                },
            }
        }
    }

    /// The read/command multiplex loop for one open connection.
    async fn session_loop(&mut self, session: &mut Session) -> SessionEnd {
        let mut read_buf = vec![0u8; 8 * 1024];
        // Set once a local close frame has been written; carries the resume
        // flag until the peer acknowledges or the socket drops.
        let mut local_close: Option<bool> = None;

        loop {
            tokio::select! {
                result = session.stream.read(&mut read_buf) => match result {
                    Ok(0) => {
                        return SessionEnd {
                            code: 1006,
                            reason: String::new(),
                            reconnect: local_close.map_or(true, |resume| resume),
                        };
                    }
                    Ok(n) => {
                        session.parser.feed(&read_buf[..n]);
                        match self.process_frames(session, &mut local_close).await {
                            Ok(Some(end)) => return end,
                            Ok(None) => {}
                            Err(error) => return self.fail_session(session, error, &local_close).await,
                        }
                    }
                    Err(e) => {
                        let error = Error::from(e);
                        self.events.emit_error(&error);
                        return SessionEnd {
                            code: 1006,
                            reason: String::new(),
                            reconnect: local_close.map_or(true, |resume| resume),
                        };
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send { payload, raw }) => {
                        if let Err(error) = self.write_message(session, payload, raw).await {
                            match error {
                                // Compression failures surface without
                                // tearing the connection down.
                                Error::Compression(_) | Error::Cipher(_) => {
                                    self.events.emit_error(&error);
                                }
                                _ => {
                                    self.events.emit_error(&error);
                                    return SessionEnd {
                                        code: 1006,
                                        reason: String::new(),
                                        reconnect: true,
                                    };
                                }
                            }
                        }
                    }
                    Some(Command::Ping) => {
                        self.alive.store(false, Ordering::Release);
                        if let Err(error) = session.write_frame(&Frame::ping(PING_PAYLOAD.to_vec())).await {
                            self.events.emit_error(&error);
                            return SessionEnd { code: 1006, reason: String::new(), reconnect: true };
                        }
                    }
                    Some(Command::Close { code, reason, resume }) => {
                        let _ = session
                            .write_frame(&Frame::close(Some(code), &reason))
                            .await;
                        // Half-close: nothing further goes out; the peer's
                        // acknowledgement (or TCP teardown) ends the session.
                        let _ = session.stream.shutdown().await;
                        self.state.set(ConnectionState::Closing);
                        local_close = Some(resume);
                    }
                    None => {
                        // Every handle is gone; nothing can observe events
                        // anymore. Destroy the socket.
                        let _ = session.write_frame(&Frame::close(Some(1000), "")).await;
                        return SessionEnd {
                            code: 1000,
                            reason: String::new(),
                            reconnect: false,
                        };
                    }
                },
            }
        }
    }

    /// Close the session after a parser or protocol failure.
    async fn fail_session(
        &mut self,
        session: &mut Session,
        error: Error,
        local_close: &Option<bool>,
    ) -> SessionEnd {
        let (code, reason) = match error {
            Error::FrameTooLarge { .. } => (1009, "Frame is too large".to_string()),
            ref e => {
                self.events.emit_error(e);
                (1002, "Protocol error".to_string())
            }
        };
        let _ = session.write_frame(&Frame::close(Some(code), &reason)).await;
        SessionEnd {
            code,
            reason,
            reconnect: local_close.map_or(true, |resume| resume),
        }
    }

    /// Drain the parser and dispatch every complete frame.
    async fn process_frames(
        &mut self,
        session: &mut Session,
        local_close: &mut Option<bool>,
    ) -> Result<Option<SessionEnd>> {
        while let Some(frame) = session.parser.next_frame()? {
            frame.validate()?;

            match frame.opcode {
                OpCode::Ping => {
                    debug!(len = frame.payload.len(), "ping received");
                    self.alive.store(true, Ordering::Release);
                    session.write_frame(&Frame::pong(PONG_PAYLOAD.to_vec())).await?;
                }
                OpCode::Pong => {
                    self.alive.store(true, Ordering::Release);
                }
                OpCode::Close => {
                    let (code, reason) = self.parse_close(&frame);
                    if self.state.get() == ConnectionState::Open {
                        self.state.set(ConnectionState::Closing);
                        let _ = session
                            .write_frame(&Frame::close(Some(code), ""))
                            .await;
                    }
                    return Ok(Some(SessionEnd {
                        code,
                        reason,
                        reconnect: local_close.map_or(true, |resume| resume),
                    }));
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    match self.handle_data_frame(session, frame) {
                        Ok(()) => {}
                        Err(error @ (Error::Compression(_) | Error::Cipher(_))) => {
                            // Known-weak area: the pipeline error reaches the
                            // error sink but the connection stays up.
                            self.events.emit_error(&error);
                            session.assembler.reset();
                            session.msg_compressed = false;
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Route a data frame through inflate (when the message head carried
    /// RSV1) and the assembler, delivering any completed message.
    fn handle_data_frame(&mut self, session: &mut Session, frame: Frame) -> Result<()> {
        if !session.assembler.is_assembling() {
            session.msg_compressed = frame.rsv1 && session.deflate.is_some();
        }

        if session.msg_compressed {
            let outputs = match session.deflate.as_mut() {
                Some(engine) => engine.inflate(frame.opcode, frame.fin, frame.payload)?,
                None => {
                    return Err(Error::ProtocolViolation(
                        "RSV1 set without negotiated extension".into(),
                    ));
                }
            };
            for output in outputs {
                if output.fin {
                    session.msg_compressed = false;
                }
                let inflated = Frame::new(output.fin, output.opcode, output.data);
                if let Some(message) = session.assembler.push(inflated)? {
                    self.deliver(message)?;
                }
            }
        } else if frame.rsv1 {
            return Err(Error::ProtocolViolation(
                "RSV1 set without negotiated extension".into(),
            ));
        } else if let Some(message) = session.assembler.push(frame)? {
            self.deliver(message)?;
        }

        Ok(())
    }

    /// Decode a complete message body and emit it. Undecodable bodies are
    /// dropped silently by contract.
    fn deliver(&self, message: crate::protocol::AssembledMessage) -> Result<()> {
        let codec = PayloadCodec::new(
            self.config.kind,
            self.config.encode_decode,
            self.config.cipher.clone(),
        );
        match codec.decode(message.payload)? {
            Some(payload) => self.events.emit_message(&payload),
            None => debug!("message body dropped by payload codec"),
        }
        Ok(())
    }

    /// Encode, optionally compress, frame, and write one outbound message.
    async fn write_message(
        &mut self,
        session: &mut Session,
        payload: Payload,
        raw: bool,
    ) -> Result<()> {
        let codec = PayloadCodec::new(
            self.config.kind,
            self.config.encode_decode,
            self.config.cipher.clone(),
        );
        let (opcode, bytes) = codec.encode(payload, raw)?;

        let frames: Vec<Frame> = match session
            .deflate
            .as_mut()
            .filter(|engine| engine.compresses_outbound())
        {
            Some(engine) => engine
                .deflate(opcode, bytes)?
                .into_iter()
                .map(|output| {
                    let mut frame = Frame::new(true, output.opcode, output.data);
                    frame.rsv1 = true;
                    frame
                })
                .collect(),
            None => vec![Frame::new(true, opcode, bytes)],
        };

        for frame in &frames {
            session.write_frame(frame).await?;
        }
        Ok(())
    }

    /// Extract status code and reason from a close frame payload.
    fn parse_close(&self, frame: &Frame) -> (u16, String) {
        let payload = &frame.payload;
        if payload.is_empty() {
            return (1000, String::new());
        }
        if payload.len() < 2 {
            return (1002, String::new());
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let mut reason = match std::str::from_utf8(&payload[2..]) {
            Ok(reason) => reason.to_string(),
            Err(_) => String::new(),
        };
        if self.config.encode_decode {
            let decoded = match percent_encoding::percent_decode_str(&reason).decode_utf8() {
                Ok(cow) => Some(cow.into_owned()),
                Err(_) => None,
            };
            if let Some(decoded) = decoded {
                reason = decoded;
            }
        }
        (code, reason)
    }
}

/// Open the socket, perform the Upgrade, and verify the switch.
async fn establish(
    config: &Config,
    url: &Url,
    protocol: Option<&str>,
    origin: Option<&str>,
) -> Result<Session> {
    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        other => {
            return Err(Error::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )));
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidUrl(format!("missing host: {url}")))?
        .to_string();
    let port = url.port().unwrap_or(if secure { 443 } else { 80 });

    let mut stream = open_stream(config, &host, port, secure).await?;

    let mut request = HandshakeRequest::new(url)?;
    request.protocol = protocol.map(str::to_string);
    request.origin = origin.map(str::to_string);
    request.compress = config.compress;
    request.headers = config.headers.clone();
    request.cookies = config.cookies.clone();

    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;

    // Read the response head; anything after the blank line is frame data.
    let mut buf = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(Error::InvalidHandshake("response head too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::InvalidHandshake(
                "connection closed during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let response = HandshakeResponse::parse(&buf[..header_end])?;
    response.verify(&request.key)?;

    if let Some(ref selected) = response.protocol {
        if request.protocol.as_deref() != Some(selected.as_str()) {
            return Err(Error::InvalidHandshake(format!(
                "server selected unrequested subprotocol: {selected}"
            )));
        }
    }

    let deflate = if config.compress {
        DeflateParams::from_tokens(&response.extensions)?
            .map(|params| DeflateEngine::new(params, config.max_frame_len))
    } else {
        None
    };
    debug!(compressed = deflate.is_some(), "handshake verified");

    let mut parser = FrameParser::new(config.max_frame_len);
    parser.feed(&buf[header_end..]);

    Ok(Session {
        stream,
        parser,
        assembler: MessageAssembler::new(),
        deflate,
        msg_compressed: false,
        write_buf: BytesMut::with_capacity(8 * 1024),
        mask_state: random_mask_seed(),
        masking: config.masking,
    })
}

async fn open_stream(
    config: &Config,
    host: &str,
    port: u16,
    secure: bool,
) -> Result<MaybeTlsStream> {
    #[cfg(unix)]
    if let Some(ref path) = config.unix_socket {
        if secure {
            return Err(Error::InvalidUrl(
                "wss over a UNIX socket is not supported".into(),
            ));
        }
        let stream = tokio::net::UnixStream::connect(path).await?;
        return Ok(MaybeTlsStream::Unix(stream));
    }

    let tcp = TcpStream::connect((host, port)).await?;
    // Long-lived interactive connection: no Nagle batching, no idle timeout.
    tcp.set_nodelay(true)?;

    if secure {
        let tls_config = crate::tls::client_config(&config.tls)?;
        let connector = tokio_rustls::TlsConnector::from(tls_config);
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| Error::Tls(format!("invalid DNS name: {host}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(MaybeTlsStream::Tls(Box::new(tls)))
    } else {
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_seed_varies() {
        let seeds: std::collections::HashSet<u32> =
            (0..8).map(|_| random_mask_seed()).collect();
        assert!(seeds.len() >= 2, "mask seeds should vary across calls");
    }

    #[test]
    fn test_next_mask_sequence_differs() {
        let mut session_masks = Vec::new();
        let mut state = random_mask_seed();
        for _ in 0..4 {
            state = state.wrapping_add(0x9E37_79B9);
            session_masks.push(state);
        }
        let unique: std::collections::HashSet<_> = session_masks.iter().collect();
        assert_eq!(unique.len(), session_masks.len());
    }
}
