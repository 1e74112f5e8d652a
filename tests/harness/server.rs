//! A minimal upgrade-capable server driven by per-test behaviors.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tether::protocol::{compute_accept_key, Frame, FrameParser, OpCode};
use tether::{DeflateEngine, DeflateParams};

/// What the server does with each accepted connection.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Complete the handshake, then echo data messages and pings.
    Echo,
    /// Negotiate permessage-deflate and echo through the compressor.
    EchoDeflate,
    /// Complete the handshake, then drop the TCP connection.
    CloseAfterHandshake,
    /// Answer the Upgrade with a plain HTTP status.
    RejectHttp(u16),
    /// Complete the handshake with a corrupted accept key.
    WrongAcceptKey,
    /// Complete the handshake, then write these raw chunks and hold the
    /// connection open.
    SendRaw(Vec<Vec<u8>>),
    /// Send a ping, wait for the client's pong, then echo the pong payload
    /// back inside a text frame.
    PingThenReportPong,
    /// Send a close frame with this code after the handshake.
    CloseWithCode(u16),
}

pub struct TestServer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(behavior: Behavior) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, behavior.clone()));
            }
        });
        TestServer { addr, handle }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&head).into_owned());
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&chunk[..n]);
    }
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (header, value) = line.split_once(':')?;
        if header.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

async fn handle_connection(mut stream: TcpStream, behavior: Behavior) {
    let Some(head) = read_request_head(&mut stream).await else {
        return;
    };

    if let Behavior::RejectHttp(status) = behavior {
        let response = format!("HTTP/1.1 {status} Nope\r\nContent-Length: 0\r\n\r\n");
        let _ = stream.write_all(response.as_bytes()).await;
        return;
    }

    let Some(key) = header_value(&head, "sec-websocket-key") else {
        return;
    };
    let accept = match behavior {
        Behavior::WrongAcceptKey => "bm90IHRoZSByaWdodCBrZXk=".to_string(),
        _ => compute_accept_key(key),
    };

    let deflate_offered = head.to_lowercase().contains("permessage-deflate");
    let mut engine = None;

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n"
    );
    if matches!(behavior, Behavior::EchoDeflate) && deflate_offered {
        response.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
        engine = Some(DeflateEngine::new(DeflateParams::default(), 0));
    }
    response.push_str("\r\n");
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    match behavior {
        Behavior::CloseAfterHandshake => {}
        Behavior::WrongAcceptKey => {
            // The client tears the connection down; just drain.
            let mut sink = [0u8; 1024];
            let _ = stream.read(&mut sink).await;
        }
        Behavior::SendRaw(chunks) => {
            for chunk in chunks {
                if stream.write_all(&chunk).await.is_err() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            // Hold the connection so the client keeps the session open.
            let mut sink = [0u8; 1024];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        }
        Behavior::CloseWithCode(code) => {
            let frame = Frame::close(Some(code), "").encode(None);
            let _ = stream.write_all(&frame).await;
            let mut sink = [0u8; 1024];
            let _ = stream.read(&mut sink).await;
        }
        Behavior::PingThenReportPong => {
            // Empty ping; the client answers with the literal PONG payload.
            let ping = Frame::ping(Vec::new()).encode(None);
            if stream.write_all(&ping).await.is_err() {
                return;
            }
            let mut parser = FrameParser::new(0);
            let mut chunk = [0u8; 4096];
            loop {
                let Ok(n) = stream.read(&mut chunk).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                parser.feed(&chunk[..n]);
                while let Ok(Some(frame)) = parser.next_frame() {
                    if frame.opcode == OpCode::Pong {
                        let report = Frame::text(frame.payload.clone()).encode(None);
                        let _ = stream.write_all(&report).await;
                        // Keep the session alive afterwards.
                    }
                }
            }
        }
        Behavior::Echo | Behavior::EchoDeflate => {
            echo_loop(&mut stream, &mut engine).await;
        }
        Behavior::RejectHttp(_) => unreachable!(),
    }
}

async fn echo_loop(stream: &mut TcpStream, engine: &mut Option<DeflateEngine>) {
    let mut parser = FrameParser::new(0);
    let mut chunk = [0u8; 8192];

    loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        parser.feed(&chunk[..n]);

        loop {
            let frame = match parser.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            match frame.opcode {
                OpCode::Text | OpCode::Binary => {
                    let body: Vec<u8> = if frame.rsv1 {
                        match engine.as_mut().map(|e| {
                            e.inflate(frame.opcode, frame.fin, frame.payload.clone())
                        }) {
                            Some(Ok(outputs)) => {
                                outputs.into_iter().flat_map(|o| o.data).collect()
                            }
                            _ => return,
                        }
                    } else {
                        frame.payload.clone()
                    };

                    let reply = match engine.as_mut() {
                        Some(e) => {
                            let Ok(mut outputs) = e.deflate(frame.opcode, body) else {
                                return;
                            };
                            let output = outputs.remove(0);
                            let mut reply = Frame::new(true, output.opcode, output.data);
                            reply.rsv1 = true;
                            reply
                        }
                        None => Frame::new(true, frame.opcode, body),
                    };
                    if stream.write_all(&reply.encode(None)).await.is_err() {
                        return;
                    }
                }
                OpCode::Ping => {
                    let pong = Frame::pong(frame.payload.clone()).encode(None);
                    if stream.write_all(&pong).await.is_err() {
                        return;
                    }
                }
                OpCode::Close => {
                    let _ = stream.write_all(&frame.encode(None)).await;
                    return;
                }
                _ => {}
            }
        }
    }
}
