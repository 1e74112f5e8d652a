//! # tether - WebSocket client with reconnect, keepalive, and compression
//!
//! `tether` is an RFC 6455 WebSocket client for tokio with the
//! `permessage-deflate` extension (RFC 7692).
//!
//! ## Features
//!
//! - **Incremental frame parser** that consumes arbitrary TCP chunks and
//!   reassembles fragmented messages
//! - **Streaming permessage-deflate** with strictly serialized
//!   per-direction pipelines and shared-window context takeover
//! - **Automatic reconnection** with a monotonic attempt counter;
//!   subscribers survive reconnects
//! - **Three payload modes**: UTF-8 text, raw binary, and JSON
//! - **Typed events**: `open`, `message`, `error`, `close`, with
//!   multi-subscriber and fire-once registration
//! - **TLS** (`wss://`) via rustls, plus UNIX domain socket transport
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tether::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     let mut client = Client::new(Config::default());
//!     client.on_message(|payload| println!("received: {payload:?}"));
//!     client.connect("wss://echo.example.com/ws", None, None)?;
//!     client.send("hello");
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod deflate;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod tls;

pub use client::{Client, ConnectionState, Event, ListenerId, Sender};
pub use config::{Config, TlsOptions};
pub use deflate::{DeflateEngine, DeflateParams};
pub use error::{Error, Result};
pub use payload::{Payload, PayloadCipher, PayloadKind};
pub use protocol::{compute_accept_key, Frame, FrameParser, MessageAssembler, OpCode, WS_GUID};
