//! The WebSocket client: public operations and event registration.
//!
//! A [`Client`] is created detached. [`Client::connect`] spawns the driver
//! task that owns the socket; the client handle then issues commands to it
//! and observes its state. Subscribers registered on the client survive
//! reconnects; only per-socket state is rebuilt between generations.
//!
//! ```rust,no_run
//! use tether::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     let mut client = Client::new(Config::default());
//!     client.on_open(|| println!("connected"));
//!     client.on_message(|payload| println!("got: {payload:?}"));
//!     client.on_close(|code, reason| println!("closed: {code} {reason}"));
//!     client.connect("ws://127.0.0.1:9001/live", None, None)?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     client.close(None, "done");
//!     Ok(())
//! }
//! ```

mod driver;
mod events;
mod state;
mod stream;

pub use events::{Event, ListenerId};
pub use state::ConnectionState;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::payload::Payload;

use driver::{Command, Driver};
use events::EventDispatcher;
use state::StateHandle;

/// An auto-reconnecting WebSocket client.
///
/// Dropping the client aborts the driver task, which destroys the socket and
/// compression contexts unconditionally.
pub struct Client {
    config: Config,
    events: EventDispatcher,
    state: StateHandle,
    reconnects: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a detached client with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            events: EventDispatcher::new(),
            state: StateHandle::new(),
            reconnects: Arc::new(AtomicU64::new(0)),
            alive: Arc::new(AtomicBool::new(false)),
            cmd_tx: None,
            driver: None,
        }
    }

    /// Initiate a connection to `url` (`ws://` or `wss://`).
    ///
    /// Returns as soon as the driver task is spawned; progress is reported
    /// through the `open`, `error`, and `close` events. The URL, subprotocol,
    /// and origin are retained for reconnection.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyConnected` if the connection is not `Closed`
    /// - `Error::InvalidUrl` for unparsable URLs or unsupported schemes
    pub fn connect(
        &mut self,
        url: &str,
        protocol: Option<&str>,
        origin: Option<&str>,
    ) -> Result<()> {
        if self.state.get().is_active() {
            return Err(Error::AlreadyConnected);
        }
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }

        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::InvalidUrl(format!("unsupported scheme: {other}")));
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            config: self.config.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            reconnects: self.reconnects.clone(),
            alive: self.alive.clone(),
            cmd_rx,
            url,
            protocol: protocol.map(str::to_string),
            origin: origin.map(str::to_string),
        };

        self.state.set(ConnectionState::Connecting);
        self.cmd_tx = Some(cmd_tx);
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Enqueue a message. Returns `false` when the connection is not open.
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        self.dispatch_if_open(Command::Send {
            payload: payload.into(),
            raw: false,
        })
    }

    /// Enqueue text verbatim, bypassing JSON stringification in `json` mode.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.dispatch_if_open(Command::Send {
            payload: Payload::Text(text.into()),
            raw: true,
        })
    }

    /// Serialize any value and enqueue it as a JSON message.
    ///
    /// Returns `false` when the connection is not open or the value cannot
    /// be represented as JSON.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.dispatch_if_open(Command::Send {
                payload: Payload::Json(value),
                raw: false,
            }),
            Err(_) => false,
        }
    }

    /// Send a liveness probe and clear the liveness flag.
    ///
    /// A no-op unless the connection is open. The flag is set again by the
    /// peer's pong (or any incoming ping).
    pub fn ping(&self) {
        self.dispatch_if_open(Command::Ping);
    }

    /// Initiate a graceful close and disable reconnection.
    ///
    /// Writes a close frame with `code` (1000 when `None`) and `reason`,
    /// then waits for the peer to acknowledge. Also cancels an in-flight
    /// connect or a pending reconnect. Codes reserved by RFC 6455 (1004-1006,
    /// 1015) must not appear on the wire and are sent as 1000.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        self.dispatch(Command::Close {
            code: sanitize_close_code(code.unwrap_or(1000)),
            reason: reason.to_string(),
            resume: false,
        });
    }

    /// Initiate a graceful close but leave reconnection armed.
    ///
    /// The connection closes normally and, if a reconnect delay is
    /// configured, comes back up on schedule.
    pub fn disconnect(&self) {
        self.dispatch(Command::Close {
            code: 1000,
            reason: String::new(),
            resume: true,
        });
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Number of reconnection cycles performed over the life of this client.
    ///
    /// Increases monotonically; never reset by a successful reconnection.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Informational liveness flag: cleared when [`ping`](Self::ping) is
    /// sent, set when any ping or pong arrives.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Subscribe to the `open` event.
    pub fn on_open(&self, handler: impl FnMut() + Send + 'static) -> ListenerId {
        self.events.add_open(false, handler)
    }

    /// Subscribe to the `open` event for a single delivery.
    pub fn once_open(&self, handler: impl FnMut() + Send + 'static) -> ListenerId {
        self.events.add_open(true, handler)
    }

    /// Subscribe to the `message` event.
    pub fn on_message(&self, handler: impl FnMut(&Payload) + Send + 'static) -> ListenerId {
        self.events.add_message(false, handler)
    }

    /// Subscribe to the `message` event for a single delivery.
    pub fn once_message(&self, handler: impl FnMut(&Payload) + Send + 'static) -> ListenerId {
        self.events.add_message(true, handler)
    }

    /// Subscribe to the `error` event.
    pub fn on_error(&self, handler: impl FnMut(&Error) + Send + 'static) -> ListenerId {
        self.events.add_error(false, handler)
    }

    /// Subscribe to the `error` event for a single delivery.
    pub fn once_error(&self, handler: impl FnMut(&Error) + Send + 'static) -> ListenerId {
        self.events.add_error(true, handler)
    }

    /// Subscribe to the `close` event.
    pub fn on_close(&self, handler: impl FnMut(u16, &str) + Send + 'static) -> ListenerId {
        self.events.add_close(false, handler)
    }

    /// Subscribe to the `close` event for a single delivery.
    pub fn once_close(&self, handler: impl FnMut(u16, &str) + Send + 'static) -> ListenerId {
        self.events.add_close(true, handler)
    }

    /// Remove one listener. Returns whether it was registered.
    pub fn remove_listener(&self, event: Event, id: ListenerId) -> bool {
        self.events.remove(event, id)
    }

    /// Remove all listeners for `event`, or every listener when `None`.
    pub fn remove_all_listeners(&self, event: Option<Event>) {
        self.events.remove_all(event)
    }

    /// A cloneable sending handle, usable from event handlers and other tasks.
    ///
    /// `None` until [`connect`](Self::connect) has been called.
    #[must_use]
    pub fn sender(&self) -> Option<Sender> {
        self.cmd_tx.as_ref().map(|cmd_tx| Sender {
            state: self.state.clone(),
            cmd_tx: cmd_tx.clone(),
        })
    }

    fn dispatch_if_open(&self, cmd: Command) -> bool {
        if !self.state.get().can_send() {
            return false;
        }
        self.dispatch(cmd)
    }

    fn dispatch(&self, cmd: Command) -> bool {
        match self.cmd_tx {
            Some(ref cmd_tx) => cmd_tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

/// Cloneable sending handle tied to a client's connection.
///
/// Carries the same open-state gating as the client's own operations.
#[derive(Clone)]
pub struct Sender {
    state: StateHandle,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Sender {
    /// Enqueue a message. Returns `false` when the connection is not open.
    pub fn send(&self, payload: impl Into<Payload>) -> bool {
        if !self.state.get().can_send() {
            return false;
        }
        self.cmd_tx
            .send(Command::Send {
                payload: payload.into(),
                raw: false,
            })
            .is_ok()
    }

    /// Send a liveness probe.
    pub fn ping(&self) {
        if self.state.get().can_send() {
            let _ = self.cmd_tx.send(Command::Ping);
        }
    }

    /// Initiate a graceful close and disable reconnection.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self.cmd_tx.send(Command::Close {
            code: sanitize_close_code(code.unwrap_or(1000)),
            reason: reason.to_string(),
            resume: false,
        });
    }
}

/// Reserved close codes (RFC 6455 Section 7.4.1) fall back to normal closure.
fn sanitize_close_code(code: u16) -> u16 {
    match code {
        1004..=1006 | 1015 => 1000,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_close_codes_sanitized() {
        for reserved in [1004, 1005, 1006, 1015] {
            assert_eq!(sanitize_close_code(reserved), 1000);
        }
        assert_eq!(sanitize_close_code(1000), 1000);
        assert_eq!(sanitize_close_code(1001), 1001);
        assert_eq!(sanitize_close_code(4000), 4000);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_scheme() {
        let mut client = Client::new(Config::default());
        assert!(matches!(
            client.connect("http://example.com/", None, None),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            client.connect("not a url", None, None),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_detached_client_state() {
        let client = Client::new(Config::default());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.reconnect_count(), 0);
        assert!(!client.alive());
        assert!(client.sender().is_none());
        assert!(!client.send("nothing"));
    }
}
