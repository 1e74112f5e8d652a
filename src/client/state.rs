//! Connection lifecycle state machine.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// WebSocket connection state.
///
/// A connection is created detached (`Closed`), moves to `Connecting` while
/// the Upgrade request is in flight, `Open` after a verified 101, `Closing`
/// once a local close frame has been written, and back to `Closed` when the
/// socket goes away. Reconnection cycles the same states again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
#[non_exhaustive]
pub enum ConnectionState {
    /// No socket; initial and final state.
    #[default]
    Closed = 0,
    /// Upgrade request in flight.
    Connecting = 1,
    /// Handshake verified; data may flow.
    Open = 2,
    /// Local close sent, awaiting peer acknowledgement.
    Closing = 3,
}

impl ConnectionState {
    /// Whether a socket exists in this state.
    #[must_use]
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }

    /// Whether sending data is allowed in this state.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Whether receiving data is allowed in this state.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
        }
    }
}

/// Shared view of the driver task's connection state.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Closed as u8)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_closed() {
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
        assert_eq!(StateHandle::new().get(), ConnectionState::Closed);
    }

    #[test]
    fn test_can_send_only_when_open() {
        assert!(!ConnectionState::Closed.can_send());
        assert!(!ConnectionState::Connecting.can_send());
        assert!(ConnectionState::Open.can_send());
        assert!(!ConnectionState::Closing.can_send());
    }

    #[test]
    fn test_can_receive_when_open_or_closing() {
        assert!(!ConnectionState::Closed.can_receive());
        assert!(!ConnectionState::Connecting.can_receive());
        assert!(ConnectionState::Open.can_receive());
        assert!(ConnectionState::Closing.can_receive());
    }

    #[test]
    fn test_is_active() {
        assert!(!ConnectionState::Closed.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Open.is_active());
        assert!(ConnectionState::Closing.is_active());
    }

    #[test]
    fn test_handle_roundtrip() {
        let handle = StateHandle::new();
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            handle.set(state);
            assert_eq!(handle.get(), state);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }
}
