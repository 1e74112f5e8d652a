//! Typed event subscription surface.
//!
//! Four events are delivered to subscribers: `open`, `message`, `error`, and
//! `close`. Each supports multiple subscribers, fire-once handlers, and
//! removal by the id returned at registration. The registry survives
//! reconnects; only per-socket state is reinitialized between generations.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Error;
use crate::payload::Payload;

/// The events a client emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Event {
    /// Connection established and verified.
    Open,
    /// A complete message was decoded.
    Message,
    /// A consumer-actionable error occurred.
    Error,
    /// The connection closed, with status code and reason.
    Close,
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type OpenHandler = Box<dyn FnMut() + Send>;
type MessageHandler = Box<dyn FnMut(&Payload) + Send>;
type ErrorHandler = Box<dyn FnMut(&Error) + Send>;
type CloseHandler = Box<dyn FnMut(u16, &str) + Send>;

/// A registered handler plus its fire-once flag.
struct Entry<H> {
    id: u64,
    once: bool,
    handler: H,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    open: Vec<Entry<OpenHandler>>,
    message: Vec<Entry<MessageHandler>>,
    error: Vec<Entry<ErrorHandler>>,
    close: Vec<Entry<CloseHandler>>,
}

impl Listeners {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared event registry and dispatcher.
///
/// Handlers run on the driver task. During dispatch the entries are taken out
/// of the registry, so a handler may register or remove listeners without
/// deadlocking; listeners added during dispatch fire from the next event on.
#[derive(Clone, Default)]
pub(crate) struct EventDispatcher {
    inner: Arc<Mutex<Listeners>>,
}

macro_rules! dispatch {
    ($self:expr, $field:ident, $invoke:expr) => {{
        let mut entries = std::mem::take(&mut $self.lock().$field);
        for entry in entries.iter_mut() {
            #[allow(clippy::redundant_closure_call)]
            ($invoke)(&mut entry.handler);
        }
        entries.retain(|entry| !entry.once);
        let mut guard = $self.lock();
        let added_during_dispatch = std::mem::replace(&mut guard.$field, entries);
        guard.$field.extend(added_during_dispatch);
    }};
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn add_open(
        &self,
        once: bool,
        handler: impl FnMut() + Send + 'static,
    ) -> ListenerId {
        let mut guard = self.lock();
        let id = guard.next_id();
        guard.open.push(Entry {
            id,
            once,
            handler: Box::new(handler),
        });
        ListenerId(id)
    }

    pub(crate) fn add_message(
        &self,
        once: bool,
        handler: impl FnMut(&Payload) + Send + 'static,
    ) -> ListenerId {
        let mut guard = self.lock();
        let id = guard.next_id();
        guard.message.push(Entry {
            id,
            once,
            handler: Box::new(handler),
        });
        ListenerId(id)
    }

    pub(crate) fn add_error(
        &self,
        once: bool,
        handler: impl FnMut(&Error) + Send + 'static,
    ) -> ListenerId {
        let mut guard = self.lock();
        let id = guard.next_id();
        guard.error.push(Entry {
            id,
            once,
            handler: Box::new(handler),
        });
        ListenerId(id)
    }

    pub(crate) fn add_close(
        &self,
        once: bool,
        handler: impl FnMut(u16, &str) + Send + 'static,
    ) -> ListenerId {
        let mut guard = self.lock();
        let id = guard.next_id();
        guard.close.push(Entry {
            id,
            once,
            handler: Box::new(handler),
        });
        ListenerId(id)
    }

    /// Remove one listener; returns whether it was found.
    pub(crate) fn remove(&self, event: Event, id: ListenerId) -> bool {
        let mut guard = self.lock();
        let removed = |len_before: usize, len_after: usize| len_before != len_after;
        match event {
            Event::Open => {
                let before = guard.open.len();
                guard.open.retain(|entry| entry.id != id.0);
                removed(before, guard.open.len())
            }
            Event::Message => {
                let before = guard.message.len();
                guard.message.retain(|entry| entry.id != id.0);
                removed(before, guard.message.len())
            }
            Event::Error => {
                let before = guard.error.len();
                guard.error.retain(|entry| entry.id != id.0);
                removed(before, guard.error.len())
            }
            Event::Close => {
                let before = guard.close.len();
                guard.close.retain(|entry| entry.id != id.0);
                removed(before, guard.close.len())
            }
        }
    }

    /// Remove all listeners for one event, or every listener when `None`.
    pub(crate) fn remove_all(&self, event: Option<Event>) {
        let mut guard = self.lock();
        match event {
            Some(Event::Open) => guard.open.clear(),
            Some(Event::Message) => guard.message.clear(),
            Some(Event::Error) => guard.error.clear(),
            Some(Event::Close) => guard.close.clear(),
            None => {
                guard.open.clear();
                guard.message.clear();
                guard.error.clear();
                guard.close.clear();
            }
        }
    }

    pub(crate) fn emit_open(&self) {
        dispatch!(self, open, |handler: &mut OpenHandler| handler());
    }

    pub(crate) fn emit_message(&self, payload: &Payload) {
        dispatch!(self, message, |handler: &mut MessageHandler| handler(payload));
    }

    pub(crate) fn emit_error(&self, error: &Error) {
        dispatch!(self, error, |handler: &mut ErrorHandler| handler(error));
    }

    pub(crate) fn emit_close(&self, code: u16, reason: &str) {
        dispatch!(self, close, |handler: &mut CloseHandler| handler(code, reason));
    }

    #[cfg(test)]
    fn count(&self, event: Event) -> usize {
        let guard = self.lock();
        match event {
            Event::Open => guard.open.len(),
            Event::Message => guard.message.len(),
            Event::Error => guard.error.len(),
            Event::Close => guard.close.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_multiple_subscribers_all_fire() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            dispatcher.add_open(false, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.emit_open();
        dispatcher.emit_open();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_once_fires_once() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            dispatcher.add_open(true, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.emit_open();
        dispatcher.emit_open();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.count(Event::Open), 0);
    }

    #[test]
    fn test_remove_listener() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = {
            let counter = counter.clone();
            dispatcher.add_message(false, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(dispatcher.remove(Event::Message, id));
        assert!(!dispatcher.remove(Event::Message, id));

        dispatcher.emit_message(&Payload::text("x"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_all_single_event() {
        let dispatcher = EventDispatcher::new();
        dispatcher.add_open(false, || {});
        dispatcher.add_close(false, |_, _| {});

        dispatcher.remove_all(Some(Event::Open));
        assert_eq!(dispatcher.count(Event::Open), 0);
        assert_eq!(dispatcher.count(Event::Close), 1);

        dispatcher.remove_all(None);
        assert_eq!(dispatcher.count(Event::Close), 0);
    }

    #[test]
    fn test_close_event_arguments() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            dispatcher.add_close(false, move |code, reason| {
                *seen.lock().unwrap() = Some((code, reason.to_string()));
            });
        }

        dispatcher.emit_close(1000, "done");
        assert_eq!(*seen.lock().unwrap(), Some((1000, "done".to_string())));
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let dispatcher_inner = dispatcher.clone();
            let counter = counter.clone();
            dispatcher.add_open(true, move || {
                let counter = counter.clone();
                dispatcher_inner.add_open(false, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        // First emit installs the new listener; it fires on the second.
        dispatcher.emit_open();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        dispatcher.emit_open();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
