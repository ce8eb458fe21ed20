//! Notification subscriptions.
//!
//! Each event has at most one handler.  Streams from the board are opened
//! per root register and shared by every subscribed event downstream of
//! that root, so they are reference-counted here and the device only
//! talks to the transport on the 0 → 1 and 1 → 0 transitions.

use std::collections::HashMap;

use log::trace;

use crate::error::Error;
use crate::graph::EventId;
use crate::register::{RegisterAddr, Value};

/// Receives each firing of a subscribed event, or a transport error.
pub type NotificationHandler = Box<dyn FnMut(Result<Value, Error>)>;

struct Subscription {
    handler: NotificationHandler,
    root: RegisterAddr,
}

/// Per-root stream state.
#[derive(Default)]
struct Stream {
    subscribers: usize,
    /// Whether the board was asked to stream and has not refused.
    open: bool,
}

/// What the caller has to do on the transport after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChange {
    None,
    Open(RegisterAddr),
    Close(RegisterAddr),
}

#[derive(Default)]
pub struct Subscriptions {
    handlers: HashMap<EventId, Subscription>,
    streams: HashMap<RegisterAddr, Stream>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` as the sole handler of `event`, dropping any
    /// previous one.  Asks for the root's stream to be opened when it is
    /// not open yet, which includes a stream the transport refused.
    pub fn insert(
        &mut self,
        event: EventId,
        root: RegisterAddr,
        handler: NotificationHandler,
    ) -> StreamChange {
        match self.handlers.get_mut(&event) {
            Some(existing) => existing.handler = handler,
            None => {
                self.handlers.insert(event, Subscription { handler, root });
                self.streams.entry(root).or_default().subscribers += 1;
            }
        }
        let stream = self.streams.entry(root).or_default();
        if stream.open {
            return StreamChange::None;
        }
        stream.open = true;
        StreamChange::Open(root)
    }

    /// The transport refused to open `root`.  Handlers stay installed and
    /// the next [`insert`](Self::insert) on that root asks again.
    pub fn stream_failed(&mut self, root: RegisterAddr) {
        if let Some(stream) = self.streams.get_mut(&root) {
            stream.open = false;
        }
    }

    /// Drop the handler of `event`.  Unsubscribed events are a no-op.
    pub fn remove(&mut self, event: EventId) -> StreamChange {
        let Some(sub) = self.handlers.remove(&event) else {
            return StreamChange::None;
        };
        let Some(stream) = self.streams.get_mut(&sub.root) else {
            return StreamChange::None;
        };
        stream.subscribers = stream.subscribers.saturating_sub(1);
        if stream.subscribers > 0 {
            return StreamChange::None;
        }
        let was_open = stream.open;
        self.streams.remove(&sub.root);
        if was_open {
            StreamChange::Close(sub.root)
        } else {
            StreamChange::None
        }
    }

    pub fn is_subscribed(&self, event: EventId) -> bool {
        self.handlers.contains_key(&event)
    }

    pub fn subscribed(&self) -> impl Iterator<Item = EventId> + '_ {
        self.handlers.keys().copied()
    }

    /// Call the handler of `event` once.  Returns `false` when the event
    /// has no handler.
    pub fn deliver(&mut self, event: EventId, result: Result<Value, Error>) -> bool {
        match self.handlers.get_mut(&event) {
            Some(sub) => {
                trace!("notify: delivering to event {:?}", event);
                (sub.handler)(result);
                true
            }
            None => false,
        }
    }
}
