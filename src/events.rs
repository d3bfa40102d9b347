//! Out-of-band event notifications.
//!
//! The cache engine publishes [`Event`]s through an [`EventPublisher`]; a
//! background task routes each one to the connections subscribed to its
//! [`EventKind`] via the [`SubscriptionTable`], where it waits in the
//! connection's [`EventQueue`] until a batch is flushed as one `EVENTS`
//! response at low send priority.
//!
//! `EVENTS` data layout:
//!
//! ```text
//! [count:10] { [eventSize:10] [kind] [' ' argument]? }*
//! ```

use crate::protocol::header::put_length;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

/// Notification category clients subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CacheCleared,
    ItemAdded,
    ItemUpdated,
    ItemRemoved,
    NodeJoined,
    NodeLeft,
    Custom,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::CacheCleared,
        EventKind::ItemAdded,
        EventKind::ItemUpdated,
        EventKind::ItemRemoved,
        EventKind::NodeJoined,
        EventKind::NodeLeft,
        EventKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CacheCleared => "cache_cleared",
            EventKind::ItemAdded => "item_added",
            EventKind::ItemUpdated => "item_updated",
            EventKind::ItemRemoved => "item_removed",
            EventKind::NodeJoined => "node_joined",
            EventKind::NodeLeft => "node_left",
            EventKind::Custom => "custom",
        }
    }

    /// Parse a comma-separated kind list such as `item_added,custom`.
    pub fn parse_list(raw: &str) -> Result<Vec<EventKind>, String> {
        raw.split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification pushed to clients outside the request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CacheCleared,
    ItemAdded { key: String },
    ItemUpdated { key: String },
    ItemRemoved { key: String },
    NodeJoined { address: String },
    NodeLeft { address: String },
    Custom { payload: Bytes },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::CacheCleared => EventKind::CacheCleared,
            Event::ItemAdded { .. } => EventKind::ItemAdded,
            Event::ItemUpdated { .. } => EventKind::ItemUpdated,
            Event::ItemRemoved { .. } => EventKind::ItemRemoved,
            Event::NodeJoined { .. } => EventKind::NodeJoined,
            Event::NodeLeft { .. } => EventKind::NodeLeft,
            Event::Custom { .. } => EventKind::Custom,
        }
    }

    fn argument(&self) -> Option<&[u8]> {
        match self {
            Event::CacheCleared => None,
            Event::ItemAdded { key } | Event::ItemUpdated { key } | Event::ItemRemoved { key } => {
                Some(key.as_bytes())
            }
            Event::NodeJoined { address } | Event::NodeLeft { address } => Some(address.as_bytes()),
            Event::Custom { payload } => Some(&payload[..]),
        }
    }
}

/// Encode a batch of events as `EVENTS` response data.
pub fn encode_events(events: &[Event]) -> Bytes {
    let mut buf = BytesMut::new();
    put_length(&mut buf, events.len());
    for event in events {
        let kind = event.kind().as_str();
        let arg = event.argument();
        put_length(&mut buf, kind.len() + arg.map_or(0, |a| a.len() + 1));
        buf.put_slice(kind.as_bytes());
        if let Some(arg) = arg {
            buf.put_u8(b' ');
            buf.put_slice(arg);
        }
    }
    buf.freeze()
}

/// Sending half handed to event sources.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventPublisher {
    /// Publish an event. Dropped silently once the server stopped routing.
    pub fn publish(&self, event: Event) {
        trace!(kind = %event.kind(), "Publishing event");
        let _ = self.tx.send(event);
    }
}

/// Create the publisher and the receiver drained by the routing task.
pub fn event_channel() -> (EventPublisher, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventPublisher { tx }, rx)
}

/// Subscribed connection tokens per event kind.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    by_kind: RwLock<HashMap<EventKind, HashSet<usize>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, token: usize, kinds: &[EventKind]) {
        let mut table = self.by_kind.write();
        for kind in kinds {
            table.entry(*kind).or_default().insert(token);
        }
    }

    pub fn unsubscribe(&self, token: usize, kinds: &[EventKind]) {
        let mut table = self.by_kind.write();
        for kind in kinds {
            if let Some(tokens) = table.get_mut(kind) {
                tokens.remove(&token);
            }
        }
    }

    /// Drop every subscription held by a connection.
    pub fn remove_connection(&self, token: usize) {
        for tokens in self.by_kind.write().values_mut() {
            tokens.remove(&token);
        }
    }

    pub fn subscribers(&self, kind: EventKind) -> Vec<usize> {
        self.by_kind
            .read()
            .get(&kind)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, token: usize, kind: EventKind) -> bool {
        self.by_kind
            .read()
            .get(&kind)
            .is_some_and(|tokens| tokens.contains(&token))
    }
}

/// Per-connection queue of events awaiting bulk delivery.
#[derive(Debug)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    last_flush: Mutex<Instant>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            last_flush: Mutex::new(Instant::now()),
        }
    }
}

impl EventQueue {
    /// Queue `event`, dropping the oldest events beyond `max`. Returns how
    /// many were dropped.
    pub fn push(&self, event: Event, max: usize) -> usize {
        let mut events = self.events.lock();
        events.push_back(event);
        let overflow = events.len().saturating_sub(max.max(1));
        events.drain(..overflow);
        overflow
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Whether a batch should go out now: the queue reached `bulk_count`,
    /// or it holds anything and `interval` passed since the last batch.
    pub fn is_due(&self, bulk_count: usize, interval: Duration, now: Instant) -> bool {
        let len = self.len();
        len >= bulk_count
            || (len > 0 && now.saturating_duration_since(*self.last_flush.lock()) >= interval)
    }

    /// Take up to `max` events in arrival order and restart the interval.
    pub fn take_batch(&self, max: usize) -> Vec<Event> {
        let mut events = self.events.lock();
        let n = events.len().min(max);
        *self.last_flush.lock() = Instant::now();
        events.drain(..n).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
