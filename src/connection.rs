//! Per-client connection state and the serialized send path.
//!
//! Each connection tracks its negotiated capabilities, activity timestamps
//! and a two-class pending-send queue. At most one drain task writes to the
//! socket at a time; responses queued while it runs are picked up by the same
//! task, so bytes reach the peer in the order they were queued.

use crate::error::ConnectionError;
use crate::events::{Event, EventQueue};
use crate::protocol::Capabilities;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

/// Write half of a client socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Send priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Command responses.
    Normal,
    /// Background traffic such as event batches.
    Low,
}

/// Two FIFO queues with weighted dequeue.
///
/// Normal items win, except that after `ratio` consecutive normal dequeues
/// while low items wait, one low item is served.
#[derive(Debug)]
pub struct SendQueue {
    normal: VecDeque<Bytes>,
    low: VecDeque<Bytes>,
    ratio: usize,
    normal_streak: usize,
}

impl SendQueue {
    pub fn new(ratio: usize) -> Self {
        Self {
            normal: VecDeque::new(),
            low: VecDeque::new(),
            ratio: ratio.max(1),
            normal_streak: 0,
        }
    }

    pub fn push(&mut self, item: Bytes, priority: Priority) {
        match priority {
            Priority::Normal => self.normal.push_back(item),
            Priority::Low => self.low.push_back(item),
        }
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        if self.low.is_empty() {
            self.normal_streak = 0;
            return self.normal.pop_front();
        }
        if self.normal.is_empty() || self.normal_streak >= self.ratio {
            self.normal_streak = 0;
            return self.low.pop_front();
        }
        self.normal_streak += 1;
        self.normal.pop_front()
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.low.is_empty()
    }

    pub fn clear(&mut self) {
        self.normal.clear();
        self.low.clear();
        self.normal_streak = 0;
    }
}

#[derive(Debug)]
struct SendState {
    queue: SendQueue,
    /// A drain task owns the writer.
    sending: bool,
    /// Dispose once the queue drains.
    close_after_flush: bool,
}

/// Start times of operations the bad-client monitor watches.
#[derive(Debug)]
struct Activity {
    last_activity: Instant,
    send_started: Option<Instant>,
    command_started: Option<Instant>,
}

/// A single client connection.
pub struct Connection {
    token: usize,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    client_id: RwLock<Option<String>>,
    version: AtomicU32,
    capabilities: RwLock<Capabilities>,
    writer: AsyncMutex<BoxedWriter>,
    send_state: Mutex<SendState>,
    send_idle: Notify,
    events: EventQueue,
    activity: Mutex<Activity>,
    left_gracefully: AtomicBool,
    disposed: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Create a new connection for an accepted socket.
    pub fn new(token: usize, peer: SocketAddr, writer: BoxedWriter, priority_ratio: usize) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            token,
            peer,
            connected_at: Utc::now(),
            client_id: RwLock::new(None),
            version: AtomicU32::new(0),
            capabilities: RwLock::new(Capabilities::default()),
            writer: AsyncMutex::new(writer),
            send_state: Mutex::new(SendState {
                queue: SendQueue::new(priority_ratio),
                sending: false,
                close_after_flush: false,
            }),
            send_idle: Notify::new(),
            events: EventQueue::default(),
            activity: Mutex::new(Activity {
                last_activity: Instant::now(),
                send_started: None,
                command_started: None,
            }),
            left_gracefully: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            closed,
        })
    }

    /// Registry slot of this connection.
    pub fn token(&self) -> usize {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Client id bound by the handshake.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.client_id.read().is_some()
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.read()
    }

    /// Bind the handshake results. Capabilities are fixed from here on.
    pub fn complete_handshake(&self, client_id: String, version: u32, caps: Capabilities) {
        *self.capabilities.write() = caps;
        self.version.store(version, Ordering::Relaxed);
        *self.client_id.write() = Some(client_id);
    }

    /// Events waiting for bulk delivery.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Queue an event unless the connection is gone. The backlog holds at
    /// most `max_queued` events.
    pub fn enqueue_event(&self, event: Event, max_queued: usize) -> bool {
        if self.is_disposed() {
            return false;
        }
        let dropped = self.events.push(event, max_queued);
        if dropped > 0 {
            warn!(
                conn_id = self.token,
                client_id = ?self.client_id(),
                dropped,
                max_queued,
                "Event backlog full, dropping oldest events"
            );
        }
        true
    }

    /// Queue `bytes` for sending.
    ///
    /// Starts a drain task when no send is in flight; otherwise the running
    /// drain task picks the item up.
    pub fn send(self: &Arc<Self>, bytes: Bytes, priority: Priority) -> Result<(), ConnectionError> {
        self.send_all(std::iter::once(bytes), priority)
    }

    /// Queue several frames under one lock, keeping them adjacent within
    /// their priority class.
    pub fn send_all(
        self: &Arc<Self>,
        frames: impl IntoIterator<Item = Bytes>,
        priority: Priority,
    ) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed);
        }
        let start_drain = {
            let mut state = self.send_state.lock();
            for frame in frames {
                state.queue.push(frame, priority);
            }
            !std::mem::replace(&mut state.sending, true)
        };
        if start_drain {
            tokio::spawn(Arc::clone(self).drain());
        }
        Ok(())
    }

    async fn drain(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();

        loop {
            let next = {
                let mut state = self.send_state.lock();
                match state.queue.pop() {
                    Some(bytes) => bytes,
                    None => {
                        state.sending = false;
                        let close = state.close_after_flush;
                        drop(state);
                        if close {
                            self.dispose();
                        }
                        self.send_idle.notify_waiters();
                        return;
                    }
                }
            };

            self.activity.lock().send_started = Some(Instant::now());
            let result = {
                let mut writer = self.writer.lock().await;
                tokio::select! {
                    result = write_frame(&mut writer, &next) => result.map_err(ConnectionError::from),
                    _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::Disposed),
                }
            };
            self.activity.lock().send_started = None;

            if let Err(e) = result {
                debug!(conn_id = self.token, peer = %self.peer, error = %e, "Send failed");
                self.dispose();
                self.send_state.lock().sending = false;
                self.send_idle.notify_waiters();
                return;
            }
        }
    }

    /// Wait until no send is in flight and nothing is queued.
    pub async fn flushed(&self) {
        loop {
            let notified = self.send_idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.send_state.lock();
                if !state.sending && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Number of frames waiting behind the in-flight send.
    pub fn pending_sends(&self) -> usize {
        self.send_state.lock().queue.len()
    }

    /// Dispose after every queued response has been written.
    pub fn close_after_flush(&self) {
        let idle = {
            let mut state = self.send_state.lock();
            state.close_after_flush = true;
            !state.sending
        };
        if idle {
            self.dispose();
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        self.activity.lock().last_activity = Instant::now();
    }

    pub fn begin_command(&self) {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        activity.command_started = Some(now);
        activity.last_activity = now;
    }

    pub fn end_command(&self) {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        activity.command_started = None;
        activity.last_activity = now;
    }

    /// How long the oldest operation in progress (send or command) has run.
    pub fn operation_elapsed(&self, now: Instant) -> Option<Duration> {
        let activity = self.activity.lock();
        [activity.send_started, activity.command_started]
            .into_iter()
            .flatten()
            .min()
            .map(|started| now.saturating_duration_since(started))
    }

    /// Time since the last activity, `None` while an operation is running.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let activity = self.activity.lock();
        if activity.send_started.is_some() || activity.command_started.is_some() {
            return None;
        }
        Some(now.saturating_duration_since(activity.last_activity))
    }

    pub fn mark_left_gracefully(&self) {
        self.left_gracefully.store(true, Ordering::Relaxed);
    }

    pub fn left_gracefully(&self) -> bool {
        self.left_gracefully.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Receiver that flips to `true` when the connection is disposed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Mark the connection disposed, abort any in-flight send and drop
    /// everything queued. Returns `true` only for the call that disposed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.send_replace(true);
        self.send_state.lock().queue.clear();
        self.events.clear();
        debug!(
            conn_id = self.token,
            peer = %self.peer,
            client_id = ?self.client_id(),
            "Connection disposed"
        );
        true
    }

    /// Shut the write half down. Skipped when a send still holds it.
    pub async fn shutdown(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }
}

async fn write_frame(writer: &mut BoxedWriter, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
