//! Cache engine seam.
//!
//! The connection layer treats the cache as an opaque [`CacheEngine`]: it
//! hands over decoded [`Operation`]s and turns the [`Reply`] into a response.
//! [`LocalCache`] is the bundled in-process engine over [`Storage`].

use crate::error::HandlerError;
use crate::events::{Event, EventPublisher};
use crate::protocol::header::put_length;
use crate::protocol::{token, Response};
use crate::storage::{Storage, StorageResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One item of a bulk store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub key: String,
    pub value: Bytes,
    pub flags: u32,
    pub ttl: u64,
}

/// A cache operation decoded from a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Add(BulkItem),
    AddBulk(Vec<BulkItem>),
    Insert(BulkItem),
    InsertBulk(Vec<BulkItem>),
    Get { key: String },
    GetBulk { keys: Vec<String> },
    Remove { key: String },
    RemoveBulk { keys: Vec<String> },
    Delete { key: String },
    DeleteBulk { keys: Vec<String> },
    Contains { key: String },
    ContainsBulk { keys: Vec<String> },
    Count,
    Clear,
    RaiseCustomEvent { payload: Bytes },
}

/// Result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Value { flags: u32, data: Bytes },
    NotFound,
    Deleted,
    Ok,
    /// Boolean answer such as `CONTAINS`.
    Flag(bool),
    Count(u64),
    /// Per-key results of a bulk operation.
    Entries(Vec<(String, Bytes)>),
}

impl Reply {
    pub fn into_response(self) -> Response {
        match self {
            Reply::Stored => Response::status(token::STORED),
            Reply::NotStored => Response::status(token::NOT_STORED),
            Reply::Value { flags, data } => {
                let mut buf = BytesMut::with_capacity(11 + data.len());
                buf.put_slice(flags.to_string().as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(&data);
                Response::new(token::VALUE, buf.freeze())
            }
            Reply::NotFound => Response::status(token::NOT_FOUND),
            Reply::Deleted => Response::status(token::DELETED),
            Reply::Ok => Response::status(token::OK),
            Reply::Flag(flag) => Response::new(token::OK, if flag { "1" } else { "0" }),
            Reply::Count(n) => Response::new(token::VALUE, n.to_string()),
            Reply::Entries(entries) => Response::new(token::OK, encode_entries(&entries)),
        }
    }
}

/// `[count:10] { [entrySize:10] [key] [' ' value]? }*`
fn encode_entries(entries: &[(String, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    put_length(&mut buf, entries.len());
    for (key, value) in entries {
        if value.is_empty() {
            put_length(&mut buf, key.len());
            buf.put_slice(key.as_bytes());
        } else {
            put_length(&mut buf, key.len() + 1 + value.len());
            buf.put_slice(key.as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(value);
        }
    }
    buf.freeze()
}

/// The cache behind the connection layer.
pub trait CacheEngine: Send + Sync {
    /// Execute one operation on behalf of `client_id`.
    fn execute(&self, client_id: &str, op: Operation) -> Result<Reply, HandlerError>;

    /// A client completed the handshake.
    fn on_client_connected(&self, _client_id: &str) {}

    /// A client's connection was disposed.
    fn on_client_disconnected(&self, _client_id: &str) {}

    /// A client was dropped by the bad-client monitor.
    fn on_client_forcefully_disconnected(&self, _client_id: &str) {}

    fn product_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
}

/// In-process engine over [`Storage`] that publishes item events.
pub struct LocalCache {
    storage: Arc<Storage>,
    events: EventPublisher,
    disconnects: AtomicU64,
    forced_disconnects: AtomicU64,
}

impl LocalCache {
    pub fn new(storage: Arc<Storage>, events: EventPublisher) -> Self {
        Self {
            storage,
            events,
            disconnects: AtomicU64::new(0),
            forced_disconnects: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Client departures reported so far.
    pub fn disconnects(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Clients dropped by the bad-client monitor so far.
    pub fn forced_disconnects(&self) -> u64 {
        self.forced_disconnects.load(Ordering::Relaxed)
    }

    fn store(&self, item: BulkItem, only_if_absent: bool) -> StorageResult {
        let BulkItem {
            key,
            value,
            flags,
            ttl,
        } = item;
        let result = if only_if_absent {
            self.storage.add(&key, value, flags, ttl)
        } else {
            self.storage.insert(&key, value, flags, ttl)
        };
        match result {
            StorageResult::Stored => self.events.publish(Event::ItemAdded { key }),
            StorageResult::Updated => self.events.publish(Event::ItemUpdated { key }),
            _ => {}
        }
        result
    }

    fn store_bulk(&self, items: Vec<BulkItem>, only_if_absent: bool) -> Reply {
        let failed: Vec<(String, Bytes)> = items
            .into_iter()
            .filter_map(|item| {
                let key = item.key.clone();
                match self.store(item, only_if_absent) {
                    StorageResult::Stored | StorageResult::Updated => None,
                    _ => Some((key, Bytes::from_static(token::NOT_STORED.as_bytes()))),
                }
            })
            .collect();
        if failed.is_empty() {
            Reply::Stored
        } else {
            Reply::Entries(failed)
        }
    }

    fn remove(&self, key: String) -> Option<Bytes> {
        let item = self.storage.remove(&key)?;
        self.events.publish(Event::ItemRemoved { key });
        Some(item.value)
    }
}

impl CacheEngine for LocalCache {
    fn execute(&self, client_id: &str, op: Operation) -> Result<Reply, HandlerError> {
        let reply = match op {
            Operation::Add(item) => match self.store(item, true) {
                StorageResult::Stored => Reply::Stored,
                _ => Reply::NotStored,
            },
            Operation::AddBulk(items) => self.store_bulk(items, true),
            Operation::Insert(item) => match self.store(item, false) {
                StorageResult::Stored | StorageResult::Updated => Reply::Stored,
                _ => Reply::NotStored,
            },
            Operation::InsertBulk(items) => self.store_bulk(items, false),
            Operation::Get { key } => match self.storage.get(&key) {
                Some(item) => Reply::Value {
                    flags: item.flags,
                    data: item.value,
                },
                None => Reply::NotFound,
            },
            Operation::GetBulk { keys } => Reply::Entries(
                keys.into_iter()
                    .filter_map(|key| {
                        let item = self.storage.get(&key)?;
                        Some((key, item.value))
                    })
                    .collect(),
            ),
            Operation::Remove { key } => match self.remove(key) {
                Some(data) => Reply::Value { flags: 0, data },
                None => Reply::NotFound,
            },
            Operation::RemoveBulk { keys } => Reply::Entries(
                keys.into_iter()
                    .filter_map(|key| {
                        let data = self.remove(key.clone())?;
                        Some((key, data))
                    })
                    .collect(),
            ),
            Operation::Delete { key } => match self.remove(key) {
                Some(_) => Reply::Deleted,
                None => Reply::NotFound,
            },
            Operation::DeleteBulk { keys } => {
                let deleted = keys
                    .into_iter()
                    .filter(|key| self.remove(key.clone()).is_some())
                    .count();
                Reply::Count(deleted as u64)
            }
            Operation::Contains { key } => Reply::Flag(self.storage.contains(&key)),
            Operation::ContainsBulk { keys } => Reply::Entries(
                keys.into_iter()
                    .filter(|key| self.storage.contains(key))
                    .map(|key| (key, Bytes::new()))
                    .collect(),
            ),
            Operation::Count => Reply::Count(self.storage.count() as u64),
            Operation::Clear => {
                self.storage.flush_all();
                self.events.publish(Event::CacheCleared);
                Reply::Ok
            }
            Operation::RaiseCustomEvent { payload } => {
                debug!(client_id, size = payload.len(), "Raising custom event");
                self.events.publish(Event::Custom { payload });
                Reply::Ok
            }
        };
        Ok(reply)
    }

    fn on_client_connected(&self, client_id: &str) {
        debug!(client_id, "Client connected to cache");
    }

    fn on_client_disconnected(&self, client_id: &str) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        debug!(client_id, "Client disconnected from cache");
    }

    fn on_client_forcefully_disconnected(&self, client_id: &str) {
        self.forced_disconnects.fetch_add(1, Ordering::Relaxed);
        warn!(client_id, "Client forcefully disconnected");
    }
}
