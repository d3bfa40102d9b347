//! In-memory storage module with expiration and memory limits.
//!
//! Backs the bundled local engine with a thread-safe key-value map:
//! - Lazy and periodic expiration of items
//! - Memory usage tracking and capping
//! - LRU eviction when the memory limit is reached

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// A single cached item
#[derive(Debug, Clone)]
pub struct CacheItem {
    /// The stored value
    pub value: Bytes,
    /// Opaque client flags stored with the item
    pub flags: u32,
    /// Absolute expiration time (None = never expires)
    pub expires_at: Option<Instant>,
    /// Access sequence number for LRU eviction
    last_access: u64,
}

impl CacheItem {
    /// Calculate the approximate memory usage of this item
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.len()
    }

    /// Check if this item has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Result of a storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageResult {
    /// A new item was stored
    Stored,
    /// An existing item was overwritten
    Updated,
    /// Item was not stored (add on existing key, or larger than the cap)
    NotStored,
    /// Item not found
    NotFound,
    /// Successfully deleted
    Deleted,
}

struct Inner {
    items: HashMap<String, CacheItem>,
    memory_used: usize,
    access_counter: u64,
}

impl Inner {
    fn next_access(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    fn remove(&mut self, key: &str) -> Option<CacheItem> {
        let item = self.items.remove(key)?;
        self.memory_used = self
            .memory_used
            .saturating_sub(item.memory_size() + key.len());
        Some(item)
    }

    /// Live item for `key`, dropping it first if it expired.
    fn live(&mut self, key: &str) -> Option<&mut CacheItem> {
        if self.items.get(key).is_some_and(CacheItem::is_expired) {
            trace!(key, "Item expired on access");
            self.remove(key);
            return None;
        }
        self.items.get_mut(key)
    }

    /// Evict least recently used items until `needed` more bytes fit.
    fn make_room(&mut self, needed: usize, max_memory: usize) {
        while self.memory_used + needed > max_memory {
            let lru = self
                .items
                .iter()
                .min_by_key(|(_, item)| (!item.is_expired(), item.last_access))
                .map(|(key, _)| key.clone());
            let Some(key) = lru else { break };
            debug!(key = %key, "Evicting LRU item");
            self.remove(&key);
        }
    }
}

/// Thread-safe in-memory cache storage
pub struct Storage {
    inner: RwLock<Inner>,
    /// Maximum memory allowed
    max_memory: usize,
    /// Default TTL in seconds (0 = no expiration)
    default_ttl: u64,
}

impl Storage {
    /// Create a new storage instance
    pub fn new(max_memory: usize, default_ttl: u64) -> Arc<Self> {
        info!(
            max_memory_mb = max_memory / 1024 / 1024,
            default_ttl, "Initializing storage"
        );
        Arc::new(Self {
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                memory_used: 0,
                access_counter: 0,
            }),
            max_memory,
            default_ttl,
        })
    }

    /// Calculate expiration time from TTL
    fn calculate_expiry(&self, ttl: u64) -> Option<Instant> {
        let effective_ttl = if ttl == 0 { self.default_ttl } else { ttl };
        (effective_ttl > 0).then(|| Instant::now() + Duration::from_secs(effective_ttl))
    }

    /// Get an item from storage
    pub fn get(&self, key: &str) -> Option<CacheItem> {
        let mut inner = self.inner.write();
        let seq = inner.next_access();
        let item = inner.live(key)?;
        item.last_access = seq;
        Some(item.clone())
    }

    /// Check whether a live item exists without touching its LRU position
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .read()
            .items
            .get(key)
            .is_some_and(|item| !item.is_expired())
    }

    /// Store an item, overwriting any existing one
    pub fn insert(&self, key: &str, value: Bytes, flags: u32, ttl: u64) -> StorageResult {
        let mut inner = self.inner.write();
        self.store(&mut inner, key, value, flags, ttl)
    }

    /// Add an item only if it doesn't exist
    pub fn add(&self, key: &str, value: Bytes, flags: u32, ttl: u64) -> StorageResult {
        let mut inner = self.inner.write();
        if inner.live(key).is_some() {
            return StorageResult::NotStored;
        }
        self.store(&mut inner, key, value, flags, ttl)
    }

    fn store(
        &self,
        inner: &mut Inner,
        key: &str,
        value: Bytes,
        flags: u32,
        ttl: u64,
    ) -> StorageResult {
        let replaced = inner.remove(key).is_some_and(|old| !old.is_expired());
        let last_access = inner.next_access();
        let item = CacheItem {
            value,
            flags,
            expires_at: self.calculate_expiry(ttl),
            last_access,
        };

        let size = item.memory_size() + key.len();
        if size > self.max_memory {
            return StorageResult::NotStored;
        }
        inner.make_room(size, self.max_memory);
        inner.memory_used += size;
        inner.items.insert(key.to_string(), item);

        trace!(key, memory_used = inner.memory_used, "Item stored");
        if replaced {
            StorageResult::Updated
        } else {
            StorageResult::Stored
        }
    }

    /// Remove an item and hand it back
    pub fn remove(&self, key: &str) -> Option<CacheItem> {
        let mut inner = self.inner.write();
        let item = inner.remove(key)?;
        (!item.is_expired()).then_some(item)
    }

    /// Delete an item from storage
    pub fn delete(&self, key: &str) -> StorageResult {
        match self.remove(key) {
            Some(_) => {
                trace!(key, "Item deleted");
                StorageResult::Deleted
            }
            None => StorageResult::NotFound,
        }
    }

    /// Number of live items
    pub fn count(&self) -> usize {
        self.inner
            .read()
            .items
            .values()
            .filter(|item| !item.is_expired())
            .count()
    }

    /// Remove all expired items from storage.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .items
            .iter()
            .filter(|(_, item)| item.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Flush all items from storage
    pub fn flush_all(&self) {
        let mut inner = self.inner.write();
        inner.items.clear();
        inner.memory_used = 0;
        info!("Flushed all items");
    }

    /// Get statistics about the storage
    pub fn stats(&self) -> StorageStats {
        let inner = self.inner.read();
        StorageStats {
            item_count: inner.items.len(),
            memory_used: inner.memory_used,
            max_memory: self.max_memory,
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub item_count: usize,
    pub memory_used: usize,
    pub max_memory: usize,
}
