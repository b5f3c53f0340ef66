//! Persistent byte store interface and an in-memory implementation.
//!
//! The persistent cache tiers only need a keyed byte store that enforces a
//! size budget with LRU eviction. Storage engines plug in behind
//! [`ByteStore`]; [`MemoryStore`] is the reference implementation and the
//! fallback when no cache directory is configured.

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Default store capacity: 256MB
pub const DEFAULT_STORE_CAPACITY: u64 = 256 * 1024 * 1024;

/// Keyed byte storage with a declared size budget.
///
/// Keys handed to a store are already sanitized (lowercase hex).
#[async_trait]
pub trait ByteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `data`, evicting least-recently-used entries while over budget.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Returns `true` if an entry was removed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// Evict least-recently-used entries until at most `max_size` bytes remain.
    async fn trim_to(&self, max_size: u64) -> Result<(), StoreError>;

    /// Bytes currently stored.
    async fn size(&self) -> u64;

    /// Declared byte budget.
    fn max_size(&self) -> u64;
}

struct MemoryStoreState {
    entries: LruCache<String, Bytes>,
    size: u64,
}

impl MemoryStoreState {
    fn evict_to(&mut self, max_size: u64) {
        while self.size > max_size {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.size = self.size.saturating_sub(evicted.len() as u64);
                }
                None => break,
            }
        }
    }
}

/// LRU byte store held in process memory.
pub struct MemoryStore {
    state: RwLock<MemoryStoreState>,
    max_size: u64,
}

impl MemoryStore {
    /// Create a store with default capacity (256MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Create a store bounded to `max_size` bytes.
    pub fn with_capacity(max_size: u64) -> Self {
        Self {
            state: RwLock::new(MemoryStoreState {
                entries: LruCache::unbounded(),
                size: 0,
            }),
            max_size,
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ByteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let data_size = data.len() as u64;
        let mut state = self.state.write().await;

        // If key exists, subtract old size first
        if let Some(old_size) = state.entries.peek(key).map(|old| old.len() as u64) {
            state.size = state.size.saturating_sub(old_size);
        }

        state.entries.put(key.to_string(), data);
        state.size += data_size;
        state.evict_to(self.max_size);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.entries.pop(key) {
            Some(data) => {
                state.size = state.size.saturating_sub(data.len() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.entries.contains(key))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.size = 0;
        Ok(())
    }

    async fn trim_to(&self, max_size: u64) -> Result<(), StoreError> {
        self.state.write().await.evict_to(max_size);
        Ok(())
    }

    async fn size(&self) -> u64 {
        self.state.read().await.size
    }

    fn max_size(&self) -> u64 {
        self.max_size
    }
}

// =============================================================================
// Tests
// =============================================================================
