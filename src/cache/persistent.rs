//! Persistent cache tier on top of a [`ByteStore`].
//!
//! # Keys
//!
//! Cache keys can be arbitrarily long and contain any character. The tier
//! stores entries under the SHA-256 of the cache key, hex encoded.
//!
//! # Write Serialization
//!
//! Writers for the same key are serialized through a per-key async lock.
//! Callers that need check-then-produce-then-write atomicity (e.g. the
//! download tier) take the lock with [`PersistentCache::lock`] and write
//! through the returned guard.
//!
//! # Failures
//!
//! Store errors never fail a request. A failed read is a miss, a failed write
//! is skipped, and both are logged.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::store::ByteStore;
use super::{CachePolicy, TrimLevel};

/// Prune dead per-key locks once the table grows past this.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 256;

/// Sanitized store key for a cache key.
pub fn store_key(cache_key: &str) -> String {
    hex::encode(Sha256::digest(cache_key.as_bytes()))
}

/// Exclusive write access to one key of a [`PersistentCache`].
pub struct KeyGuard {
    store_key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn store_key(&self) -> &str {
        &self.store_key
    }
}

/// One persistent cache tier (result or download).
pub struct PersistentCache {
    name: &'static str,
    store: Arc<dyn ByteStore>,
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl PersistentCache {
    /// Wrap `store` as a tier called `name` (used in logs).
    pub fn new(name: &'static str, store: Arc<dyn ByteStore>) -> Self {
        Self {
            name,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the write lock for `cache_key`.
    pub async fn lock(&self, cache_key: &str) -> KeyGuard {
        let store_key = store_key(cache_key);
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > LOCK_TABLE_PRUNE_THRESHOLD {
                locks.retain(|_, weak| weak.strong_count() > 0);
            }
            match locks.get(&store_key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(store_key.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };

        KeyGuard {
            store_key,
            _guard: lock.lock_owned().await,
        }
    }

    /// Read an entry if `policy` allows reads.
    pub async fn read(&self, cache_key: &str, policy: CachePolicy) -> Option<Bytes> {
        if !policy.read_enabled() {
            return None;
        }
        self.read_store_key(&store_key(cache_key)).await
    }

    /// Read while holding the key's write lock.
    pub async fn read_locked(&self, guard: &KeyGuard, policy: CachePolicy) -> Option<Bytes> {
        if !policy.read_enabled() {
            return None;
        }
        self.read_store_key(guard.store_key()).await
    }

    async fn read_store_key(&self, key: &str) -> Option<Bytes> {
        match self.store.get(key).await {
            Ok(Some(data)) => {
                debug!("{} cache hit {}", self.name, key);
                Some(data)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("{} cache read failed for {}: {}", self.name, key, e);
                None
            }
        }
    }

    /// Write an entry if `policy` allows writes. Returns `true` on success.
    pub async fn write(&self, cache_key: &str, data: Bytes, policy: CachePolicy) -> bool {
        if !policy.write_enabled() {
            return false;
        }
        let guard = self.lock(cache_key).await;
        self.write_locked(&guard, data, policy).await
    }

    /// Write while holding the key's write lock.
    pub async fn write_locked(&self, guard: &KeyGuard, data: Bytes, policy: CachePolicy) -> bool {
        if !policy.write_enabled() {
            return false;
        }
        match self.store.put(guard.store_key(), data).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "{} cache write failed for {}: {}",
                    self.name,
                    guard.store_key(),
                    e
                );
                false
            }
        }
    }

    /// Whether an entry exists, ignoring policy.
    pub async fn exists(&self, cache_key: &str) -> bool {
        self.store
            .exists(&store_key(cache_key))
            .await
            .unwrap_or(false)
    }

    /// Remove an entry. Returns `true` if one existed.
    pub async fn remove(&self, cache_key: &str) -> bool {
        let guard = self.lock(cache_key).await;
        match self.store.remove(guard.store_key()).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("{} cache remove failed: {}", self.name, e);
                false
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.store.clear().await {
            warn!("{} cache clear failed: {}", self.name, e);
        }
    }

    pub async fn trim(&self, level: TrimLevel) {
        let target = level.target_size(self.store.max_size() as usize) as u64;
        if let Err(e) = self.store.trim_to(target).await {
            warn!("{} cache trim failed: {}", self.name, e);
        }
    }

    pub async fn size(&self) -> u64 {
        self.store.size().await
    }

    pub fn max_size(&self) -> u64 {
        self.store.max_size()
    }
}

// =============================================================================
// Tests
// =============================================================================
