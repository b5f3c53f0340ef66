//! In-process memory cache for decoded images.
//!
//! # Reference Counting
//!
//! Every consumer of a cached image holds a [`MemoryHandle`]. Creating or
//! cloning a handle increments the entry's reference count, dropping one
//! decrements it. Both happen under the same lock as the eviction scan, so an
//! entry can never be evicted between a lookup and the attach.
//!
//! # Size-Based Eviction
//!
//! The cache tracks decoded bytes. After every insert, and whenever an entry's
//! last handle is dropped, least-recently-used entries are evicted while the
//! cache is over budget. Entries with a non-zero reference count are skipped
//! regardless of recency, so referenced bytes may exceed the budget while
//! unreferenced bytes never do.
//!
//! Evicted images nobody else holds return their buffer to the
//! [`BufferPool`], if one is attached.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::entry::ImageData;
use super::TrimLevel;
use crate::pool::BufferPool;

/// Default cache capacity: 64MB
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

struct Slot {
    id: u64,
    image: Arc<ImageData>,
    refs: usize,
    bytes: usize,
}

struct MemoryState {
    lru: LruCache<String, Slot>,
    size: usize,
    max_size: usize,
    next_id: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &str) -> Option<Arc<ImageData>> {
        let slot = self.lru.pop(key)?;
        self.size = self.size.saturating_sub(slot.bytes);
        Some(slot.image)
    }

    /// Evict unreferenced entries, oldest first, until `size <= target`.
    fn evict_to(&mut self, target: usize) -> Vec<Arc<ImageData>> {
        if self.size <= target {
            return Vec::new();
        }

        let mut excess = self.size - target;
        let mut victims = Vec::new();
        for (key, slot) in self.lru.iter().rev() {
            if excess == 0 {
                break;
            }
            if slot.refs == 0 {
                victims.push(key.clone());
                excess = excess.saturating_sub(slot.bytes);
            }
        }

        victims
            .iter()
            .filter_map(|key| {
                debug!("Memory cache evicted {}", key);
                self.remove(key)
            })
            .collect()
    }
}

struct Shared {
    state: Mutex<MemoryState>,
    pool: Option<Arc<BufferPool>>,
}

impl Shared {
    /// Return evicted buffers to the pool outside the cache lock.
    fn recycle(&self, evicted: Vec<Arc<ImageData>>) {
        let Some(pool) = &self.pool else {
            return;
        };
        for image in evicted {
            if let Ok(image) = Arc::try_unwrap(image) {
                let _ = pool.put(image.buffer);
            }
        }
    }

    fn detach(&self, key: &str, id: u64) {
        let evicted = {
            let mut state = self.state.lock();
            let released = match state.lru.peek_mut(key) {
                Some(slot) if slot.id == id => {
                    slot.refs = slot.refs.saturating_sub(1);
                    slot.refs == 0
                }
                _ => false,
            };
            if released {
                let max_size = state.max_size;
                state.evict_to(max_size)
            } else {
                Vec::new()
            }
        };
        self.recycle(evicted);
    }

    fn attach(&self, key: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(slot) = state.lru.peek_mut(key) {
            if slot.id == id {
                slot.refs += 1;
            }
        }
    }
}

/// A consumer's reference to a memory-cache entry.
///
/// The entry cannot be evicted while any handle for it is alive.
pub struct MemoryHandle {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    image: Arc<ImageData>,
}

impl MemoryHandle {
    pub fn image(&self) -> &Arc<ImageData> {
        &self.image
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Clone for MemoryHandle {
    fn clone(&self) -> Self {
        self.shared.attach(&self.key, self.id);
        Self {
            shared: self.shared.clone(),
            key: self.key.clone(),
            id: self.id,
            image: self.image.clone(),
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.shared.detach(&self.key, self.id);
    }
}

impl std::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Size-bounded, reference-counted LRU of decoded images.
///
/// # Example
///
/// ```
/// use tessera::cache::{ImageData, MemoryCache};
/// use tessera::codec::{ImageInfo, PixelBuffer, PixelFormat};
/// use tessera::source::DataFrom;
///
/// let cache = MemoryCache::with_capacity(1024 * 1024);
/// let image = ImageData {
///     buffer: PixelBuffer::new(16, 16, PixelFormat::Rgba8),
///     info: ImageInfo::new(16, 16, "image/png"),
///     transformed: Vec::new(),
///     data_from: DataFrom::Local,
/// };
///
/// let handle = cache.insert("key", image);
/// assert_eq!(cache.ref_count("key"), Some(1));
/// drop(handle);
/// assert_eq!(cache.ref_count("key"), Some(0));
/// ```
#[derive(Clone)]
pub struct MemoryCache {
    shared: Arc<Shared>,
}

impl MemoryCache {
    /// Create a cache with default capacity (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_CAPACITY)
    }

    /// Create a cache bounded to `max_size` bytes of unreferenced images.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::build(max_size, None)
    }

    /// Create a cache whose evicted buffers feed `pool`.
    pub fn with_pool(max_size: usize, pool: Arc<BufferPool>) -> Self {
        Self::build(max_size, Some(pool))
    }

    fn build(max_size: usize, pool: Option<Arc<BufferPool>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState {
                    lru: LruCache::unbounded(),
                    size: 0,
                    max_size,
                    next_id: 0,
                }),
                pool,
            }),
        }
    }

    /// Look up an entry and attach to it.
    ///
    /// Marks the entry as recently used.
    pub fn get(&self, key: &str) -> Option<MemoryHandle> {
        let mut state = self.shared.state.lock();
        let slot = state.lru.get_mut(key)?;
        slot.refs += 1;
        Some(MemoryHandle {
            shared: self.shared.clone(),
            key: key.to_string(),
            id: slot.id,
            image: slot.image.clone(),
        })
    }

    /// Insert an image and return a handle already attached to it.
    ///
    /// Replaces any existing entry for `key`; outstanding handles to the old
    /// entry stay valid but no longer pin anything.
    pub fn insert(&self, key: impl Into<String>, image: impl Into<Arc<ImageData>>) -> MemoryHandle {
        let key = key.into();
        let image = image.into();
        let bytes = image.byte_size();

        let (handle, evicted) = {
            let mut state = self.shared.state.lock();
            let mut evicted: Vec<Arc<ImageData>> = state.remove(&key).into_iter().collect();

            let id = state.next_id;
            state.next_id += 1;
            state.lru.put(
                key.clone(),
                Slot {
                    id,
                    image: image.clone(),
                    refs: 1,
                    bytes,
                },
            );
            state.size += bytes;

            let max_size = state.max_size;
            evicted.extend(state.evict_to(max_size));

            let handle = MemoryHandle {
                shared: self.shared.clone(),
                key,
                id,
                image,
            };
            (handle, evicted)
        };

        self.shared.recycle(evicted);
        handle
    }

    /// Check for an entry without attaching or updating LRU order.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.state.lock().lru.contains(key)
    }

    /// Current reference count of an entry.
    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.shared.state.lock().lru.peek(key).map(|slot| slot.refs)
    }

    /// Remove an entry regardless of references.
    ///
    /// Returns `true` if an entry existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shared.state.lock().remove(key);
        let existed = removed.is_some();
        self.shared.recycle(removed.into_iter().collect());
        existed
    }

    /// Evict unreferenced entries according to `level`.
    pub fn trim(&self, level: TrimLevel) {
        let evicted = {
            let mut state = self.shared.state.lock();
            let target = level.target_size(state.max_size);
            state.evict_to(target)
        };
        self.shared.recycle(evicted);
    }

    /// Evict every unreferenced entry.
    pub fn clear(&self) {
        self.trim(TrimLevel::Complete);
    }

    /// Total resident bytes, referenced or not.
    pub fn size(&self) -> usize {
        self.shared.state.lock().size
    }

    /// Resident bytes of entries nobody references.
    pub fn unreferenced_size(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .lru
            .iter()
            .filter(|(_, slot)| slot.refs == 0)
            .map(|(_, slot)| slot.bytes)
            .sum()
    }

    pub fn max_size(&self) -> usize {
        self.shared.state.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
