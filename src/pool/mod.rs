//! Reusable pixel-buffer pool.
//!
//! Decoding large images allocates large buffers. The pool keeps buffers that
//! nobody holds any more, bucketed by `(width, height, format)`, so the next
//! decode of the same geometry can write into one instead of allocating.
//!
//! # Ownership
//!
//! A buffer is either in the free list or owned by a caller, never both.
//! [`BufferPool::get`] moves the buffer out of the free list; only
//! [`BufferPool::put`] moves one back in.
//!
//! # Reuse Policy
//!
//! Lookups require an exact geometry match. An oversized buffer is never
//! handed out for a smaller request, and a smaller one never for a larger.
//!
//! # Eviction
//!
//! The pool is bounded by total bytes. When a `put` pushes it over budget the
//! oldest pooled buffers are freed first.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::TrimLevel;
use crate::codec::{buffer_byte_size, Allocator, PixelBuffer, PixelFormat};

/// Default pool budget: 32MB
pub const DEFAULT_POOL_CAPACITY: usize = 32 * 1024 * 1024;

/// Bucket identifier for pooled buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl PoolKey {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    fn of(buffer: &PixelBuffer) -> Self {
        Self::new(buffer.width(), buffer.height(), buffer.format())
    }
}

/// Why a buffer was not accepted by [`BufferPool::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutRejection {
    /// The pool is disabled
    Disabled,
    /// The buffer is immutable and cannot be decoded into
    Immutable,
    /// The buffer's storage has already been freed
    Released,
    /// The buffer alone exceeds the pool budget
    TooLarge,
}

/// Counters describing pool effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
}

struct PoolState {
    /// Pooled buffers keyed by insertion sequence, oldest first
    entries: BTreeMap<u64, PixelBuffer>,
    /// Sequences per bucket, oldest at the front
    buckets: HashMap<PoolKey, VecDeque<u64>>,
    next_seq: u64,
    size: usize,
    max_size: usize,
    disabled: bool,
    stats: PoolStats,
}

impl PoolState {
    fn remove_oldest(&mut self) -> Option<PixelBuffer> {
        let (seq, buffer) = self.entries.pop_first()?;
        let key = PoolKey::of(&buffer);
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.retain(|s| *s != seq);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
        self.size = self.size.saturating_sub(buffer.byte_size());
        Some(buffer)
    }

    fn trim_to(&mut self, max_size: usize) {
        while self.size > max_size {
            match self.remove_oldest() {
                Some(buffer) => {
                    self.stats.evictions += 1;
                    debug!(
                        "Pool evicted {}x{} {:?} buffer",
                        buffer.width(),
                        buffer.height(),
                        buffer.format()
                    );
                }
                None => break,
            }
        }
    }
}

/// Size-bounded pool of reusable pixel buffers.
///
/// # Thread Safety
///
/// All operations take a short internal lock and may be called from decode
/// worker threads and async tasks alike.
pub struct BufferPool {
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a pool with the default budget (32MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool bounded to `max_size` bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: BTreeMap::new(),
                buckets: HashMap::new(),
                next_seq: 0,
                size: 0,
                max_size,
                disabled: false,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Offer a buffer back to the pool.
    ///
    /// Accepted buffers may later be returned by [`get`](Self::get). A rejected
    /// buffer is handed back to the caller together with the reason.
    pub fn put(&self, buffer: PixelBuffer) -> Result<(), (PixelBuffer, PutRejection)> {
        let mut state = self.state.lock();

        if state.disabled {
            return Err((buffer, PutRejection::Disabled));
        }
        if !buffer.is_mutable() {
            return Err((buffer, PutRejection::Immutable));
        }
        if buffer.is_released() {
            return Err((buffer, PutRejection::Released));
        }
        let size = buffer.byte_size();
        if size > state.max_size {
            return Err((buffer, PutRejection::TooLarge));
        }

        let key = PoolKey::of(&buffer);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(seq, buffer);
        state.buckets.entry(key).or_default().push_back(seq);
        state.size += size;
        state.stats.puts += 1;

        let max_size = state.max_size;
        state.trim_to(max_size);
        Ok(())
    }

    /// Remove and return a pooled buffer of exactly this geometry.
    pub fn get(&self, width: u32, height: u32, format: PixelFormat) -> Option<PixelBuffer> {
        let key = PoolKey::new(width, height, format);
        let mut state = self.state.lock();

        let seq = state.buckets.get_mut(&key).and_then(|bucket| bucket.pop_back());
        let Some(seq) = seq else {
            state.stats.misses += 1;
            return None;
        };
        if state.buckets.get(&key).is_some_and(|b| b.is_empty()) {
            state.buckets.remove(&key);
        }

        let buffer = state.entries.remove(&seq)?;
        state.size = state.size.saturating_sub(buffer.byte_size());
        state.stats.hits += 1;
        Some(buffer)
    }

    /// Return a pooled buffer, or allocate a fresh one on a miss.
    pub fn get_or_create(&self, width: u32, height: u32, format: PixelFormat) -> PixelBuffer {
        self.get(width, height, format)
            .unwrap_or_else(|| PixelBuffer::new(width, height, format))
    }

    /// Whether a buffer of this geometry is currently pooled.
    pub fn contains(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        let state = self.state.lock();
        state
            .buckets
            .get(&PoolKey::new(width, height, format))
            .is_some_and(|b| !b.is_empty())
    }

    /// Enable or disable pooling. Disabling frees every pooled buffer.
    pub fn set_disabled(&self, disabled: bool) {
        let mut state = self.state.lock();
        state.disabled = disabled;
        if disabled {
            state.trim_to(0);
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.state.lock().disabled
    }

    /// Free pooled buffers according to `level`.
    pub fn trim(&self, level: TrimLevel) {
        let mut state = self.state.lock();
        let target = level.target_size(state.max_size);
        state.trim_to(target);
    }

    /// Free every pooled buffer.
    pub fn clear(&self) {
        self.state.lock().trim_to(0);
    }

    /// Total bytes currently pooled.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Byte budget of the pool.
    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    /// Number of pooled buffers.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Bytes a buffer of this geometry would occupy in the pool.
    pub fn byte_size_of(width: u32, height: u32, format: PixelFormat) -> usize {
        buffer_byte_size(width, height, format)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for BufferPool {
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> PixelBuffer {
        self.get_or_create(width, height, format)
    }

    fn release(&self, buffer: PixelBuffer) {
        if let Err((buffer, reason)) = self.put(buffer) {
            trace!(
                "Dropping {}x{} {} buffer instead of pooling: {:?}",
                buffer.width(),
                buffer.height(),
                buffer.format().name(),
                reason
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
