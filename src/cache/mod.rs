//! Multi-tier cache.
//!
//! # Tiers
//!
//! ```text
//! ┌───────────────────────────────┐
//! │ MemoryCache                   │  decoded pixels, ref-counted LRU
//! └──────────────┬────────────────┘
//!                ▼
//! ┌───────────────────────────────┐
//! │ Result cache (PersistentCache)│  decoded pixels, serialized
//! └──────────────┬────────────────┘
//!                ▼
//! ┌───────────────────────────────┐
//! │ Download cache                │  raw fetched bytes
//! └──────────────┬────────────────┘
//!                ▼
//!             Fetcher
//! ```
//!
//! Each tier is governed by its own [`CachePolicy`] on the request. The
//! persistent tiers sit on top of any [`ByteStore`]; [`MemoryStore`] and
//! [`DiskStore`] ship with the crate.

mod disk;
mod entry;
mod memory;
mod persistent;
mod store;

use serde::{Deserialize, Serialize};

pub use disk::DiskStore;
pub use entry::{decode_record, encode_record, ImageData};
pub use memory::{MemoryCache, MemoryHandle, DEFAULT_MEMORY_CACHE_CAPACITY};
pub use persistent::{store_key, KeyGuard, PersistentCache};
pub use store::{ByteStore, MemoryStore, DEFAULT_STORE_CAPACITY};

/// Read/write enablement of one cache tier for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CachePolicy {
    /// Read and write
    #[default]
    Enabled,
    /// Neither read nor write
    Disabled,
    /// Serve existing entries, never write
    ReadOnly,
    /// Always miss on read, write results
    WriteOnly,
}

impl CachePolicy {
    pub fn read_enabled(self) -> bool {
        matches!(self, CachePolicy::Enabled | CachePolicy::ReadOnly)
    }

    pub fn write_enabled(self) -> bool {
        matches!(self, CachePolicy::Enabled | CachePolicy::WriteOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CachePolicy::Enabled => "ENABLED",
            CachePolicy::Disabled => "DISABLED",
            CachePolicy::ReadOnly => "READ_ONLY",
            CachePolicy::WriteOnly => "WRITE_ONLY",
        }
    }
}

/// How aggressively to shrink a cache or pool under memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimLevel {
    /// Shrink to half of the budget
    Moderate,
    /// Drop everything that can be dropped
    Complete,
}

impl TrimLevel {
    /// Size a structure with budget `max_size` should shrink to.
    pub fn target_size(self, max_size: usize) -> usize {
        match self {
            TrimLevel::Moderate => max_size / 2,
            TrimLevel::Complete => 0,
        }
    }
}
