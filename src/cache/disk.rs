//! Directory-backed [`ByteStore`].
//!
//! Each entry is one file named by its key. Writes go to a temporary file that
//! is renamed into place, so readers never observe a partial entry. The LRU
//! index lives in memory and is rebuilt from file modification times when the
//! store is opened.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::store::ByteStore;
use crate::error::StoreError;

const TEMP_PREFIX: &str = ".tmp-";

struct DiskIndex {
    entries: LruCache<String, u64>,
    size: u64,
    next_temp: u64,
}

/// LRU byte store persisted as files in one directory.
pub struct DiskStore {
    dir: PathBuf,
    index: Mutex<DiskIndex>,
    max_size: u64,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// Existing entries are indexed oldest-modified first; leftover temporary
    /// files are deleted; the store is trimmed to `max_size`.
    pub async fn open(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut found = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                let _ = tokio::fs::remove_file(entry.path()).await;
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok();
            found.push((modified, name, metadata.len()));
        }
        found.sort();

        let mut entries = LruCache::unbounded();
        let mut size = 0;
        for (_, name, len) in found {
            size += len;
            entries.put(name, len);
        }
        debug!(
            "Opened disk store {} with {} entries ({} bytes)",
            dir.display(),
            entries.len(),
            size
        );

        let store = Self {
            dir,
            index: Mutex::new(DiskIndex {
                entries,
                size,
                next_temp: 0,
            }),
            max_size,
        };
        store.trim_to(max_size).await?;
        Ok(store)
    }

    /// Directory holding the entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Io(format!("invalid store key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }

    async fn evict_to(&self, index: &mut DiskIndex, max_size: u64) -> Result<(), StoreError> {
        while index.size > max_size {
            let Some((key, len)) = index.entries.pop_lru() else {
                break;
            };
            index.size = index.size.saturating_sub(len);
            match tokio::fs::remove_file(self.dir.join(&key)).await {
                Ok(()) => debug!("Disk store evicted {}", key),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to evict {}: {}", key, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ByteStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.entry_path(key)?;
        let mut index = self.index.lock().await;
        if index.entries.get(key).is_none() {
            return Ok(None);
        }

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted behind our back
                if let Some(len) = index.entries.pop(key) {
                    index.size = index.size.saturating_sub(len);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.entry_path(key)?;
        let mut index = self.index.lock().await;

        let temp = self
            .dir
            .join(format!("{}{}-{}", TEMP_PREFIX, index.next_temp, key));
        index.next_temp += 1;

        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        if let Some(old_len) = index.entries.pop(key) {
            index.size = index.size.saturating_sub(old_len);
        }
        index.entries.put(key.to_string(), data.len() as u64);
        index.size += data.len() as u64;

        self.evict_to(&mut index, self.max_size).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.entry_path(key)?;
        let mut index = self.index.lock().await;
        let Some(len) = index.entries.pop(key) else {
            return Ok(false);
        };
        index.size = index.size.saturating_sub(len);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.entry_path(key)?;
        Ok(self.index.lock().await.entries.contains(key))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        self.evict_to(&mut index, 0).await
    }

    async fn trim_to(&self, max_size: u64) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        self.evict_to(&mut index, max_size).await
    }

    async fn size(&self) -> u64 {
        self.index.lock().await.size
    }

    fn max_size(&self) -> u64 {
        self.max_size
    }
}
