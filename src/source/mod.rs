//! Source locators and fetchers.
//!
//! The engine never performs I/O itself. A [`Fetcher`] turns a [`Locator`]
//! into bytes plus a [`DataFrom`] provenance tag. Two fetchers ship with the
//! crate: [`FileFetcher`] for local paths and `file://` URLs, and
//! [`MemoryFetcher`] for bytes registered up front.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SourceError;

// =============================================================================
// Provenance
// =============================================================================

/// Where the bytes or pixels of a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFrom {
    /// Served from the in-process memory cache
    MemoryCache,
    /// Decoded pixels restored from the result cache
    ResultCache,
    /// Raw bytes restored from the download cache
    DownloadCache,
    /// Read from the local filesystem
    Local,
    /// Fetched over the network
    Network,
    /// Bytes that were already in memory
    Memory,
}

impl DataFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            DataFrom::MemoryCache => "MEMORY_CACHE",
            DataFrom::ResultCache => "RESULT_CACHE",
            DataFrom::DownloadCache => "DOWNLOAD_CACHE",
            DataFrom::Local => "LOCAL",
            DataFrom::Network => "NETWORK",
            DataFrom::Memory => "MEMORY",
        }
    }
}

impl fmt::Display for DataFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Locator
// =============================================================================

/// Identifies a source image, e.g. `file:///photos/a.png`, `memory://img-42`,
/// or a bare filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator(Arc<str>);

impl Locator {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URL scheme, or `"file"` for bare paths.
    pub fn scheme(&self) -> String {
        match Url::parse(&self.0) {
            // Single-letter schemes are Windows drive letters
            Ok(url) if url.scheme().len() > 1 => url.scheme().to_string(),
            _ => "file".to_string(),
        }
    }

    /// Filesystem path for `file` locators.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        match Url::parse(&self.0) {
            Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
            Ok(url) if url.scheme().len() > 1 => None,
            _ => Some(PathBuf::from(self.0.as_ref())),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Locator::new(value)
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        Locator::new(value)
    }
}

// =============================================================================
// Fetcher
// =============================================================================

/// Bytes produced by a fetcher.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub data: Bytes,
    pub data_from: DataFrom,
}

impl FetchResult {
    pub fn new(data: impl Into<Bytes>, data_from: DataFrom) -> Self {
        Self {
            data: data.into(),
            data_from,
        }
    }
}

/// Turns a locator into bytes.
///
/// Implementations own all transport concerns. Timeouts are applied by the
/// engine around this call.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, locator: &Locator) -> Result<FetchResult, SourceError>;
}

/// Reads local files with `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {}

impl FileFetcher {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<FetchResult, SourceError> {
        let path = locator
            .to_file_path()
            .ok_or_else(|| SourceError::UnsupportedLocator(locator.to_string()))?;

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(FetchResult::new(data, DataFrom::Local)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(SourceError::Io(e.to_string())),
        }
    }
}

/// Serves bytes registered ahead of time, keyed by the full locator string.
#[derive(Debug, Clone)]
pub struct MemoryFetcher {
    sources: HashMap<String, Bytes>,
    data_from: DataFrom,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            data_from: DataFrom::Memory,
        }
    }

    /// Report a different provenance for every fetch.
    pub fn with_data_from(mut self, data_from: DataFrom) -> Self {
        self.data_from = data_from;
        self
    }

    pub fn with_source(mut self, locator: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.sources.insert(locator.into(), data.into());
        self
    }
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<FetchResult, SourceError> {
        self.sources
            .get(locator.as_str())
            .map(|data| FetchResult::new(data.clone(), self.data_from))
            .ok_or_else(|| SourceError::NotFound(locator.to_string()))
    }
}
