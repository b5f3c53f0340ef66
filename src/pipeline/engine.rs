//! The image loader.
//!
//! # Request Flow
//!
//! ```text
//! Request ──► CacheKey ──► InFlight ──► request chain ──► decode chain
//!                             │           MemoryCache      ResultCache
//!                             │                            Transformation
//!                             │                            fetch + decode
//!                             ▼
//!                    every waiter gets the result
//! ```
//!
//! [`ImageLoader`] is cheap to clone; clones share caches, pool and the
//! in-flight table.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::chain::{
    sort_by_weight, DecodeInterceptor, ImageResult, LoadContext, RequestChain, RequestInterceptor,
};
use super::dedup::InFlight;
use super::handle::{LoadEvent, RequestHandle, TerminalSender};
use super::interceptors::{
    EngineDecodeInterceptor, EngineRequestInterceptor, MemoryCacheInterceptor,
    ResultCacheInterceptor, SourceLoader, TransformationInterceptor,
};
use super::slots::{DecodeSlots, DEFAULT_DECODE_PARALLELISM};
use crate::cache::{
    ByteStore, DiskStore, MemoryCache, MemoryStore, PersistentCache, TrimLevel,
    DEFAULT_MEMORY_CACHE_CAPACITY, DEFAULT_STORE_CAPACITY,
};
use crate::codec::{ImageDecoder, StandardDecoder};
use crate::error::{LoadError, SourceError, StoreError};
use crate::pool::{BufferPool, PoolStats, DEFAULT_POOL_CAPACITY};
use crate::request::Request;
use crate::source::{FetchResult, Fetcher, FileFetcher};

/// Library-level loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Memory tier budget in bytes
    pub memory_cache_size: usize,
    /// Result tier budget in bytes
    pub result_cache_size: u64,
    /// Download tier budget in bytes
    pub download_cache_size: u64,
    /// Buffer pool budget in bytes
    pub pool_size: usize,
    /// Directory for persistent tiers; in-memory stores when `None`
    pub cache_dir: Option<PathBuf>,
    /// Concurrent decodes (clamped to 1..=4)
    pub decode_parallelism: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: DEFAULT_MEMORY_CACHE_CAPACITY,
            result_cache_size: DEFAULT_STORE_CAPACITY,
            download_cache_size: DEFAULT_STORE_CAPACITY,
            pool_size: DEFAULT_POOL_CAPACITY,
            cache_dir: None,
            decode_parallelism: DEFAULT_DECODE_PARALLELISM,
        }
    }
}

/// Sizes of every cache tier and the pool.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory_size: usize,
    pub memory_max_size: usize,
    pub result_size: u64,
    pub result_max_size: u64,
    pub download_size: u64,
    pub download_max_size: u64,
    pub pool_size: usize,
    pub pool_max_size: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ImageLoader`].
pub struct ImageLoaderBuilder {
    config: LoaderConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    result_store: Option<Arc<dyn ByteStore>>,
    download_store: Option<Arc<dyn ByteStore>>,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    decode_interceptors: Vec<Arc<dyn DecodeInterceptor>>,
}

impl ImageLoaderBuilder {
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of bytes. Defaults to [`FileFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Codec. Defaults to [`StandardDecoder`].
    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Store behind the result tier, overriding `cache_dir`.
    pub fn result_store(mut self, store: Arc<dyn ByteStore>) -> Self {
        self.result_store = Some(store);
        self
    }

    /// Store behind the download tier, overriding `cache_dir`.
    pub fn download_store(mut self, store: Arc<dyn ByteStore>) -> Self {
        self.download_store = Some(store);
        self
    }

    pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    pub fn decode_interceptor(mut self, interceptor: Arc<dyn DecodeInterceptor>) -> Self {
        self.decode_interceptors.push(interceptor);
        self
    }

    /// Open disk stores under `cache_dir` (if set), then build.
    pub async fn open(mut self) -> Result<ImageLoader, StoreError> {
        if let Some(dir) = self.config.cache_dir.clone() {
            if self.result_store.is_none() {
                let store = DiskStore::open(dir.join("result"), self.config.result_cache_size).await?;
                self.result_store = Some(Arc::new(store));
            }
            if self.download_store.is_none() {
                let store =
                    DiskStore::open(dir.join("download"), self.config.download_cache_size).await?;
                self.download_store = Some(Arc::new(store));
            }
            info!("Persistent caches opened under {}", dir.display());
        }
        Ok(self.build())
    }

    /// Build with in-memory stores for any tier without an explicit store.
    pub fn build(self) -> ImageLoader {
        let config = self.config;
        let pool = Arc::new(BufferPool::with_capacity(config.pool_size));
        let memory = MemoryCache::with_pool(config.memory_cache_size, pool.clone());
        let result_store: Arc<dyn ByteStore> = match self.result_store {
            Some(store) => store,
            None => Arc::new(MemoryStore::with_capacity(config.result_cache_size)),
        };
        let download_store: Arc<dyn ByteStore> = match self.download_store {
            Some(store) => store,
            None => Arc::new(MemoryStore::with_capacity(config.download_cache_size)),
        };
        let result = Arc::new(PersistentCache::new("result", result_store));
        let download = Arc::new(PersistentCache::new("download", download_store));

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(FileFetcher::new()),
        };
        let decoder: Arc<dyn ImageDecoder> = match self.decoder {
            Some(decoder) => decoder,
            None => Arc::new(StandardDecoder::new()),
        };
        let slots = DecodeSlots::new(config.decode_parallelism);
        let source = Arc::new(SourceLoader::new(fetcher, download.clone()));

        // Output identities, in execution order
        let mut interceptor_keys: Vec<String> = Vec::new();

        let mut decode_chain = self.decode_interceptors;
        decode_chain.push(Arc::new(ResultCacheInterceptor::new(result.clone())));
        decode_chain.push(Arc::new(TransformationInterceptor::new(
            pool.clone(),
            slots.clone(),
        )));
        sort_by_weight(&mut decode_chain, |i| i.sort_weight());

        let mut request_chain = self.request_interceptors;
        request_chain.push(Arc::new(MemoryCacheInterceptor::new(memory.clone())));
        sort_by_weight(&mut request_chain, |i| i.sort_weight());

        interceptor_keys.extend(request_chain.iter().filter_map(|i| i.key()));
        interceptor_keys.extend(decode_chain.iter().filter_map(|i| i.key()));

        decode_chain.push(Arc::new(EngineDecodeInterceptor::new(
            source.clone(),
            decoder.clone(),
            pool.clone(),
            slots.clone(),
        )));
        request_chain.push(Arc::new(EngineRequestInterceptor::new(decode_chain)));

        debug!(
            "Image loader ready: {} request interceptors, decode parallelism {}",
            request_chain.len(),
            slots.parallelism()
        );

        ImageLoader {
            inner: Arc::new(LoaderInner {
                pool,
                memory,
                result,
                download,
                source,
                decoder,
                slots,
                request_chain,
                interceptor_keys,
                inflight: InFlight::new(),
            }),
        }
    }
}

// =============================================================================
// Loader
// =============================================================================

struct LoaderInner {
    pool: Arc<BufferPool>,
    memory: MemoryCache,
    result: Arc<PersistentCache>,
    download: Arc<PersistentCache>,
    source: Arc<SourceLoader>,
    decoder: Arc<dyn ImageDecoder>,
    slots: DecodeSlots,
    request_chain: Vec<Arc<dyn RequestInterceptor>>,
    interceptor_keys: Vec<String>,
    inflight: InFlight<ImageResult>,
}

/// Fetches, decodes, transforms and caches images.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<LoaderInner>,
}

impl ImageLoader {
    pub fn builder() -> ImageLoaderBuilder {
        ImageLoaderBuilder {
            config: LoaderConfig::default(),
            fetcher: None,
            decoder: None,
            result_store: None,
            download_store: None,
            request_interceptors: Vec::new(),
            decode_interceptors: Vec::new(),
        }
    }

    /// Loader with default fetcher and decoder and in-memory stores.
    pub fn new(config: LoaderConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Cache key `request` will be executed under.
    pub fn cache_key(&self, request: &Request) -> crate::request::CacheKey {
        request.cache_key_with(&self.inner.interceptor_keys)
    }

    /// Load `request` and wait for the result.
    pub async fn execute(&self, request: Request) -> Result<ImageResult, LoadError> {
        self.execute_with_events(request, None).await
    }

    async fn execute_with_events(
        &self,
        request: Request,
        events: Option<mpsc::UnboundedSender<LoadEvent>>,
    ) -> Result<ImageResult, LoadError> {
        let cache_key = self.cache_key(&request);
        let request = Arc::new(request);
        let inner = self.inner.clone();
        let key = cache_key.clone();

        let producer = async move {
            let context = LoadContext::new(request, key, events);
            RequestChain::new(&inner.request_chain, &context)
                .proceed()
                .await
        };
        self.inner.inflight.run(cache_key.as_str(), producer).await
    }

    /// Start `request` in the background and return a handle to its events.
    pub fn submit(&self, request: Request) -> RequestHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let request_key = request.request_key();
        let terminal = TerminalSender::new(tx);
        let _ = terminal.events().send(LoadEvent::Started {
            request_key: request_key.clone(),
        });

        let loader = self.clone();
        let task_terminal = terminal.clone();
        let task = tokio::spawn(async move {
            let events = task_terminal.events().clone();
            let event = match loader.execute_with_events(request, Some(events)).await {
                Ok(result) => LoadEvent::Success(result),
                Err(LoadError::Cancelled) => LoadEvent::Cancelled,
                Err(err) => LoadEvent::Error(err),
            };
            task_terminal.finish(event);
        });

        RequestHandle::new(request_key, rx, terminal, task.abort_handle())
    }

    /// Fetch the raw bytes of `request` through the download tier.
    pub async fn fetch(&self, request: &Request) -> Result<FetchResult, SourceError> {
        self.inner.source.load(request).await
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.inner.memory
    }

    pub fn result_cache(&self) -> &PersistentCache {
        &self.inner.result
    }

    pub fn download_cache(&self) -> &PersistentCache {
        &self.inner.download
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    pub fn decoder(&self) -> &Arc<dyn ImageDecoder> {
        &self.inner.decoder
    }

    pub fn decode_parallelism(&self) -> usize {
        self.inner.slots.parallelism()
    }

    /// Number of cache keys with a load in progress.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Trim every tier and the pool.
    pub async fn trim(&self, level: TrimLevel) {
        self.inner.memory.trim(level);
        self.inner.result.trim(level).await;
        self.inner.download.trim(level).await;
        self.inner.pool.trim(level);
    }

    /// Clear every tier and the pool. Referenced memory entries survive.
    pub async fn clear(&self) {
        self.inner.memory.clear();
        self.inner.result.clear().await;
        self.inner.download.clear().await;
        self.inner.pool.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let PoolStats { hits, misses, .. } = self.inner.pool.stats();
        CacheStats {
            memory_size: self.inner.memory.size(),
            memory_max_size: self.inner.memory.max_size(),
            result_size: self.inner.result.size().await,
            result_max_size: self.inner.result.max_size(),
            download_size: self.inner.download.size().await,
            download_max_size: self.inner.download.max_size(),
            pool_size: self.inner.pool.size(),
            pool_max_size: self.inner.pool.max_size(),
            pool_hits: hits,
            pool_misses: misses,
        }
    }
}
