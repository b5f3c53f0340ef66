//! Cache tier and buffer pool integration tests.
//!
//! Tests verify:
//! - The cache-policy matrix on the result tier
//! - Download tier scope and policy
//! - Memory budget with referenced and unreferenced entries
//! - Pool exclusivity and eviction feeding the pool
//! - Persistent tiers surviving a loader restart

use std::sync::Arc;

use tessera::cache::{ByteStore, CachePolicy, ImageData, MemoryCache, MemoryStore, TrimLevel};
use tessera::codec::{ImageInfo, PixelBuffer, PixelFormat};
use tessera::pipeline::{ImageLoader, LoaderConfig};
use tessera::pool::BufferPool;
use tessera::request::Request;
use tessera::source::{DataFrom, MemoryFetcher};

use super::test_utils::{png_bytes, CountingFetcher};

fn image(width: u32, height: u32) -> ImageData {
    ImageData {
        buffer: PixelBuffer::new(width, height, PixelFormat::Rgba8),
        info: ImageInfo::new(width, height, "image/png"),
        transformed: Vec::new(),
        data_from: DataFrom::Local,
    }
}

fn loader_with_result_store(store: Arc<MemoryStore>) -> ImageLoader {
    ImageLoader::builder()
        .fetcher(Arc::new(CountingFetcher::network("img", png_bytes(32, 32))))
        .result_store(store)
        .build()
}

/// Request that bypasses the memory tier so the result tier is observable.
fn result_request(policy: CachePolicy) -> Request {
    Request::builder("img")
        .memory_cache_policy(CachePolicy::Disabled)
        .result_cache_policy(policy)
        .build()
}

// =============================================================================
// Cache-Policy Matrix
// =============================================================================

#[tokio::test]
async fn test_result_policy_enabled() {
    let store = Arc::new(MemoryStore::new());
    let loader = loader_with_result_store(store.clone());

    loader.execute(result_request(CachePolicy::Enabled)).await.unwrap();
    let second = loader.execute(result_request(CachePolicy::Enabled)).await.unwrap();

    assert_eq!(store.len().await, 1);
    assert_eq!(second.data_from, DataFrom::ResultCache);
}

#[tokio::test]
async fn test_result_policy_disabled_never_persists() {
    let store = Arc::new(MemoryStore::new());
    let loader = loader_with_result_store(store.clone());

    loader.execute(result_request(CachePolicy::Disabled)).await.unwrap();
    let second = loader.execute(result_request(CachePolicy::Disabled)).await.unwrap();

    assert!(store.is_empty().await);
    assert_ne!(second.data_from, DataFrom::ResultCache);
}

#[tokio::test]
async fn test_result_policy_read_only_serves_but_never_writes() {
    let store = Arc::new(MemoryStore::new());
    let loader = loader_with_result_store(store.clone());

    // Nothing is written on a miss
    loader.execute(result_request(CachePolicy::ReadOnly)).await.unwrap();
    assert!(store.is_empty().await);

    // An existing entry is served
    loader.execute(result_request(CachePolicy::Enabled)).await.unwrap();
    assert_eq!(store.len().await, 1);
    let served = loader.execute(result_request(CachePolicy::ReadOnly)).await.unwrap();
    assert_eq!(served.data_from, DataFrom::ResultCache);
}

#[tokio::test]
async fn test_result_policy_write_only_always_misses() {
    let store = Arc::new(MemoryStore::new());
    let loader = loader_with_result_store(store.clone());

    loader.execute(result_request(CachePolicy::WriteOnly)).await.unwrap();
    assert_eq!(store.len().await, 1);

    let second = loader.execute(result_request(CachePolicy::WriteOnly)).await.unwrap();
    assert_ne!(second.data_from, DataFrom::ResultCache);
}

#[tokio::test]
async fn test_memory_policy_read_only_does_not_populate() {
    let loader = loader_with_result_store(Arc::new(MemoryStore::new()));
    let request = Request::builder("img")
        .memory_cache_policy(CachePolicy::ReadOnly)
        .build();

    loader.execute(request).await.unwrap();
    assert!(loader.memory_cache().is_empty());
}

// =============================================================================
// Download Tier
// =============================================================================

#[tokio::test]
async fn test_download_tier_only_keeps_network_bytes() {
    let local_store = Arc::new(MemoryStore::new());
    let local = ImageLoader::builder()
        .fetcher(Arc::new(CountingFetcher::new(
            MemoryFetcher::new().with_source("img", png_bytes(16, 16)),
        )))
        .download_store(local_store.clone())
        .build();
    let result = local.execute(Request::new("img")).await.unwrap();
    assert_eq!(result.data_from, DataFrom::Memory);
    assert!(local_store.is_empty().await);

    let network_store = Arc::new(MemoryStore::new());
    let network = ImageLoader::builder()
        .fetcher(Arc::new(CountingFetcher::network("img", png_bytes(16, 16))))
        .download_store(network_store.clone())
        .build();
    network.execute(Request::new("img")).await.unwrap();
    assert_eq!(network_store.len().await, 1);
}

#[tokio::test]
async fn test_download_policy_disabled_refetches() {
    let fetcher = CountingFetcher::network("img", png_bytes(32, 32));
    let store = Arc::new(MemoryStore::new());
    let loader = ImageLoader::builder()
        .fetcher(Arc::new(fetcher.clone()))
        .download_store(store.clone())
        .build();

    for size in [8, 16] {
        let request = Request::builder("img")
            .size(size, size)
            .download_cache_policy(CachePolicy::Disabled)
            .build();
        loader.execute(request).await.unwrap();
    }

    assert_eq!(fetcher.fetch_count(), 2);
    assert!(store.is_empty().await);
}

// =============================================================================
// Memory Budget
// =============================================================================

#[test]
fn test_unreferenced_bytes_stay_within_budget() {
    let entry = image(16, 16).byte_size();
    let cache = MemoryCache::with_capacity(3 * entry);

    for i in 0..10 {
        drop(cache.insert(format!("k{}", i), image(16, 16)));
        assert!(cache.unreferenced_size() <= cache.max_size());
    }
    assert_eq!(cache.len(), 3);
    // Most recent entries survive
    assert!(cache.contains("k9"));
    assert!(!cache.contains("k0"));
}

#[test]
fn test_referenced_entries_may_exceed_budget() {
    let entry = image(16, 16).byte_size();
    let cache = MemoryCache::with_capacity(2 * entry);

    let held: Vec<_> = (0..4)
        .map(|i| cache.insert(format!("held{}", i), image(16, 16)))
        .collect();
    assert_eq!(cache.size(), 4 * entry);
    assert_eq!(cache.unreferenced_size(), 0);

    drop(held);
    assert!(cache.size() <= cache.max_size());
    assert!(cache.unreferenced_size() <= cache.max_size());
}

#[test]
fn test_handle_pins_entry_against_trim() {
    let cache = MemoryCache::with_capacity(1024 * 1024);
    let handle = cache.insert("pinned", image(8, 8));
    cache.insert("loose", image(8, 8));

    cache.trim(TrimLevel::Complete);
    assert!(cache.contains("pinned"));
    assert!(!cache.contains("loose"));
    assert_eq!(cache.ref_count("pinned"), Some(1));

    let second = handle.clone();
    assert_eq!(cache.ref_count("pinned"), Some(2));
    drop(handle);
    drop(second);
    assert_eq!(cache.ref_count("pinned"), Some(0));
}

// =============================================================================
// Buffer Pool
// =============================================================================

#[test]
fn test_pool_buffer_is_never_shared() {
    let pool = BufferPool::with_capacity(1024 * 1024);
    pool.put(PixelBuffer::new(32, 32, PixelFormat::Rgba8)).unwrap();

    let taken = pool.get(32, 32, PixelFormat::Rgba8).unwrap();
    assert!(!pool.contains(32, 32, PixelFormat::Rgba8));
    assert!(pool.get(32, 32, PixelFormat::Rgba8).is_none());

    pool.put(taken).unwrap();
    assert!(pool.get(32, 32, PixelFormat::Rgba8).is_some());
}

#[test]
fn test_pool_rejects_frozen_and_released_buffers() {
    let pool = BufferPool::with_capacity(1024 * 1024);
    assert!(pool
        .put(PixelBuffer::new(8, 8, PixelFormat::Rgba8).freeze())
        .is_err());

    let mut released = PixelBuffer::new(8, 8, PixelFormat::Rgba8);
    released.release();
    assert!(pool.put(released).is_err());
    assert!(pool.is_empty());
}

#[test]
fn test_pool_never_returns_smaller_buffer() {
    let pool = BufferPool::with_capacity(1024 * 1024);
    pool.put(PixelBuffer::new(16, 16, PixelFormat::Rgba8)).unwrap();
    assert!(pool.get(32, 32, PixelFormat::Rgba8).is_none());
    assert!(pool.get(16, 16, PixelFormat::Gray8).is_none());
}

#[test]
fn test_memory_eviction_feeds_pool() {
    let pool = Arc::new(BufferPool::with_capacity(1024 * 1024));
    let entry = image(16, 16).byte_size();
    let cache = MemoryCache::with_pool(entry, pool.clone());

    drop(cache.insert("a", image(16, 16)));
    drop(cache.insert("b", image(16, 16)));

    assert!(!cache.contains("a"));
    assert!(pool.contains(16, 16, PixelFormat::Rgba8));
}

// =============================================================================
// Persistence and Introspection
// =============================================================================

#[tokio::test]
async fn test_persistent_tiers_survive_restart() {
    let dir = std::env::temp_dir().join(format!("tessera-restart-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let config = LoaderConfig {
        cache_dir: Some(dir.clone()),
        ..LoaderConfig::default()
    };

    let first_fetcher = CountingFetcher::network("img", png_bytes(24, 24));
    let first = ImageLoader::builder()
        .config(config.clone())
        .fetcher(Arc::new(first_fetcher))
        .open()
        .await
        .unwrap();
    let original = first.execute(Request::new("img")).await.unwrap();
    drop(first);

    let second_fetcher = CountingFetcher::network("img", png_bytes(24, 24));
    let second = ImageLoader::builder()
        .config(config)
        .fetcher(Arc::new(second_fetcher.clone()))
        .open()
        .await
        .unwrap();
    let restored = second.execute(Request::new("img")).await.unwrap();

    assert_eq!(restored.data_from, DataFrom::ResultCache);
    assert_eq!(restored.buffer().data(), original.buffer().data());
    assert_eq!(second_fetcher.fetch_count(), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_trim_and_clear_report_sizes() {
    let loader = loader_with_result_store(Arc::new(MemoryStore::new()));
    loader.execute(Request::new("img")).await.unwrap();

    let stats = loader.stats().await;
    assert!(stats.memory_size > 0);
    assert!(stats.result_size > 0);
    assert!(stats.download_size > 0);

    loader.trim(TrimLevel::Complete).await;
    assert_eq!(loader.memory_cache().size(), 0);

    loader.clear().await;
    let stats = loader.stats().await;
    assert_eq!(stats.result_size, 0);
    assert_eq!(stats.download_size, 0);
    assert_eq!(loader.result_cache().size().await, 0);
}

#[tokio::test]
async fn test_store_budget_evicts_oldest() {
    let store = MemoryStore::with_capacity(10);
    store.put("a", bytes::Bytes::from_static(b"12345")).await.unwrap();
    store.put("b", bytes::Bytes::from_static(b"12345")).await.unwrap();
    store.put("c", bytes::Bytes::from_static(b"12345")).await.unwrap();

    assert!(store.size().await <= store.max_size());
    assert!(!store.exists("a").await.unwrap());
    assert!(store.exists("c").await.unwrap());
}
