//! Request pipeline integration tests.
//!
//! Tests verify:
//! - Provenance of first and repeated loads
//! - Concurrent identical requests share one execution
//! - Lifecycle events and cancellation of submitted requests
//! - Error classification (source, decode, timeout)
//! - Transformations and custom interceptors

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tessera::cache::ImageData;
use tessera::codec::{PixelBuffer, PixelFormat};
use tessera::error::{DecodeError, ErrorKind, LoadError, SourceError};
use tessera::pipeline::{
    DecodeChain, DecodeInterceptor, FallbackInterceptor, ImageLoader, LoadEvent, LoaderConfig,
};
use tessera::request::Request;
use tessera::source::{DataFrom, MemoryFetcher};
use tessera::{CachePolicy, Grayscale, ImageInfo, Rotate};

use super::test_utils::{png_bytes, rgba_at, CountingFetcher};

fn loader(fetcher: CountingFetcher) -> ImageLoader {
    ImageLoader::builder().fetcher(Arc::new(fetcher)).build()
}

// =============================================================================
// Provenance
// =============================================================================

#[tokio::test]
async fn test_first_load_from_network_then_memory_cache() {
    let fetcher = CountingFetcher::network("img-42", png_bytes(64, 48));
    let loader = loader(fetcher.clone());

    let first = loader.execute(Request::new("img-42")).await.unwrap();
    assert_eq!(first.data_from, DataFrom::Network);
    assert_eq!((first.buffer().width(), first.buffer().height()), (64, 48));

    let second = loader.execute(Request::new("img-42")).await.unwrap();
    assert_eq!(second.data_from, DataFrom::MemoryCache);
    assert_eq!(second.buffer().data(), first.buffer().data());
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_equal_cache_keys_decode_identically() {
    let data = png_bytes(80, 60);
    let request = Request::builder("photo").size(40, 30).build();

    let a = loader(CountingFetcher::network("photo", data.clone()));
    let b = loader(CountingFetcher::network("photo", data));
    assert_eq!(a.cache_key(&request), b.cache_key(&request));

    let from_a = a.execute(request.clone()).await.unwrap();
    let from_b = b.execute(request).await.unwrap();
    assert_eq!(from_a.buffer().data(), from_b.buffer().data());
}

#[tokio::test]
async fn test_other_size_reuses_downloaded_bytes() {
    let fetcher = CountingFetcher::network("photo", png_bytes(80, 60));
    let loader = loader(fetcher.clone());

    let full = loader.execute(Request::new("photo")).await.unwrap();
    let small = loader
        .execute(Request::builder("photo").size(20, 15).build())
        .await
        .unwrap();

    assert_ne!(full.cache_key, small.cache_key);
    assert_eq!(small.data_from, DataFrom::DownloadCache);
    assert!(small.buffer().width() < full.buffer().width());
    assert_eq!(fetcher.fetch_count(), 1);
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let fetcher = CountingFetcher::network("shared", png_bytes(64, 64))
        .with_delay(Duration::from_millis(50));
    let loader = loader(fetcher.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let loader = loader.clone();
        handles.push(tokio::spawn(async move {
            loader.execute(Request::new("shared")).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(results.len(), 8);
    assert_eq!(fetcher.fetch_count(), 1);
    for result in &results {
        assert_eq!(result.buffer().data(), results[0].buffer().data());
    }
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn test_different_keys_are_not_coalesced() {
    let fetcher = CountingFetcher::new(
        MemoryFetcher::new()
            .with_source("a", png_bytes(16, 16))
            .with_source("b", png_bytes(16, 16))
            .with_data_from(DataFrom::Network),
    )
    .with_delay(Duration::from_millis(30));
    let loader = loader(fetcher.clone());

    let (a, b) = tokio::join!(
        loader.execute(Request::new("a")),
        loader.execute(Request::new("b"))
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(fetcher.fetch_count(), 2);
}

// =============================================================================
// Handles and Cancellation
// =============================================================================

#[tokio::test]
async fn test_submit_reports_lifecycle() {
    let loader = loader(CountingFetcher::network("img", png_bytes(32, 32)));
    let mut handle = loader.submit(Request::new("img"));

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(LoadEvent::Started { .. })));
    assert!(matches!(events.last(), Some(LoadEvent::Success(_))));
    assert!(events
        .iter()
        .any(|event| matches!(event, LoadEvent::Progress { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_cancel_one_handle_keeps_shared_load() {
    let fetcher = CountingFetcher::network("slow", png_bytes(32, 32))
        .with_delay(Duration::from_millis(150));
    let loader = loader(fetcher.clone());

    let cancelled = loader.submit(Request::new("slow"));
    let kept = loader.submit(Request::new("slow"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    cancelled.cancel();
    assert!(matches!(cancelled.result().await, Err(LoadError::Cancelled)));

    let result = kept.result().await.unwrap();
    assert_eq!(result.data_from, DataFrom::Network);
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test]
async fn test_cancel_last_handle_stops_load() {
    let fetcher = CountingFetcher::network("slow", png_bytes(32, 32))
        .with_delay(Duration::from_millis(150));
    let loader = loader(fetcher.clone());

    let handle = loader.submit(Request::new("slow"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();
    assert!(matches!(handle.result().await, Err(LoadError::Cancelled)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(loader.in_flight(), 0);
    assert!(loader.memory_cache().is_empty());
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_missing_source_is_source_error() {
    let loader = loader(CountingFetcher::new(MemoryFetcher::new()));
    let err = loader.execute(Request::new("nowhere")).await.unwrap_err();
    assert!(matches!(err, LoadError::Source(SourceError::NotFound(_))));
    assert_eq!(err.kind(), ErrorKind::Source);
}

#[tokio::test]
async fn test_corrupt_bytes_is_decode_error() {
    let fetcher = CountingFetcher::new(
        MemoryFetcher::new().with_source("junk", b"definitely not an image".to_vec()),
    );
    let loader = loader(fetcher);
    let err = loader.execute(Request::new("junk")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn test_one_pixel_image_is_decode_error() {
    let fetcher =
        CountingFetcher::new(MemoryFetcher::new().with_source("dot", png_bytes(1, 1)));
    let loader = loader(fetcher);
    let err = loader.execute(Request::new("dot")).await.unwrap_err();
    assert!(matches!(
        err,
        LoadError::Decode(DecodeError::InvalidSize { .. })
    ));
}

#[tokio::test]
async fn test_fetch_timeout() {
    let fetcher = CountingFetcher::network("slow", png_bytes(16, 16))
        .with_delay(Duration::from_millis(500));
    let loader = loader(fetcher);

    let request = Request::builder("slow")
        .fetch_timeout(Duration::from_millis(50))
        .build();
    let err = loader.execute(request).await.unwrap_err();
    assert!(matches!(err, LoadError::Source(SourceError::Timeout(_))));
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let fetcher = CountingFetcher::new(MemoryFetcher::new());
    let loader = loader(fetcher.clone());

    assert!(loader.execute(Request::new("gone")).await.is_err());
    assert!(loader.execute(Request::new("gone")).await.is_err());
    assert_eq!(fetcher.fetch_count(), 2);
}

// =============================================================================
// Transformations and Interceptors
// =============================================================================

#[tokio::test]
async fn test_transformations_are_applied_and_recorded() {
    let loader = loader(CountingFetcher::network("img", png_bytes(64, 48)));
    let request = Request::builder("img")
        .transformation(Rotate::degrees(90).unwrap())
        .transformation(Grayscale)
        .build();

    let result = loader.execute(request).await.unwrap();
    assert_eq!((result.buffer().width(), result.buffer().height()), (48, 64));
    assert_eq!(result.transformed(), &["Rotate(90)", "Grayscale"]);

    let [r, g, b, _] = rgba_at(result.buffer(), 10, 20);
    assert_eq!(r, g);
    assert_eq!(g, b);
}

#[tokio::test]
async fn test_transformed_and_plain_are_separate_entries() {
    let loader = loader(CountingFetcher::network("img", png_bytes(32, 32)));
    let plain = Request::new("img");
    let gray = Request::builder("img").transformation(Grayscale).build();
    assert_ne!(loader.cache_key(&plain), loader.cache_key(&gray));

    loader.execute(plain).await.unwrap();
    let result = loader.execute(gray).await.unwrap();
    assert_ne!(result.data_from, DataFrom::MemoryCache);
    assert_eq!(loader.memory_cache().len(), 2);
}

/// Inverts colour channels after decoding.
struct Invert;

#[async_trait]
impl DecodeInterceptor for Invert {
    fn name(&self) -> &str {
        "Invert"
    }

    fn key(&self) -> Option<String> {
        Some("Invert".to_string())
    }

    async fn intercept(&self, chain: DecodeChain<'_>) -> Result<ImageData, LoadError> {
        let image = chain.proceed().await?;
        let pixels: Vec<u8> = image
            .buffer
            .data()
            .chunks(4)
            .flat_map(|px| [255 - px[0], 255 - px[1], 255 - px[2], px[3]])
            .collect();
        let buffer = PixelBuffer::from_raw(
            image.buffer.width(),
            image.buffer.height(),
            PixelFormat::Rgba8,
            pixels,
        )
        .ok_or_else(|| LoadError::Interceptor {
            name: "Invert".to_string(),
            message: "buffer size mismatch".to_string(),
        })?;
        Ok(ImageData { buffer, ..image })
    }
}

#[tokio::test]
async fn test_custom_interceptor_contributes_to_cache_key() {
    let fetcher = CountingFetcher::network("img", png_bytes(16, 16));
    let plain = loader(fetcher.clone());
    let inverted = ImageLoader::builder()
        .fetcher(Arc::new(fetcher))
        .decode_interceptor(Arc::new(Invert))
        .build();

    let request = Request::new("img");
    assert!(inverted.cache_key(&request).as_str().contains("Invert"));
    assert_ne!(plain.cache_key(&request), inverted.cache_key(&request));

    let a = plain.execute(request.clone()).await.unwrap();
    let b = inverted.execute(request).await.unwrap();
    let [r, ..] = rgba_at(a.buffer(), 3, 0);
    let [ri, ..] = rgba_at(b.buffer(), 3, 0);
    assert_eq!(ri, 255 - r);
}

#[tokio::test]
async fn test_fallback_replaces_failure_and_is_not_cached() {
    let fallback = ImageData {
        buffer: PixelBuffer::new(2, 2, PixelFormat::Rgba8),
        info: ImageInfo::new(2, 2, "image/x-placeholder"),
        transformed: Vec::new(),
        data_from: DataFrom::Memory,
    };
    let loader = ImageLoader::builder()
        .config(LoaderConfig::default())
        .fetcher(Arc::new(CountingFetcher::new(MemoryFetcher::new())))
        .request_interceptor(Arc::new(FallbackInterceptor::new(fallback)))
        .build();

    let result = loader.execute(Request::new("missing")).await.unwrap();
    assert_eq!(result.info().mime_type, "image/x-placeholder");
    let cause = result.recovered_from.as_deref().unwrap();
    assert_eq!(cause.kind(), ErrorKind::Source);
    assert!(loader.memory_cache().is_empty());
}

#[tokio::test]
async fn test_memory_policy_disabled_skips_memory_tier() {
    let fetcher = CountingFetcher::network("img", png_bytes(16, 16));
    let loader = loader(fetcher);
    let request = Request::builder("img")
        .memory_cache_policy(CachePolicy::Disabled)
        .build();

    loader.execute(request.clone()).await.unwrap();
    let second = loader.execute(request).await.unwrap();
    assert!(loader.memory_cache().is_empty());
    assert_eq!(second.data_from, DataFrom::ResultCache);
}
