//! Built-in interceptors.
//!
//! Request chain, in order:
//!
//! ```text
//! user interceptors (weight < 90)
//! MemoryCacheInterceptor      (90)  short-circuits on a memory hit
//! EngineRequestInterceptor    (terminal) runs the decode chain
//! ```
//!
//! Decode chain, in order:
//!
//! ```text
//! user interceptors (weight < 80)
//! ResultCacheInterceptor      (80)  short-circuits on a result-cache hit
//! TransformationInterceptor   (90)  applies the request's transformations
//! EngineDecodeInterceptor     (terminal) fetch via download tier + decode
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::chain::{
    DecodeChain, DecodeInterceptor, ImageResult, RequestChain, RequestInterceptor,
};
use super::handle::LoadStage;
use super::slots::DecodeSlots;
use super::transform::Transformation;
use crate::cache::{decode_record, encode_record, CachePolicy, ImageData, MemoryCache, PersistentCache};
use crate::codec::{
    center_crop_rect, check_decoded_size, crop, decode_with_reuse, resize, Allocator,
    HeapAllocator, ImageDecoder, ImageInfo, PixelBuffer,
};
use crate::error::{DecodeError, LoadError, SourceError};
use crate::pool::BufferPool;
use crate::request::{compute_sample_size, Precision, Request, Size};
use crate::source::{DataFrom, FetchResult, Fetcher};

pub const MEMORY_CACHE_WEIGHT: i32 = 90;
pub const RESULT_CACHE_WEIGHT: i32 = 80;
pub const TRANSFORMATION_WEIGHT: i32 = 90;

/// Run a pixel operation against the pool, retrying once with a fresh
/// allocation if the reused buffer was unusable.
fn with_reuse<R>(
    pool: &BufferPool,
    op: impl Fn(&dyn Allocator) -> Result<R, DecodeError>,
) -> Result<R, DecodeError> {
    match op(pool) {
        Err(err) if err.is_pool_reuse() => {
            warn!("Reused buffer rejected ({}), retrying with a fresh buffer", err);
            op(&HeapAllocator)
        }
        other => other,
    }
}

// =============================================================================
// Memory Cache
// =============================================================================

/// Serves and populates the in-process memory tier.
pub struct MemoryCacheInterceptor {
    cache: MemoryCache,
}

impl MemoryCacheInterceptor {
    pub fn new(cache: MemoryCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RequestInterceptor for MemoryCacheInterceptor {
    fn name(&self) -> &str {
        "MemoryCache"
    }

    fn sort_weight(&self) -> i32 {
        MEMORY_CACHE_WEIGHT
    }

    async fn intercept(&self, chain: RequestChain<'_>) -> Result<ImageResult, LoadError> {
        let policy = chain.request().memory_cache_policy();
        let key = chain.cache_key();

        if policy.read_enabled() {
            if let Some(handle) = self.cache.get(key.as_str()) {
                debug!("Memory cache hit {}", key);
                return Ok(ImageResult {
                    image: handle.image().clone(),
                    data_from: DataFrom::MemoryCache,
                    cache_key: key.clone(),
                    memory_handle: Some(handle),
                    recovered_from: None,
                });
            }
            debug!("Memory cache miss {}", key);
        }

        let mut result = chain.proceed().await?;
        if policy.write_enabled() && result.recovered_from.is_none() {
            result.memory_handle = Some(self.cache.insert(key.as_str(), result.image.clone()));
        }
        Ok(result)
    }
}

// =============================================================================
// Result Cache
// =============================================================================

/// Serves and populates the persistent tier of decoded pixels.
pub struct ResultCacheInterceptor {
    cache: Arc<PersistentCache>,
}

impl ResultCacheInterceptor {
    pub fn new(cache: Arc<PersistentCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl DecodeInterceptor for ResultCacheInterceptor {
    fn name(&self) -> &str {
        "ResultCache"
    }

    fn sort_weight(&self) -> i32 {
        RESULT_CACHE_WEIGHT
    }

    async fn intercept(&self, chain: DecodeChain<'_>) -> Result<ImageData, LoadError> {
        let policy = chain.request().result_cache_policy();
        let key = chain.cache_key();

        if let Some(record) = self.cache.read(key.as_str(), policy).await {
            match decode_record(&record, DataFrom::ResultCache) {
                Ok(image) => return Ok(image),
                Err(e) => warn!("Ignoring unreadable result cache entry {}: {}", key, e),
            }
        }

        let image = chain.proceed().await?;
        if policy.write_enabled() {
            match encode_record(&image) {
                Ok(record) => {
                    self.cache.write(key.as_str(), record, policy).await;
                }
                Err(e) => warn!("Skipping result cache write for {}: {}", key, e),
            }
        }
        Ok(image)
    }
}

// =============================================================================
// Transformations
// =============================================================================

/// Applies [`Request::transformations`] to the decoded pixels.
pub struct TransformationInterceptor {
    pool: Arc<BufferPool>,
    slots: DecodeSlots,
}

impl TransformationInterceptor {
    pub fn new(pool: Arc<BufferPool>, slots: DecodeSlots) -> Self {
        Self { pool, slots }
    }
}

fn apply_transformations(
    mut buffer: PixelBuffer,
    transformations: &[Arc<dyn Transformation>],
    pool: &BufferPool,
) -> Result<(PixelBuffer, Vec<String>), DecodeError> {
    let mut applied = Vec::with_capacity(transformations.len());
    for transformation in transformations {
        let key = transformation.key();
        let output = with_reuse(pool, |allocator| transformation.transform(&buffer, allocator))
            .map_err(|e| match e {
                DecodeError::Transform { .. } => e,
                other => DecodeError::Transform {
                    key: key.clone(),
                    message: other.to_string(),
                },
            })?;
        let _ = pool.put(std::mem::replace(&mut buffer, output));
        applied.push(key);
    }
    Ok((buffer, applied))
}

#[async_trait]
impl DecodeInterceptor for TransformationInterceptor {
    fn name(&self) -> &str {
        "Transformation"
    }

    fn sort_weight(&self) -> i32 {
        TRANSFORMATION_WEIGHT
    }

    async fn intercept(&self, chain: DecodeChain<'_>) -> Result<ImageData, LoadError> {
        let context = chain.context();
        let transformations = context.request().transformations().to_vec();
        if transformations.is_empty() {
            return chain.proceed().await;
        }

        let image = chain.proceed().await?;
        context.progress(LoadStage::Transforming);

        let ImageData {
            buffer,
            info,
            mut transformed,
            data_from,
        } = image;
        let pool = self.pool.clone();
        let (buffer, applied) = self
            .slots
            .run(move || apply_transformations(buffer, &transformations, &pool))
            .await??;
        transformed.extend(applied);

        Ok(ImageData {
            buffer,
            info,
            transformed,
            data_from,
        })
    }
}

// =============================================================================
// Terminal: Fetch + Decode
// =============================================================================

/// Fetches source bytes through the download tier.
///
/// The per-key lock is held across check, fetch and write, so concurrent
/// loads of one locator fetch it once. Only bytes that came from the network
/// are persisted; local and in-memory sources are cheaper to re-read.
pub struct SourceLoader {
    fetcher: Arc<dyn Fetcher>,
    download: Arc<PersistentCache>,
}

impl SourceLoader {
    pub fn new(fetcher: Arc<dyn Fetcher>, download: Arc<PersistentCache>) -> Self {
        Self { fetcher, download }
    }

    pub async fn load(&self, request: &Request) -> Result<FetchResult, SourceError> {
        let policy = request.download_cache_policy();
        if policy == CachePolicy::Disabled {
            return self.fetch_origin(request).await;
        }

        let guard = self.download.lock(request.download_key()).await;
        if let Some(data) = self.download.read_locked(&guard, policy).await {
            debug!("Download cache hit {}", request.locator());
            return Ok(FetchResult::new(data, DataFrom::DownloadCache));
        }

        let fetched = self.fetch_origin(request).await?;
        if fetched.data_from == DataFrom::Network {
            self.download
                .write_locked(&guard, fetched.data.clone(), policy)
                .await;
        }
        Ok(fetched)
    }

    async fn fetch_origin(&self, request: &Request) -> Result<FetchResult, SourceError> {
        let fetch = self.fetcher.fetch(request.locator());
        match request.fetch_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| SourceError::Timeout(timeout))?,
            None => fetch.await,
        }
    }
}

/// Decode at the request's sample size, then fit to its precision.
fn decode_to_target(
    decoder: &dyn ImageDecoder,
    data: &[u8],
    size: Option<Size>,
    precision: Precision,
    pool: &BufferPool,
) -> Result<(PixelBuffer, ImageInfo, Vec<String>), DecodeError> {
    let probed = decoder.probe(data)?;
    let sample_size = compute_sample_size(probed.width, probed.height, size, precision);
    let decoded = decode_with_reuse(decoder, data, sample_size, pool)?;
    let mut buffer = decoded.buffer;
    let mut applied = Vec::new();

    if let Some(size) = size.filter(|_| precision != Precision::LessPixels) {
        let (width, height) = (size.width.max(1), size.height.max(1));
        if let Some(rect) = center_crop_rect(&buffer, width, height) {
            let cropped = with_reuse(pool, |allocator| crop(&buffer, rect, allocator))?;
            let _ = pool.put(std::mem::replace(&mut buffer, cropped));
        }
        if precision == Precision::Exactly && (buffer.width(), buffer.height()) != (width, height) {
            let resized = with_reuse(pool, |allocator| resize(&buffer, width, height, allocator))?;
            let _ = pool.put(std::mem::replace(&mut buffer, resized));
        }
        applied.push(format!("Resize({},{})", size, precision.as_str()));
    }

    check_decoded_size(buffer.width(), buffer.height())?;
    Ok((buffer, decoded.info, applied))
}

/// Terminal decode interceptor.
pub struct EngineDecodeInterceptor {
    source: Arc<SourceLoader>,
    decoder: Arc<dyn ImageDecoder>,
    pool: Arc<BufferPool>,
    slots: DecodeSlots,
}

impl EngineDecodeInterceptor {
    pub fn new(
        source: Arc<SourceLoader>,
        decoder: Arc<dyn ImageDecoder>,
        pool: Arc<BufferPool>,
        slots: DecodeSlots,
    ) -> Self {
        Self {
            source,
            decoder,
            pool,
            slots,
        }
    }
}

#[async_trait]
impl DecodeInterceptor for EngineDecodeInterceptor {
    fn name(&self) -> &str {
        "EngineDecode"
    }

    async fn intercept(&self, chain: DecodeChain<'_>) -> Result<ImageData, LoadError> {
        let context = chain.context();
        let request = context.request();

        context.progress(LoadStage::Fetching);
        let fetched = self.source.load(request).await?;
        context.progress(LoadStage::Fetched);

        context.progress(LoadStage::Decoding);
        let decoder = self.decoder.clone();
        let pool = self.pool.clone();
        let (size, precision) = (request.size(), request.precision());
        let data = fetched.data;
        let (buffer, info, transformed) = self
            .slots
            .run(move || decode_to_target(decoder.as_ref(), &data, size, precision, &pool))
            .await??;

        debug!(
            "Decoded {} to {}x{} from {}",
            context.cache_key(),
            buffer.width(),
            buffer.height(),
            fetched.data_from
        );
        Ok(ImageData {
            buffer,
            info,
            transformed,
            data_from: fetched.data_from,
        })
    }
}

/// Terminal request interceptor: runs the decode chain.
pub struct EngineRequestInterceptor {
    decode_chain: Vec<Arc<dyn DecodeInterceptor>>,
}

impl EngineRequestInterceptor {
    /// `decode_chain` must already be sorted and end with a terminal.
    pub fn new(decode_chain: Vec<Arc<dyn DecodeInterceptor>>) -> Self {
        Self { decode_chain }
    }
}

#[async_trait]
impl RequestInterceptor for EngineRequestInterceptor {
    fn name(&self) -> &str {
        "EngineRequest"
    }

    async fn intercept(&self, chain: RequestChain<'_>) -> Result<ImageResult, LoadError> {
        let context = chain.context();
        let image = DecodeChain::new(&self.decode_chain, context).proceed().await?;
        let data_from = image.data_from;
        Ok(ImageResult::new(
            Arc::new(image),
            data_from,
            context.cache_key().clone(),
        ))
    }
}

// =============================================================================
// Fallback
// =============================================================================

/// Substitutes a fixed image when the load fails.
///
/// The original error is kept in [`ImageResult::recovered_from`]; the fallback
/// is never written to any cache. Cancellation is passed through.
pub struct FallbackInterceptor {
    image: Arc<ImageData>,
}

impl FallbackInterceptor {
    pub fn new(image: ImageData) -> Self {
        Self {
            image: Arc::new(image),
        }
    }
}

#[async_trait]
impl RequestInterceptor for FallbackInterceptor {
    fn name(&self) -> &str {
        "Fallback"
    }

    async fn intercept(&self, chain: RequestChain<'_>) -> Result<ImageResult, LoadError> {
        let key = chain.cache_key();
        match chain.proceed().await {
            Err(LoadError::Cancelled) => Err(LoadError::Cancelled),
            Err(err) => {
                warn!("Load of {} failed, using fallback: {}", key, err);
                Ok(ImageResult {
                    image: self.image.clone(),
                    data_from: DataFrom::Memory,
                    cache_key: key.clone(),
                    memory_handle: None,
                    recovered_from: Some(Arc::new(err)),
                })
            }
            ok => ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PixelFormat;
    use crate::pipeline::{Grayscale, Rotate};

    #[test]
    fn test_apply_transformations_in_order() {
        let pool = BufferPool::with_capacity(1 << 20);
        let buffer = PixelBuffer::new(4, 2, PixelFormat::Rgba8);
        let transformations: Vec<Arc<dyn Transformation>> = vec![
            Arc::new(Rotate::degrees(90).unwrap()),
            Arc::new(Grayscale),
        ];

        let (out, applied) = apply_transformations(buffer, &transformations, &pool).unwrap();
        assert_eq!((out.width(), out.height()), (2, 4));
        assert_eq!(applied, vec!["Rotate(90)", "Grayscale"]);
        // Intermediate buffers went back to the pool
        assert!(pool.len() >= 1);
    }

    /// Decoder returning a fixed-size image regardless of sample size
    struct FixedDecoder {
        width: u32,
        height: u32,
    }

    impl ImageDecoder for FixedDecoder {
        fn probe(&self, _data: &[u8]) -> Result<ImageInfo, DecodeError> {
            Ok(ImageInfo::new(self.width, self.height, "image/test"))
        }

        fn decode(
            &self,
            _data: &[u8],
            sample_size: u32,
            allocator: &dyn Allocator,
        ) -> Result<crate::codec::DecodedImage, DecodeError> {
            let width = crate::codec::sampled_len(self.width, sample_size);
            let height = crate::codec::sampled_len(self.height, sample_size);
            Ok(crate::codec::DecodedImage {
                buffer: allocator.allocate(width, height, PixelFormat::Gray8),
                info: ImageInfo::new(self.width, self.height, "image/test"),
            })
        }

        fn open_region(
            &self,
            _data: bytes::Bytes,
        ) -> Result<Box<dyn crate::codec::RegionDecoder>, DecodeError> {
            Err(DecodeError::Unsupported("regions".into()))
        }
    }

    #[test]
    fn test_decode_to_target_precisions() {
        let pool = BufferPool::with_capacity(1 << 20);
        let decoder = FixedDecoder {
            width: 400,
            height: 200,
        };
        let target = Some(Size::new(50, 50));

        let (less, _, applied) =
            decode_to_target(&decoder, b"", target, Precision::LessPixels, &pool).unwrap();
        assert!((less.width() as u64 * less.height() as u64) <= 2500);
        assert!(applied.is_empty());

        let (same, _, _) =
            decode_to_target(&decoder, b"", target, Precision::SameAspectRatio, &pool).unwrap();
        assert_eq!(same.width(), same.height());
        assert!(same.width() >= 50);

        let (exact, info, applied) =
            decode_to_target(&decoder, b"", target, Precision::Exactly, &pool).unwrap();
        assert_eq!((exact.width(), exact.height()), (50, 50));
        assert_eq!(info.width, 400);
        assert_eq!(applied, vec!["Resize(50x50,EXACTLY)"]);
    }

    #[test]
    fn test_decode_to_target_rejects_degenerate_output() {
        let pool = BufferPool::with_capacity(1 << 20);
        let decoder = FixedDecoder {
            width: 400,
            height: 200,
        };
        let result = decode_to_target(&decoder, b"", Some(Size::new(1, 1)), Precision::Exactly, &pool);
        assert!(matches!(result, Err(DecodeError::InvalidSize { .. })));
    }
}
