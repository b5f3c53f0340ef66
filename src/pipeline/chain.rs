//! Interceptor traits and the chains that drive them.
//!
//! # Ordering
//!
//! Interceptors run in ascending [`sort_weight`](RequestInterceptor::sort_weight)
//! order; equal weights keep registration order. The engine appends its
//! terminal interceptor after the sorted list, so the terminal always runs
//! last and only when every interceptor before it called `proceed()`.
//!
//! # Cache Identity
//!
//! An interceptor that changes output must return a stable
//! [`key`](RequestInterceptor::key); the engine folds those keys into every
//! request's cache key. Interceptors that only observe or short-circuit must
//! return `None`, otherwise they would fragment the caches for nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use super::handle::{LoadEvent, LoadStage};
use crate::cache::{ImageData, MemoryHandle};
use crate::codec::{ImageInfo, PixelBuffer};
use crate::error::LoadError;
use crate::request::{CacheKey, Request};
use crate::source::DataFrom;

/// Weight of interceptors that do not override it.
pub const DEFAULT_SORT_WEIGHT: i32 = 0;

// =============================================================================
// Results & Context
// =============================================================================

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct ImageResult {
    /// Decoded pixels and metadata
    pub image: Arc<ImageData>,
    /// Where this delivery was served from
    pub data_from: DataFrom,
    /// Key the image is cached under
    pub cache_key: CacheKey,
    /// Pins the memory-cache entry while held
    pub memory_handle: Option<MemoryHandle>,
    /// Set when an interceptor substituted a fallback for a failed load
    pub recovered_from: Option<Arc<LoadError>>,
}

impl ImageResult {
    /// Result for an image that is not (yet) memory-cached.
    pub fn new(image: Arc<ImageData>, data_from: DataFrom, cache_key: CacheKey) -> Self {
        Self {
            image,
            data_from,
            cache_key,
            memory_handle: None,
            recovered_from: None,
        }
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.image.buffer
    }

    pub fn info(&self) -> &ImageInfo {
        &self.image.info
    }

    /// Keys of the transformations applied, in order.
    pub fn transformed(&self) -> &[String] {
        &self.image.transformed
    }
}

/// Per-execution state shared by every interceptor in both chains.
pub struct LoadContext {
    request: Arc<Request>,
    cache_key: CacheKey,
    events: Option<UnboundedSender<LoadEvent>>,
}

impl LoadContext {
    pub(crate) fn new(
        request: Arc<Request>,
        cache_key: CacheKey,
        events: Option<UnboundedSender<LoadEvent>>,
    ) -> Self {
        Self {
            request,
            cache_key,
            events,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Report progress to the handle driving this execution, if any.
    pub fn progress(&self, stage: LoadStage) {
        if let Some(events) = &self.events {
            let _ = events.send(LoadEvent::Progress { stage });
        }
    }
}

// =============================================================================
// Request-Level Chain
// =============================================================================

/// Wraps the whole fetch + decode + cache flow.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Cache identity, if this interceptor alters output.
    fn key(&self) -> Option<String> {
        None
    }

    fn sort_weight(&self) -> i32 {
        DEFAULT_SORT_WEIGHT
    }

    /// Call `chain.proceed()` to delegate, or return to short-circuit.
    async fn intercept(&self, chain: RequestChain<'_>) -> Result<ImageResult, LoadError>;
}

/// The remaining request-level interceptors of one execution.
pub struct RequestChain<'a> {
    interceptors: &'a [Arc<dyn RequestInterceptor>],
    context: &'a LoadContext,
}

impl<'a> RequestChain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn RequestInterceptor>],
        context: &'a LoadContext,
    ) -> Self {
        Self {
            interceptors,
            context,
        }
    }

    /// Execution context; outlives the chain itself.
    pub fn context(&self) -> &'a LoadContext {
        self.context
    }

    pub fn request(&self) -> &'a Request {
        self.context.request()
    }

    pub fn cache_key(&self) -> &'a CacheKey {
        self.context.cache_key()
    }

    /// Run the next interceptor.
    pub async fn proceed(self) -> Result<ImageResult, LoadError> {
        let Some((next, rest)) = self.interceptors.split_first() else {
            return Err(chain_exhausted("request"));
        };
        next.intercept(RequestChain::new(rest, self.context)).await
    }
}

// =============================================================================
// Decode-Level Chain
// =============================================================================

/// Wraps pixel decoding and post-processing.
#[async_trait]
pub trait DecodeInterceptor: Send + Sync {
    fn name(&self) -> &str;

    fn key(&self) -> Option<String> {
        None
    }

    fn sort_weight(&self) -> i32 {
        DEFAULT_SORT_WEIGHT
    }

    async fn intercept(&self, chain: DecodeChain<'_>) -> Result<ImageData, LoadError>;
}

/// The remaining decode-level interceptors of one execution.
pub struct DecodeChain<'a> {
    interceptors: &'a [Arc<dyn DecodeInterceptor>],
    context: &'a LoadContext,
}

impl<'a> DecodeChain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn DecodeInterceptor>],
        context: &'a LoadContext,
    ) -> Self {
        Self {
            interceptors,
            context,
        }
    }

    pub fn context(&self) -> &'a LoadContext {
        self.context
    }

    pub fn request(&self) -> &'a Request {
        self.context.request()
    }

    pub fn cache_key(&self) -> &'a CacheKey {
        self.context.cache_key()
    }

    pub async fn proceed(self) -> Result<ImageData, LoadError> {
        let Some((next, rest)) = self.interceptors.split_first() else {
            return Err(chain_exhausted("decode"));
        };
        next.intercept(DecodeChain::new(rest, self.context)).await
    }
}

fn chain_exhausted(chain: &str) -> LoadError {
    LoadError::Interceptor {
        name: format!("{chain} chain"),
        message: "no terminal interceptor".to_string(),
    }
}

/// Stable sort by weight; ties keep registration order.
pub(crate) fn sort_by_weight<T: ?Sized>(interceptors: &mut [Arc<T>], weight: impl Fn(&T) -> i32) {
    interceptors.sort_by_key(|interceptor| weight(interceptor));
}
