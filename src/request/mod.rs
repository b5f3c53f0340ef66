//! Load requests and the keys derived from them.
//!
//! A [`Request`] is immutable once built. Two keys are derived from it:
//!
//! - [`CacheKey`]: every input that changes the decoded pixels (locator,
//!   target size, precision, transformations, cache-relevant extras and the
//!   identities of output-affecting interceptors). Equal keys imply
//!   byte-identical output, which is what lets the memory and result tiers and
//!   the in-flight deduplicator share work between requests.
//! - [`RequestKey`]: the cache key plus everything else (cache policies, fetch
//!   timeout). Used for logging and for telling apart requests that share
//!   output but not behavior.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::codec::sampled_len;
use crate::pipeline::Transformation;
use crate::source::Locator;

// =============================================================================
// Size & Precision
// =============================================================================

/// Target output dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How strictly the output must match the target [`Size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Precision {
    /// Subsample until the pixel count fits the target; aspect ratio is kept
    #[default]
    LessPixels,
    /// Center-crop to the target aspect ratio; scale only by subsampling
    SameAspectRatio,
    /// Center-crop and scale to exactly the target size
    Exactly,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::LessPixels => "LESS_PIXELS",
            Precision::SameAspectRatio => "SAME_ASPECT_RATIO",
            Precision::Exactly => "EXACTLY",
        }
    }
}

/// Largest sample size worth trying; beyond this every image is one pixel.
const MAX_SAMPLE_SIZE: u32 = 1 << 16;

/// Power-of-two subsample factor for a `width` x `height` source.
///
/// `LessPixels` picks the smallest factor whose output pixel count fits the
/// target. The cropping precisions pick the largest factor that still leaves
/// both dimensions at or above the target, so the crop and any final scale
/// never upsample.
pub fn compute_sample_size(width: u32, height: u32, target: Option<Size>, precision: Precision) -> u32 {
    let Some(target) = target else {
        return 1;
    };
    let target_width = target.width.max(1);
    let target_height = target.height.max(1);

    let mut sample_size = 1u32;
    match precision {
        Precision::LessPixels => {
            let budget = target_width as u64 * target_height as u64;
            while sample_size < MAX_SAMPLE_SIZE {
                let pixels = sampled_len(width, sample_size) as u64
                    * sampled_len(height, sample_size) as u64;
                if pixels <= budget {
                    break;
                }
                sample_size *= 2;
            }
        }
        Precision::SameAspectRatio | Precision::Exactly => {
            while sample_size < MAX_SAMPLE_SIZE {
                let next = sample_size * 2;
                if sampled_len(width, next) < target_width || sampled_len(height, next) < target_height {
                    break;
                }
                sample_size = next;
            }
        }
    }
    sample_size
}

// =============================================================================
// Extras
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExtraValue {
    value: String,
    cache_key: bool,
}

/// Free-form request parameters for interceptors.
///
/// Entries only contribute to the [`CacheKey`] when inserted with
/// [`Extras::set_keyed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extras {
    entries: BTreeMap<String, ExtraValue>,
}

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value that does not affect output.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key.into(), value.into(), false);
    }

    /// Set a value that affects output and therefore the cache key.
    pub fn set_keyed(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key.into(), value.into(), true);
    }

    fn insert(&mut self, key: String, value: String, cache_key: bool) {
        self.entries.insert(key, ExtraValue { value, cache_key });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|extra| extra.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_entries(&self) -> impl Iterator<Item = (&String, &ExtraValue)> {
        self.entries.iter().filter(|(_, extra)| extra.cache_key)
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Deterministic identity of a request's decoded output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable identity of a whole request, including cache policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Request
// =============================================================================

/// An immutable image load request.
#[derive(Clone)]
pub struct Request {
    locator: Locator,
    size: Option<Size>,
    precision: Precision,
    memory_cache: CachePolicy,
    result_cache: CachePolicy,
    download_cache: CachePolicy,
    transformations: Vec<Arc<dyn Transformation>>,
    extras: Extras,
    fetch_timeout: Option<Duration>,
}

impl Request {
    /// Request the original-size image at `locator` with every tier enabled.
    pub fn new(locator: impl Into<Locator>) -> Self {
        Self::builder(locator).build()
    }

    pub fn builder(locator: impl Into<Locator>) -> RequestBuilder {
        RequestBuilder {
            request: Request {
                locator: locator.into(),
                size: None,
                precision: Precision::default(),
                memory_cache: CachePolicy::Enabled,
                result_cache: CachePolicy::Enabled,
                download_cache: CachePolicy::Enabled,
                transformations: Vec::new(),
                extras: Extras::new(),
                fetch_timeout: None,
            },
        }
    }

    /// Builder seeded with this request's values.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            request: self.clone(),
        }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn size(&self) -> Option<Size> {
        self.size
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn memory_cache_policy(&self) -> CachePolicy {
        self.memory_cache
    }

    pub fn result_cache_policy(&self) -> CachePolicy {
        self.result_cache
    }

    pub fn download_cache_policy(&self) -> CachePolicy {
        self.download_cache
    }

    pub fn transformations(&self) -> &[Arc<dyn Transformation>] {
        &self.transformations
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout
    }

    /// Subsample factor for a source of the given dimensions.
    pub fn sample_size(&self, width: u32, height: u32) -> u32 {
        compute_sample_size(width, height, self.size, self.precision)
    }

    /// Key of the raw bytes in the download tier. Only the locator matters.
    pub fn download_key(&self) -> &str {
        self.locator.as_str()
    }

    /// Cache key without interceptor identities.
    pub fn cache_key(&self) -> CacheKey {
        self.cache_key_with(&[])
    }

    /// Cache key including the identities of output-affecting interceptors.
    pub fn cache_key_with(&self, interceptor_keys: &[String]) -> CacheKey {
        let mut params: Vec<String> = Vec::new();
        if let Some(size) = self.size {
            params.push(format!("size={}", size));
            params.push(format!("precision={}", self.precision.as_str()));
        }
        if !self.transformations.is_empty() {
            let keys: Vec<String> = self.transformations.iter().map(|t| t.key()).collect();
            params.push(format!("transformations=[{}]", keys.join(",")));
        }
        let extras: Vec<String> = self
            .extras
            .key_entries()
            .map(|(key, extra)| format!("{}:{}", key, extra.value))
            .collect();
        if !extras.is_empty() {
            params.push(format!("extras={{{}}}", extras.join(",")));
        }
        if !interceptor_keys.is_empty() {
            params.push(format!("interceptors=[{}]", interceptor_keys.join(",")));
        }

        if params.is_empty() {
            CacheKey(self.locator.to_string())
        } else {
            CacheKey(format!("{}?{}", self.locator, params.join("&")))
        }
    }

    /// Full request identity for logs.
    pub fn request_key(&self) -> RequestKey {
        let mut key = format!(
            "{} memoryCache={} resultCache={} downloadCache={}",
            self.cache_key(),
            self.memory_cache.as_str(),
            self.result_cache.as_str(),
            self.download_cache.as_str()
        );
        if let Some(timeout) = self.fetch_timeout {
            key.push_str(&format!(" timeout={}ms", timeout.as_millis()));
        }
        let plain: Vec<String> = self
            .extras
            .entries
            .iter()
            .filter(|(_, extra)| !extra.cache_key)
            .map(|(key, extra)| format!("{}:{}", key, extra.value))
            .collect();
        if !plain.is_empty() {
            key.push_str(&format!(" extras={{{}}}", plain.join(",")));
        }
        RequestKey(key)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Request").field(&self.request_key().0).finish()
    }
}

/// Builder for [`Request`].
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Target output size.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.request.size = Some(Size::new(width, height));
        self
    }

    /// Decode at the original size.
    pub fn original_size(mut self) -> Self {
        self.request.size = None;
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.request.precision = precision;
        self
    }

    pub fn memory_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request.memory_cache = policy;
        self
    }

    pub fn result_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request.result_cache = policy;
        self
    }

    pub fn download_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request.download_cache = policy;
        self
    }

    /// Append a transformation; transformations apply in insertion order.
    pub fn transformation(mut self, transformation: impl Transformation + 'static) -> Self {
        self.request.transformations.push(Arc::new(transformation));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.extras.set(key, value);
        self
    }

    /// Extra that affects output and participates in the cache key.
    pub fn keyed_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.extras.set_keyed(key, value);
        self
    }

    /// Upper bound on the fetch step. Cache and decode steps are not bounded.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.request.fetch_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

// =============================================================================
// Tests
// =============================================================================
