//! Request execution pipeline.
//!
//! This module turns a [`Request`](crate::request::Request) into decoded
//! pixels:
//!
//! - [`chain`]: interceptor traits and the request/decode chains
//! - [`interceptors`]: memory cache, result cache, transformations and the
//!   terminal fetch + decode
//! - [`dedup`]: coalescing of concurrent loads sharing a cache key
//! - [`engine`]: [`ImageLoader`], the entry point
//! - [`handle`]: [`RequestHandle`] and [`LoadEvent`] for background loads

pub mod chain;
pub mod dedup;
pub mod engine;
pub mod handle;
pub mod interceptors;
mod slots;
mod transform;

pub use chain::{
    DecodeChain, DecodeInterceptor, ImageResult, LoadContext, RequestChain, RequestInterceptor,
    DEFAULT_SORT_WEIGHT,
};
pub use dedup::InFlight;
pub use engine::{CacheStats, ImageLoader, ImageLoaderBuilder, LoaderConfig};
pub use handle::{LoadEvent, LoadStage, RequestHandle};
pub use interceptors::FallbackInterceptor;
pub use slots::{DecodeSlots, DEFAULT_DECODE_PARALLELISM, MAX_DECODE_PARALLELISM};
pub use transform::{Grayscale, Rotate, Transformation};
