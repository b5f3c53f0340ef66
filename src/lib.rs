//! # Tessera
//!
//! An image-loading engine: requests flow through an interceptor pipeline,
//! concurrent identical requests share one execution, decoded pixels are
//! cached in three tiers, pixel buffers are recycled through a pool, and very
//! large images are decoded progressively through a tile pyramid.
//!
//! ## Features
//!
//! - **Interceptor pipeline**: pluggable request- and decode-level interceptors
//!   with stable cache-key contributions
//! - **In-flight deduplication**: N concurrent loads of one cache key run once
//! - **Tiered caching**: a reference-counted memory cache, a persistent result
//!   cache of decoded pixels and a persistent download cache of source bytes
//! - **Buffer pooling**: decoded rasters are reused instead of reallocated
//! - **Tile pyramids**: viewport-driven region decoding with stale-result
//!   discarding
//!
//! ## Architecture
//!
//! - [`source`] - locators, fetchers and provenance
//! - [`codec`] - pixel buffers and the decoder capability
//! - [`pool`] - the pixel buffer pool
//! - [`cache`] - memory, result and download tiers
//! - [`request`] - requests, options and cache keys
//! - [`pipeline`] - interceptors, deduplication and the [`ImageLoader`]
//! - [`tile`] - tile pyramids and the [`TileManager`]
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use tessera::{ImageLoader, LoaderConfig, Request};
//!
//! #[tokio::main]
//! async fn main() {
//!     let loader = ImageLoader::new(LoaderConfig::default());
//!     let request = Request::builder("/data/photo.jpg").size(512, 512).build();
//!
//!     match loader.execute(request).await {
//!         Ok(result) => println!("{:?} from {}", result.info(), result.data_from),
//!         Err(e) => eprintln!("load failed: {}", e),
//!     }
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod request;
pub mod source;
pub mod tile;

// Re-export commonly used types
pub use cache::{
    CachePolicy, DiskStore, ImageData, MemoryCache, MemoryHandle, MemoryStore, PersistentCache,
    TrimLevel,
};
pub use codec::{
    Allocator, HeapAllocator, ImageDecoder, ImageInfo, Orientation, PixelBuffer, PixelFormat,
    Rect, RegionDecoder, StandardDecoder,
};
pub use config::{Cli, Command, Config};
pub use error::{DecodeError, ErrorKind, LoadError, SourceError, StoreError, TileError};
pub use pipeline::{
    CacheStats, DecodeInterceptor, Grayscale, ImageLoader, ImageLoaderBuilder, ImageResult,
    LoadEvent, LoadStage, LoaderConfig, RequestHandle, RequestInterceptor, Rotate,
    Transformation,
};
pub use pool::{BufferPool, PoolStats};
pub use request::{CacheKey, Precision, Request, RequestBuilder, Size};
pub use source::{DataFrom, FetchResult, Fetcher, FileFetcher, Locator, MemoryFetcher};
pub use tile::{
    TileConfig, TileEvent, TileId, TileManager, TilePyramid, TileState, TileStatus, Viewport,
};
