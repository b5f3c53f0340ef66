//! Test utilities for integration tests.
//!
//! This module provides counting and slow mock fetchers, a mock region
//! decoder for tile tests, and helpers for encoding test images.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

use tessera::codec::{
    Allocator, DecodedImage, ImageDecoder, ImageInfo, PixelBuffer, PixelFormat, Rect,
    RegionDecoder,
};
use tessera::error::{DecodeError, SourceError};
use tessera::source::{DataFrom, FetchResult, Fetcher, Locator, MemoryFetcher};

// =============================================================================
// Test Images
// =============================================================================

/// Colour of source pixel (x, y) in images from [`png_bytes`].
pub fn pixel_at(x: u32, y: u32) -> [u8; 4] {
    [
        (x % 251) as u8,
        (y % 241) as u8,
        ((x / 251 + y / 241) % 256) as u8,
        255,
    ]
}

/// Encode a `width` x `height` PNG whose pixels follow [`pixel_at`].
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| Rgba(pixel_at(x, y)));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .expect("PNG encoding should succeed");
    out.into_inner()
}

/// Read the RGBA pixel at (x, y) of an `Rgba8` buffer.
pub fn rgba_at(buffer: &PixelBuffer, x: u32, y: u32) -> [u8; 4] {
    assert_eq!(buffer.format(), PixelFormat::Rgba8);
    let offset = ((y * buffer.width() + x) * 4) as usize;
    let mut pixel = [0u8; 4];
    pixel.copy_from_slice(&buffer.data()[offset..offset + 4]);
    pixel
}

// =============================================================================
// Counting Fetcher
// =============================================================================

/// A fetcher that counts calls and can be made slow.
///
/// Clones share the counter.
#[derive(Clone)]
pub struct CountingFetcher {
    inner: MemoryFetcher,
    delay: Duration,
    fetches: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn new(inner: MemoryFetcher) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Single network-backed source.
    pub fn network(locator: &str, data: Vec<u8>) -> Self {
        Self::new(
            MemoryFetcher::new()
                .with_source(locator, data)
                .with_data_from(DataFrom::Network),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<FetchResult, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch(locator).await
    }
}

// =============================================================================
// Mock Region Decoder
// =============================================================================

/// An image decoder that only supports region decoding.
///
/// Every region decode sleeps for `delay` (on the blocking pool) and records
/// the source rectangle it was asked for. Pixels are filled with the low byte
/// of the rectangle's x coordinate.
#[derive(Clone)]
pub struct SlowRegionDecoder {
    width: u32,
    height: u32,
    delay: Duration,
    regions: Arc<Mutex<Vec<Rect>>>,
}

impl SlowRegionDecoder {
    pub fn new(width: u32, height: u32, delay: Duration) -> Self {
        Self {
            width,
            height,
            delay,
            regions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn decode_count(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn regions(&self) -> Vec<Rect> {
        self.regions.lock().clone()
    }
}

struct SlowRegion {
    info: ImageInfo,
    delay: Duration,
    regions: Arc<Mutex<Vec<Rect>>>,
}

impl RegionDecoder for SlowRegion {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn decode_region(
        &mut self,
        rect: Rect,
        sample_size: u32,
        allocator: &dyn Allocator,
    ) -> Result<PixelBuffer, DecodeError> {
        std::thread::sleep(self.delay);
        self.regions.lock().push(rect);

        let (width, height) = rect.sampled_size(sample_size);
        let mut buffer = allocator.allocate(width, height, PixelFormat::Rgba8);
        if let Some(data) = buffer.data_mut() {
            data.fill(rect.x as u8);
        }
        Ok(buffer)
    }
}

impl ImageDecoder for SlowRegionDecoder {
    fn probe(&self, _data: &[u8]) -> Result<ImageInfo, DecodeError> {
        Ok(ImageInfo::new(self.width, self.height, "image/x-mock"))
    }

    fn decode(
        &self,
        _data: &[u8],
        _sample_size: u32,
        _allocator: &dyn Allocator,
    ) -> Result<DecodedImage, DecodeError> {
        Err(DecodeError::Unsupported("mock decoder is region-only".into()))
    }

    fn open_region(&self, _data: Bytes) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        Ok(Box::new(SlowRegion {
            info: ImageInfo::new(self.width, self.height, "image/x-mock"),
            delay: self.delay,
            regions: self.regions.clone(),
        }))
    }
}
