//! Decoder capability.
//!
//! Format-specific byte parsing lives behind [`ImageDecoder`] and
//! [`RegionDecoder`]. The engine only needs three things from a codec:
//! cheap header probing, a full decode at a subsample factor, and a stateful
//! region decoder for the tile pyramid.
//!
//! Every decode writes into a buffer obtained from an [`Allocator`]. When the
//! allocator is a [`crate::pool::BufferPool`] the buffer may be reused; if the
//! codec reports [`DecodeError::PoolReuse`] the helpers in this module retry
//! once with a [`HeapAllocator`].

mod buffer;
mod ops;
mod standard;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DecodeError;

pub use buffer::{
    buffer_byte_size, sampled_len, Allocator, HeapAllocator, PixelBuffer, PixelFormat, Rect,
};
pub use ops::{center_crop_rect, crop, grayscale, resize, rotate, Orientation};
pub use standard::{StandardDecoder, StandardRegionDecoder};

/// Header-level facts about a source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Source width in pixels
    pub width: u32,
    /// Source height in pixels
    pub height: u32,
    /// MIME type reported by the codec
    pub mime_type: String,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32, mime_type: impl Into<String>) -> Self {
        Self {
            width,
            height,
            mime_type: mime_type.into(),
        }
    }
}

/// Output of a full-image decode.
#[derive(Debug)]
pub struct DecodedImage {
    /// Decoded pixels, possibly subsampled
    pub buffer: PixelBuffer,
    /// Facts about the source the pixels came from
    pub info: ImageInfo,
}

/// Full-image decoding capability.
pub trait ImageDecoder: Send + Sync {
    /// Read dimensions and MIME type without decoding pixels.
    fn probe(&self, data: &[u8]) -> Result<ImageInfo, DecodeError>;

    /// Decode the whole image, subsampled by `sample_size` in both axes.
    fn decode(
        &self,
        data: &[u8],
        sample_size: u32,
        allocator: &dyn Allocator,
    ) -> Result<DecodedImage, DecodeError>;

    /// Open a stateful region decoder over `data`.
    ///
    /// Opening may be expensive; callers pool the result.
    fn open_region(&self, data: Bytes) -> Result<Box<dyn RegionDecoder>, DecodeError>;
}

/// Stateful decoder for rectangles of one source image.
///
/// Not safe for concurrent use; each instance is borrowed by one job at a time.
pub trait RegionDecoder: Send {
    fn info(&self) -> &ImageInfo;

    /// Decode exactly `rect` (source coordinates) subsampled by `sample_size`.
    fn decode_region(
        &mut self,
        rect: Rect,
        sample_size: u32,
        allocator: &dyn Allocator,
    ) -> Result<PixelBuffer, DecodeError>;
}

/// Reject degenerate decode output.
pub fn check_decoded_size(width: u32, height: u32) -> Result<(), DecodeError> {
    if width <= 1 || height <= 1 {
        return Err(DecodeError::InvalidSize { width, height });
    }
    Ok(())
}

/// Full decode into a possibly reused buffer, retrying once without reuse.
pub fn decode_with_reuse(
    decoder: &dyn ImageDecoder,
    data: &[u8],
    sample_size: u32,
    allocator: &dyn Allocator,
) -> Result<DecodedImage, DecodeError> {
    match decoder.decode(data, sample_size, allocator) {
        Err(err) if err.is_pool_reuse() => {
            warn!("Decode into reused buffer failed ({}), retrying with a fresh buffer", err);
            decoder.decode(data, sample_size, &HeapAllocator)
        }
        other => other,
    }
}

/// Region decode into a possibly reused buffer, retrying once without reuse.
pub fn decode_region_with_reuse(
    decoder: &mut dyn RegionDecoder,
    rect: Rect,
    sample_size: u32,
    allocator: &dyn Allocator,
) -> Result<PixelBuffer, DecodeError> {
    match decoder.decode_region(rect, sample_size, allocator) {
        Err(err) if err.is_pool_reuse() => {
            warn!(
                "Region decode into reused buffer failed ({}), retrying with a fresh buffer",
                err
            );
            decoder.decode_region(rect, sample_size, &HeapAllocator)
        }
        other => other,
    }
}
