//! Decoder backed by the `image` crate.
//!
//! # Design Decisions
//!
//! - **RGBA output**: every decode is converted to [`PixelFormat::Rgba8`] so
//!   buffers from different sources share pool buckets.
//!
//! - **Subsampling by resize**: `sample_size` is applied with a triangle filter
//!   after decoding. The output is deterministic for identical input.
//!
//! - **Region decoder holds the full raster**: opening decodes the whole image
//!   once, which is why region decoders are pooled by the tile system.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{ImageFormat, ImageReader, RgbaImage};

use super::{
    check_decoded_size, sampled_len, Allocator, DecodedImage, ImageDecoder, ImageInfo,
    PixelBuffer, PixelFormat, Rect, RegionDecoder,
};
use crate::error::DecodeError;

/// [`ImageDecoder`] for the formats compiled into the `image` crate.
#[derive(Debug, Clone, Default)]
pub struct StandardDecoder {}

impl StandardDecoder {
    pub fn new() -> Self {
        Self {}
    }

    fn guess_format(data: &[u8]) -> Result<ImageFormat, DecodeError> {
        image::guess_format(data).map_err(|e| DecodeError::Unsupported(e.to_string()))
    }

    fn decode_rgba(data: &[u8], format: ImageFormat) -> Result<RgbaImage, DecodeError> {
        let reader = ImageReader::with_format(Cursor::new(data), format);
        let img = reader
            .decode()
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
        Ok(img.to_rgba8())
    }
}

impl ImageDecoder for StandardDecoder {
    fn probe(&self, data: &[u8]) -> Result<ImageInfo, DecodeError> {
        let format = Self::guess_format(data)?;
        let (width, height) = ImageReader::with_format(Cursor::new(data), format)
            .into_dimensions()
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
        Ok(ImageInfo::new(width, height, format.to_mime_type()))
    }

    fn decode(
        &self,
        data: &[u8],
        sample_size: u32,
        allocator: &dyn Allocator,
    ) -> Result<DecodedImage, DecodeError> {
        let format = Self::guess_format(data)?;
        let rgba = Self::decode_rgba(data, format)?;
        let info = ImageInfo::new(rgba.width(), rgba.height(), format.to_mime_type());

        let buffer = copy_sampled(&rgba, sample_size, allocator)?;
        check_decoded_size(buffer.width(), buffer.height())?;

        Ok(DecodedImage { buffer, info })
    }

    fn open_region(&self, data: Bytes) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        let format = Self::guess_format(&data)?;
        let rgba = Self::decode_rgba(&data, format)?;
        let info = ImageInfo::new(rgba.width(), rgba.height(), format.to_mime_type());
        Ok(Box::new(StandardRegionDecoder {
            raster: Arc::new(rgba),
            info,
        }))
    }
}

/// [`RegionDecoder`] over a fully decoded raster.
pub struct StandardRegionDecoder {
    raster: Arc<RgbaImage>,
    info: ImageInfo,
}

impl RegionDecoder for StandardRegionDecoder {
    fn info(&self) -> &ImageInfo {
        &self.info
    }

    fn decode_region(
        &mut self,
        rect: Rect,
        sample_size: u32,
        allocator: &dyn Allocator,
    ) -> Result<PixelBuffer, DecodeError> {
        let bounds = Rect::new(0, 0, self.info.width, self.info.height);
        if rect.is_empty() || !bounds.contains(&rect) {
            return Err(DecodeError::RegionOutOfBounds {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
            });
        }

        let region =
            imageops::crop_imm(self.raster.as_ref(), rect.x, rect.y, rect.width, rect.height)
                .to_image();
        copy_sampled(&region, sample_size, allocator)
    }
}

/// Subsample `source` and copy it into a buffer from `allocator`.
fn copy_sampled(
    source: &RgbaImage,
    sample_size: u32,
    allocator: &dyn Allocator,
) -> Result<PixelBuffer, DecodeError> {
    let width = sampled_len(source.width(), sample_size);
    let height = sampled_len(source.height(), sample_size);

    let sampled;
    let pixels = if width == source.width() && height == source.height() {
        source
    } else {
        sampled = imageops::resize(source, width, height, FilterType::Triangle);
        &sampled
    };

    let mut buffer = allocator.allocate(width, height, PixelFormat::Rgba8);
    if !buffer.matches(width, height, PixelFormat::Rgba8) || buffer.is_released() {
        return Err(DecodeError::PoolReuse {
            expected: (width, height),
            actual: (buffer.width(), buffer.height()),
        });
    }
    let actual = (buffer.width(), buffer.height());
    let target = buffer.data_mut().ok_or(DecodeError::PoolReuse {
        expected: (width, height),
        actual,
    })?;
    target.copy_from_slice(pixels.as_raw());

    Ok(buffer)
}
