//! Pixel operations shared by transformations and the tile decoder.
//!
//! Every operation reads one buffer and writes a new one obtained from an
//! [`Allocator`]; the input is left untouched so the caller decides whether it
//! goes back to the pool.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};
use serde::{Deserialize, Serialize};

use super::{Allocator, PixelBuffer, PixelFormat, Rect};
use crate::error::DecodeError;

// =============================================================================
// Orientation
// =============================================================================

/// Clockwise rotation from source orientation to display orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Parse a clockwise angle. Only multiples of 90 are accepted.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Orientation::Deg0),
            90 => Some(Orientation::Deg90),
            180 => Some(Orientation::Deg180),
            270 => Some(Orientation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 90,
            Orientation::Deg180 => 180,
            Orientation::Deg270 => 270,
        }
    }

    /// Whether width and height swap between source and display.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Orientation::Deg90 | Orientation::Deg270)
    }

    /// Display dimensions of a `width` x `height` source.
    pub fn display_size(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Map a rectangle in display coordinates back to the source rectangle
    /// that produces it, for a source of `width` x `height`.
    ///
    /// Decoding the returned rectangle and passing the pixels through
    /// [`rotate`] with the same orientation yields `rect` as displayed.
    pub fn display_to_source(self, rect: Rect, width: u32, height: u32) -> Rect {
        match self {
            Orientation::Deg0 => rect,
            Orientation::Deg90 => Rect::new(
                rect.y,
                height.saturating_sub(rect.right()),
                rect.height,
                rect.width,
            ),
            Orientation::Deg180 => Rect::new(
                width.saturating_sub(rect.right()),
                height.saturating_sub(rect.bottom()),
                rect.width,
                rect.height,
            ),
            Orientation::Deg270 => Rect::new(
                width.saturating_sub(rect.bottom()),
                rect.x,
                rect.height,
                rect.width,
            ),
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Allocate an output buffer and verify it can be written as requested.
pub(crate) fn allocate_checked(
    allocator: &dyn Allocator,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<PixelBuffer, DecodeError> {
    let buffer = allocator.allocate(width, height, format);
    if !buffer.matches(width, height, format) || buffer.is_released() || !buffer.is_mutable() {
        return Err(DecodeError::PoolReuse {
            expected: (width, height),
            actual: (buffer.width(), buffer.height()),
        });
    }
    Ok(buffer)
}

/// Reject a source buffer whose storage was already handed back.
fn check_source(buffer: &PixelBuffer) -> Result<(), DecodeError> {
    if buffer.is_released() {
        return Err(DecodeError::PoolReuse {
            expected: (buffer.width(), buffer.height()),
            actual: (0, 0),
        });
    }
    Ok(())
}

fn write_into(mut out: PixelBuffer, pixels: &[u8]) -> Result<PixelBuffer, DecodeError> {
    let expected = (out.width(), out.height());
    let target = out.data_mut().ok_or(DecodeError::PoolReuse {
        expected,
        actual: expected,
    })?;
    target.copy_from_slice(pixels);
    Ok(out)
}

/// Rotate clockwise by `orientation`.
pub fn rotate(
    buffer: &PixelBuffer,
    orientation: Orientation,
    allocator: &dyn Allocator,
) -> Result<PixelBuffer, DecodeError> {
    check_source(buffer)?;
    let (w, h) = (buffer.width() as usize, buffer.height() as usize);
    let (out_w, out_h) = orientation.display_size(buffer.width(), buffer.height());
    let bpp = buffer.format().bytes_per_pixel();
    let src = buffer.data();

    let mut out = allocate_checked(allocator, out_w, out_h, buffer.format())?;
    let expected = (out_w, out_h);
    let dst = out.data_mut().ok_or(DecodeError::PoolReuse {
        expected,
        actual: expected,
    })?;

    let out_w = out_w as usize;
    for oy in 0..out_h as usize {
        for ox in 0..out_w {
            let (sx, sy) = match orientation {
                Orientation::Deg0 => (ox, oy),
                Orientation::Deg90 => (oy, h - 1 - ox),
                Orientation::Deg180 => (w - 1 - ox, h - 1 - oy),
                Orientation::Deg270 => (w - 1 - oy, ox),
            };
            let s = (sy * w + sx) * bpp;
            let d = (oy * out_w + ox) * bpp;
            dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
        }
    }

    Ok(out)
}

/// Convert colour pixels to luminance, keeping the pixel format.
pub fn grayscale(buffer: &PixelBuffer, allocator: &dyn Allocator) -> Result<PixelBuffer, DecodeError> {
    check_source(buffer)?;
    let format = buffer.format();
    let mut out = allocate_checked(allocator, buffer.width(), buffer.height(), format)?;
    let expected = (buffer.width(), buffer.height());
    let dst = out.data_mut().ok_or(DecodeError::PoolReuse {
        expected,
        actual: expected,
    })?;

    let bpp = format.bytes_per_pixel();
    for (src, dst) in buffer.data().chunks_exact(bpp).zip(dst.chunks_exact_mut(bpp)) {
        match format {
            PixelFormat::Gray8 => dst[0] = src[0],
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => {
                // ITU-R BT.601 luma, integer weights summing to 1000
                let luma = (299 * src[0] as u32 + 587 * src[1] as u32 + 114 * src[2] as u32) / 1000;
                let luma = luma as u8;
                dst[0] = luma;
                dst[1] = luma;
                dst[2] = luma;
                if format == PixelFormat::Rgba8 {
                    dst[3] = src[3];
                }
            }
        }
    }

    Ok(out)
}

/// Copy out `rect`, which must lie inside the buffer.
pub fn crop(buffer: &PixelBuffer, rect: Rect, allocator: &dyn Allocator) -> Result<PixelBuffer, DecodeError> {
    check_source(buffer)?;
    let bounds = Rect::new(0, 0, buffer.width(), buffer.height());
    if rect.is_empty() || !bounds.contains(&rect) {
        return Err(DecodeError::RegionOutOfBounds {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        });
    }

    let bpp = buffer.format().bytes_per_pixel();
    let row_len = rect.width as usize * bpp;
    let stride = buffer.width() as usize * bpp;
    let mut pixels = Vec::with_capacity(row_len * rect.height as usize);
    for y in rect.y..rect.bottom() {
        let start = y as usize * stride + rect.x as usize * bpp;
        pixels.extend_from_slice(&buffer.data()[start..start + row_len]);
    }

    let out = allocate_checked(allocator, rect.width, rect.height, buffer.format())?;
    write_into(out, &pixels)
}

/// Centered crop to the aspect ratio of `width` x `height`.
///
/// Returns `None` when the buffer already has that aspect ratio.
pub fn center_crop_rect(buffer: &PixelBuffer, width: u32, height: u32) -> Option<Rect> {
    let (bw, bh) = (buffer.width() as u64, buffer.height() as u64);
    let (tw, th) = (width.max(1) as u64, height.max(1) as u64);

    // Compare bw/bh with tw/th without floats
    let (cw, ch) = if bw * th > tw * bh {
        ((bh * tw / th).max(1), bh)
    } else {
        (bw, (bw * th / tw).max(1))
    };
    if cw == bw && ch == bh {
        return None;
    }
    let x = (bw - cw) / 2;
    let y = (bh - ch) / 2;
    Some(Rect::new(x as u32, y as u32, cw as u32, ch as u32))
}

fn resize_typed<P>(
    buffer: &PixelBuffer,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, DecodeError>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let source: ImageBuffer<P, &[u8]> =
        ImageBuffer::from_raw(buffer.width(), buffer.height(), buffer.data()).ok_or_else(|| {
            DecodeError::Corrupt("pixel buffer does not match its geometry".to_string())
        })?;
    Ok(imageops::resize(&source, width, height, FilterType::Triangle).into_raw())
}

/// Scale to exactly `width` x `height`.
pub fn resize(
    buffer: &PixelBuffer,
    width: u32,
    height: u32,
    allocator: &dyn Allocator,
) -> Result<PixelBuffer, DecodeError> {
    let pixels = match buffer.format() {
        PixelFormat::Rgba8 => resize_typed::<Rgba<u8>>(buffer, width, height)?,
        PixelFormat::Rgb8 => resize_typed::<Rgb<u8>>(buffer, width, height)?,
        PixelFormat::Gray8 => resize_typed::<Luma<u8>>(buffer, width, height)?,
    };
    let out = allocate_checked(allocator, width, height, buffer.format())?;
    write_into(out, &pixels)
}
