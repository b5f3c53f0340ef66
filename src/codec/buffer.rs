//! Pixel buffers and the allocation seam used by decoders.

use serde::{Deserialize, Serialize};

/// Pixel layout of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel
    Rgba8,
    /// 8-bit RGB, 3 bytes per pixel
    Rgb8,
    /// 8-bit luminance, 1 byte per pixel
    Gray8,
}

impl PixelFormat {
    /// Number of bytes used by one pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }

    /// Stable name used in cache keys.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "RGBA_8888",
            PixelFormat::Rgb8 => "RGB_888",
            PixelFormat::Gray8 => "GRAY_8",
        }
    }
}

/// Number of bytes needed for a `width` x `height` buffer in `format`.
pub fn buffer_byte_size(width: u32, height: u32, format: PixelFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}

/// Length of `len` source pixels after subsampling by `sample_size`.
///
/// Rounds up so a partial trailing block still produces a pixel.
pub fn sampled_len(len: u32, sample_size: u32) -> u32 {
    let sample_size = sample_size.max(1);
    len.div_ceil(sample_size)
}

// =============================================================================
// PixelBuffer
// =============================================================================

/// A raster of decoded pixels.
///
/// A buffer is owned by exactly one holder at a time: the pool's free list, a
/// decoder writing into it, or a consumer. Moving it between those holders is
/// the only way to share it.
#[derive(Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    mutable: bool,
}

impl PixelBuffer {
    /// Allocate a zeroed, mutable buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0u8; buffer_byte_size(width, height, format)],
            mutable: true,
        }
    }

    /// Wrap existing pixel data.
    ///
    /// Returns `None` if `data` does not have exactly the expected length.
    pub fn from_raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        if data.len() != buffer_byte_size(width, height, format) {
            return None;
        }
        Some(Self {
            width,
            height,
            format,
            data,
            mutable: true,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw pixel bytes, row-major without padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel bytes, or `None` for an immutable buffer.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        if self.mutable {
            Some(&mut self.data)
        } else {
            None
        }
    }

    /// Consume the buffer and return its pixel bytes.
    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Bytes held by this buffer.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Mark the buffer immutable. Immutable buffers are never pooled.
    pub fn freeze(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Free the pixel storage while keeping the geometry.
    pub fn release(&mut self) {
        self.data = Vec::new();
    }

    /// Whether the pixel storage has been freed.
    pub fn is_released(&self) -> bool {
        self.data.len() != buffer_byte_size(self.width, self.height, self.format)
    }

    /// Whether this buffer can hold `width` x `height` pixels of `format` exactly.
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

// =============================================================================
// Rect
// =============================================================================

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge, saturating at `u32::MAX`.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge, saturating at `u32::MAX`.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Clip to `width` x `height` bounds anchored at the origin.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect::new(x, y, self.right().min(width) - x, self.bottom().min(height) - y)
    }

    /// Dimensions after subsampling by `sample_size`.
    pub fn sampled_size(&self, sample_size: u32) -> (u32, u32) {
        (
            sampled_len(self.width, sample_size),
            sampled_len(self.height, sample_size),
        )
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Source of pixel buffers for decoders.
///
/// A pure-allocation implementation is always correct; reuse is an optimization.
pub trait Allocator: Send + Sync {
    /// Hand out a buffer of exactly `width` x `height` in `format`.
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> PixelBuffer;

    /// Take back a buffer the caller no longer needs.
    fn release(&self, buffer: PixelBuffer);
}

/// Allocator that always creates fresh buffers and drops released ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> PixelBuffer {
        PixelBuffer::new(width, height, format)
    }

    fn release(&self, _buffer: PixelBuffer) {}
}
