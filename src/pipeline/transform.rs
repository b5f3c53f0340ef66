//! Pixel transformations applied after decoding.
//!
//! A transformation's [`Transformation::key`] is part of the cache key, so two
//! transformations with the same key must produce identical pixels.

use std::fmt;

use crate::codec::{self, Allocator, Orientation, PixelBuffer};
use crate::error::DecodeError;

/// A deterministic pixel-to-pixel operation.
pub trait Transformation: Send + Sync + fmt::Debug {
    /// Stable identity, e.g. `Rotate(90)`.
    fn key(&self) -> String;

    /// Produce the transformed pixels. The input is returned to the allocator
    /// by the caller.
    fn transform(
        &self,
        buffer: &PixelBuffer,
        allocator: &dyn Allocator,
    ) -> Result<PixelBuffer, DecodeError>;
}

/// Clockwise rotation by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotate {
    orientation: Orientation,
}

impl Rotate {
    pub fn new(orientation: Orientation) -> Self {
        Self { orientation }
    }

    /// Rotation by `degrees`, or `None` if not a multiple of 90.
    pub fn degrees(degrees: u32) -> Option<Self> {
        Orientation::from_degrees(degrees).map(Self::new)
    }
}

impl Transformation for Rotate {
    fn key(&self) -> String {
        format!("Rotate({})", self.orientation.degrees())
    }

    fn transform(
        &self,
        buffer: &PixelBuffer,
        allocator: &dyn Allocator,
    ) -> Result<PixelBuffer, DecodeError> {
        codec::rotate(buffer, self.orientation, allocator)
    }
}

/// Luminance conversion that keeps the pixel format and alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Grayscale;

impl Transformation for Grayscale {
    fn key(&self) -> String {
        "Grayscale".to_string()
    }

    fn transform(
        &self,
        buffer: &PixelBuffer,
        allocator: &dyn Allocator,
    ) -> Result<PixelBuffer, DecodeError> {
        codec::grayscale(buffer, allocator)
    }
}
