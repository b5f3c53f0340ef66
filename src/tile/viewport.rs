use serde::Serialize;

use crate::codec::Rect;

/// The part of an image currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    /// Visible area in full-resolution display coordinates
    pub visible: Rect,
    /// Displayed pixels per image pixel
    pub scale: f32,
}

impl Viewport {
    pub fn new(visible: Rect, scale: f32) -> Self {
        Self { visible, scale }
    }

    /// Whole image fitted inside a `view_width` x `view_height` area.
    pub fn fit(width: u32, height: u32, view_width: u32, view_height: u32) -> Self {
        let scale = if width == 0 || height == 0 {
            1.0
        } else {
            (view_width as f32 / width as f32).min(view_height as f32 / height as f32)
        };
        Self {
            visible: Rect::new(0, 0, width, height),
            scale,
        }
    }
}
