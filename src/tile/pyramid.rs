//! Tile pyramid geometry.
//!
//! Level 0 is the full-resolution level (sample size 1). Each following level
//! doubles the sample size and halves the number of decoded pixels per axis.
//! A level is split into the smallest grid of tiles whose *sampled* size fits
//! the maximum single-decode dimensions. The pyramid ends at the first level
//! covered by a single tile: the overview.
//!
//! All rectangles here are in display coordinates, after orientation has been
//! applied. Mapping back to source coordinates happens at decode time.

use serde::Serialize;

use crate::codec::Rect;

use super::viewport::Viewport;

/// Upper bound on pyramid depth; `1 << 31` is the largest u32 power of two.
const MAX_LEVELS: usize = 32;

// =============================================================================
// Identifiers
// =============================================================================

/// Address of one tile in the pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TileId {
    /// Pyramid level (0 = full resolution)
    pub level: usize,
    /// Column within the level grid
    pub col: u32,
    /// Row within the level grid
    pub row: u32,
}

impl TileId {
    pub fn new(level: usize, col: u32, row: u32) -> Self {
        Self { level, col, row }
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}/{},{}", self.level, self.col, self.row)
    }
}

/// Geometry of a single tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tile {
    pub id: TileId,
    /// Covered area in full-resolution display coordinates
    pub rect: Rect,
    /// Subsampling applied when decoding this tile
    pub sample_size: u32,
}

impl Tile {
    /// Dimensions of the decoded tile.
    pub fn decoded_size(&self) -> (u32, u32) {
        self.rect.sampled_size(self.sample_size)
    }
}

// =============================================================================
// Levels
// =============================================================================

/// One resolution level of the pyramid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidLevel {
    pub index: usize,
    pub sample_size: u32,
    pub columns: u32,
    pub rows: u32,
    /// Width of every tile except possibly the last column
    pub tile_width: u32,
    /// Height of every tile except possibly the last row
    pub tile_height: u32,
}

impl PyramidLevel {
    pub fn tile_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    fn tile_rect(&self, col: u32, row: u32, width: u32, height: u32) -> Rect {
        let x = col * self.tile_width;
        let y = row * self.tile_height;
        Rect::new(
            x,
            y,
            self.tile_width.min(width - x),
            self.tile_height.min(height - y),
        )
    }
}

// =============================================================================
// Pyramid
// =============================================================================

/// Multi-resolution tiling of one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilePyramid {
    width: u32,
    height: u32,
    max_tile_width: u32,
    max_tile_height: u32,
    levels: Vec<PyramidLevel>,
}

impl TilePyramid {
    /// Build the pyramid for a `width` x `height` image.
    ///
    /// Returns `None` for an empty image. Zero tile limits are treated as 1.
    pub fn build(width: u32, height: u32, max_tile_width: u32, max_tile_height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_tile_width = max_tile_width.max(1);
        let max_tile_height = max_tile_height.max(1);

        let mut levels = Vec::new();
        let mut sample_size: u32 = 1;
        for index in 0..MAX_LEVELS {
            let sampled_w = width.div_ceil(sample_size);
            let sampled_h = height.div_ceil(sample_size);
            let tile_width = width.div_ceil(sampled_w.div_ceil(max_tile_width));
            let tile_height = height.div_ceil(sampled_h.div_ceil(max_tile_height));
            // Recount from the rounded tile size so no trailing tile is empty
            let columns = width.div_ceil(tile_width);
            let rows = height.div_ceil(tile_height);

            levels.push(PyramidLevel {
                index,
                sample_size,
                columns,
                rows,
                tile_width,
                tile_height,
            });

            if columns == 1 && rows == 1 {
                break;
            }
            sample_size = match sample_size.checked_mul(2) {
                Some(next) => next,
                None => break,
            };
        }

        Some(Self {
            width,
            height,
            max_tile_width,
            max_tile_height,
            levels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn max_tile_size(&self) -> (u32, u32) {
        (self.max_tile_width, self.max_tile_height)
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> Option<&PyramidLevel> {
        self.levels.get(index)
    }

    /// Index of the single-tile overview level.
    pub fn coarsest_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Geometry of tile `id`, if it exists.
    pub fn tile(&self, id: TileId) -> Option<Tile> {
        let level = self.levels.get(id.level)?;
        if id.col >= level.columns || id.row >= level.rows {
            return None;
        }
        Some(Tile {
            id,
            rect: level.tile_rect(id.col, id.row, self.width, self.height),
            sample_size: level.sample_size,
        })
    }

    /// All tiles of `level`, row-major.
    pub fn tiles(&self, level: usize) -> Vec<Tile> {
        let Some(lvl) = self.levels.get(level) else {
            return Vec::new();
        };
        let mut tiles = Vec::with_capacity(lvl.tile_count());
        for row in 0..lvl.rows {
            for col in 0..lvl.columns {
                tiles.push(Tile {
                    id: TileId::new(level, col, row),
                    rect: lvl.tile_rect(col, row, self.width, self.height),
                    sample_size: lvl.sample_size,
                });
            }
        }
        tiles
    }

    /// Finest level whose sample size does not exceed what `scale` needs.
    ///
    /// `scale` is displayed pixels per image pixel; 0.25 means the image is
    /// drawn at a quarter of its size, which is served by sample size 4.
    pub fn level_for_scale(&self, scale: f32) -> usize {
        if !scale.is_finite() || scale <= 0.0 {
            return self.coarsest_level();
        }
        let max_sample = 1.0 / scale;
        self.levels
            .iter()
            .rev()
            .find(|level| level.sample_size as f32 <= max_sample)
            .map(|level| level.index)
            .unwrap_or(0)
    }

    /// Tiles to keep decoded for `viewport`.
    ///
    /// The tiles of the level matching the viewport scale that intersect the
    /// visible rectangle, plus the overview tile, which stays underneath as
    /// a backdrop while finer tiles load or after they fail.
    pub fn visible_tiles(&self, viewport: &Viewport) -> Vec<TileId> {
        let coarsest = self.coarsest_level();
        let mut visible = vec![TileId::new(coarsest, 0, 0)];

        let level_index = self.level_for_scale(viewport.scale);
        if level_index == coarsest {
            return visible;
        }
        let level = &self.levels[level_index];

        let area = viewport.visible.clamp_to(self.width, self.height);
        if area.is_empty() {
            return visible;
        }

        let first_col = area.x / level.tile_width;
        let last_col = ((area.right() - 1) / level.tile_width).min(level.columns - 1);
        let first_row = area.y / level.tile_height;
        let last_row = ((area.bottom() - 1) / level.tile_height).min(level.rows - 1);

        for row in first_row..=last_row {
            for col in first_col..=last_col {
                visible.push(TileId::new(level_index, col, row));
            }
        }
        visible
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gigapixel_levels() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        let grids: Vec<_> = pyramid
            .levels()
            .iter()
            .map(|l| (l.sample_size, l.columns, l.rows))
            .collect();
        assert_eq!(
            grids,
            vec![(1, 8, 6), (2, 4, 3), (4, 2, 2), (8, 1, 1)]
        );
        assert_eq!(pyramid.coarsest_level(), 3);
    }

    #[test]
    fn test_level_zero_covers_image() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        let tiles = pyramid.tiles(0);
        assert!(tiles.len() > 1);

        let area: u64 = tiles.iter().map(|t| t.rect.area()).sum();
        assert_eq!(area, 8000 * 6000);
        for tile in &tiles {
            let (w, h) = tile.decoded_size();
            assert!(w <= 1000 && h <= 1000);
        }
    }

    #[test]
    fn test_sampled_tiles_fit_limit() {
        let pyramid = TilePyramid::build(5001, 3333, 700, 500).unwrap();
        for level in pyramid.levels() {
            for tile in pyramid.tiles(level.index) {
                let (w, h) = tile.decoded_size();
                assert!(w <= 700, "{} is {} wide", tile.id, w);
                assert!(h <= 500, "{} is {} high", tile.id, h);
            }
        }
        let last = pyramid.level(pyramid.coarsest_level()).unwrap();
        assert_eq!((last.columns, last.rows), (1, 1));
    }

    #[test]
    fn test_small_image_is_single_level() {
        let pyramid = TilePyramid::build(640, 480, 1024, 1024).unwrap();
        assert_eq!(pyramid.level_count(), 1);
        assert_eq!(pyramid.tile(TileId::new(0, 0, 0)).unwrap().rect, Rect::new(0, 0, 640, 480));
    }

    #[test]
    fn test_empty_image() {
        assert!(TilePyramid::build(0, 10, 100, 100).is_none());
    }

    #[test]
    fn test_tile_out_of_range() {
        let pyramid = TilePyramid::build(2000, 2000, 1000, 1000).unwrap();
        assert!(pyramid.tile(TileId::new(0, 2, 0)).is_none());
        assert!(pyramid.tile(TileId::new(9, 0, 0)).is_none());
    }

    #[test]
    fn test_level_for_scale() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        assert_eq!(pyramid.level_for_scale(1.0), 0);
        assert_eq!(pyramid.level_for_scale(2.0), 0);
        assert_eq!(pyramid.level_for_scale(0.5), 1);
        assert_eq!(pyramid.level_for_scale(0.3), 1);
        assert_eq!(pyramid.level_for_scale(0.25), 2);
        assert_eq!(pyramid.level_for_scale(0.01), 3);
        assert_eq!(pyramid.level_for_scale(0.0), 3);
    }

    #[test]
    fn test_visible_tiles_include_overview() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        let viewport = Viewport::new(Rect::new(1500, 500, 1000, 1000), 1.0);
        let visible = pyramid.visible_tiles(&viewport);

        assert_eq!(visible[0], TileId::new(3, 0, 0));
        assert_eq!(
            &visible[1..],
            &[
                TileId::new(0, 1, 0),
                TileId::new(0, 2, 0),
                TileId::new(0, 1, 1),
                TileId::new(0, 2, 1),
            ]
        );
    }

    #[test]
    fn test_visible_tiles_clamped_to_image() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        let viewport = Viewport::new(Rect::new(7500, 5500, 4000, 4000), 1.0);
        let visible = pyramid.visible_tiles(&viewport);
        assert_eq!(visible, vec![TileId::new(3, 0, 0), TileId::new(0, 7, 5)]);

        let outside = Viewport::new(Rect::new(9000, 9000, 10, 10), 1.0);
        assert_eq!(pyramid.visible_tiles(&outside), vec![TileId::new(3, 0, 0)]);
    }

    #[test]
    fn test_visible_tiles_extreme_coordinates() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        let overview = vec![TileId::new(3, 0, 0)];

        let far_right = Viewport::new(Rect::new(u32::MAX - 10, 0, 100, 100), 1.0);
        assert_eq!(pyramid.visible_tiles(&far_right), overview);

        let far_corner = Viewport::new(Rect::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX), 1.0);
        assert_eq!(pyramid.visible_tiles(&far_corner), overview);

        // Huge extent from inside the image reaches the last column and row
        let huge = Viewport::new(Rect::new(7999, 5999, u32::MAX, u32::MAX), 1.0);
        assert_eq!(
            pyramid.visible_tiles(&huge),
            vec![TileId::new(3, 0, 0), TileId::new(0, 7, 5)]
        );
    }

    #[test]
    fn test_zoomed_out_uses_overview_only() {
        let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
        let viewport = Viewport::new(Rect::new(0, 0, 8000, 6000), 0.1);
        assert_eq!(pyramid.visible_tiles(&viewport), vec![TileId::new(3, 0, 0)]);
    }
}
