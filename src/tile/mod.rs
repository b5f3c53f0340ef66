//! Tile-pyramid progressive decoding.
//!
//! Images too large to decode in one piece are shown through a pyramid of
//! region decodes. A coarse single-tile overview is decoded first, then the
//! tiles of the level matching the current zoom that intersect the viewport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   TileManager                    │
//! │  update_viewport() ─► visible set ─► job queue   │
//! │                                         │        │
//! │          ┌──────────────────────────────┘        │
//! │          ▼                                       │
//! │   N decode workers (N ≤ 4)                       │
//! │     borrow RegionDecoder ─► decode tile rect     │
//! │     generation still current? install : discard │
//! └────────┬─────────────────────────────┬───────────┘
//!          │                             │
//!          ▼                             ▼
//! ┌──────────────────┐         ┌──────────────────┐
//! │ RegionDecoderPool│         │    BufferPool    │
//! └──────────────────┘         └──────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TilePyramid`]: level and tile geometry in display coordinates
//! - [`Viewport`]: visible rectangle and zoom scale
//! - [`RegionDecoderPool`]: reusable region decoders for one image
//! - [`TileManager`]: lifecycle, scheduling and installed tile buffers

mod decoder_pool;
mod manager;
mod pyramid;
mod viewport;

pub use crate::codec::Orientation;
pub use decoder_pool::{PooledDecoder, RegionDecoderPool};
pub use manager::{
    TileConfig, TileEvent, TileManager, TileSnapshot, TileState, TileStatus,
    DEFAULT_MAX_TILE_SIZE, MIN_TILE_SIZE,
};
pub use pyramid::{PyramidLevel, Tile, TileId, TilePyramid};
pub use viewport::Viewport;
