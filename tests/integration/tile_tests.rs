//! Tile pyramid and tile manager integration tests.
//!
//! Tests verify:
//! - Pyramid geometry for a large image
//! - Region requests issued for a zoomed-out viewport
//! - Superseded viewports never install tiles
//! - Viewports partly or fully outside the image
//! - Pixel placement for real PNG data, including rotation
//! - Destroy while decodes are in flight

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::timeout;

use tessera::codec::{Orientation, Rect, StandardDecoder};
use tessera::pool::BufferPool;
use tessera::tile::{
    TileConfig, TileEvent, TileId, TileManager, TilePyramid, TileState, TileStatus, Viewport,
};

use super::test_utils::{pixel_at, png_bytes, rgba_at, SlowRegionDecoder};

fn config(max_tile_size: u32) -> TileConfig {
    TileConfig {
        max_tile_size,
        parallelism: 2,
        ..TileConfig::default()
    }
}

fn pool() -> Arc<BufferPool> {
    Arc::new(BufferPool::with_capacity(128 * 1024 * 1024))
}

async fn open_slow(decoder: &SlowRegionDecoder, max_tile_size: u32) -> TileManager {
    TileManager::open(
        Bytes::from_static(b"mock"),
        Arc::new(decoder.clone()),
        pool(),
        config(max_tile_size),
    )
    .await
    .unwrap()
}

/// Collect installed tiles until `expected` have arrived.
async fn wait_installed(
    events: &mut broadcast::Receiver<TileEvent>,
    expected: usize,
) -> Vec<(TileId, u64)> {
    timeout(Duration::from_secs(10), async {
        let mut installed = Vec::new();
        while installed.len() < expected {
            match events.recv().await.unwrap() {
                TileEvent::Installed { tile, generation } => installed.push((tile, generation)),
                TileEvent::Failed { tile, message } => panic!("tile {} failed: {}", tile, message),
            }
        }
        installed
    })
    .await
    .expect("timed out waiting for tiles")
}

fn decoded_ids(manager: &TileManager) -> HashSet<TileId> {
    manager
        .tiles()
        .into_iter()
        .filter(|snapshot| snapshot.status == TileStatus::Decoded)
        .map(|snapshot| snapshot.tile.id)
        .collect()
}

// =============================================================================
// Large Image Geometry
// =============================================================================

#[tokio::test]
async fn test_large_image_pyramid_levels() {
    let decoder = SlowRegionDecoder::new(8000, 6000, Duration::ZERO);
    let manager = open_slow(&decoder, 1000).await;

    let levels: Vec<(u32, u32, u32)> = manager
        .pyramid()
        .levels()
        .iter()
        .map(|level| (level.sample_size, level.columns, level.rows))
        .collect();
    assert_eq!(levels, vec![(1, 8, 6), (2, 4, 3), (4, 2, 2), (8, 1, 1)]);

    // Same geometry without a manager
    let pyramid = TilePyramid::build(8000, 6000, 1000, 1000).unwrap();
    assert_eq!(pyramid.levels(), manager.pyramid().levels());
}

#[tokio::test]
async fn test_zoomed_out_viewport_requests_sampled_regions() {
    let decoder = SlowRegionDecoder::new(8000, 6000, Duration::ZERO);
    let manager = open_slow(&decoder, 1000).await;
    let mut events = manager.subscribe();

    let viewport = Viewport::fit(8000, 6000, 2000, 1500);
    assert_eq!(manager.pyramid().level_for_scale(viewport.scale), 2);
    let expected = manager.pyramid().visible_tiles(&viewport).len();
    assert_eq!(expected, 5);

    manager.update_viewport(viewport).unwrap();
    wait_installed(&mut events, expected).await;

    let regions: HashSet<Rect> = decoder.regions().into_iter().collect();
    let wanted: HashSet<Rect> = [
        Rect::new(0, 0, 8000, 6000),
        Rect::new(0, 0, 4000, 3000),
        Rect::new(4000, 0, 4000, 3000),
        Rect::new(0, 3000, 4000, 3000),
        Rect::new(4000, 3000, 4000, 3000),
    ]
    .into_iter()
    .collect();
    assert_eq!(regions, wanted);

    let size = manager.with_tile(TileId::new(2, 1, 1), |buffer| (buffer.width(), buffer.height()));
    assert_eq!(size, Some((1000, 750)));
    let overview = manager.with_tile(TileId::new(3, 0, 0), |buffer| (buffer.width(), buffer.height()));
    assert_eq!(overview, Some((1000, 750)));
}

// =============================================================================
// Staleness
// =============================================================================

#[tokio::test]
async fn test_superseded_viewport_never_installs() {
    let decoder = SlowRegionDecoder::new(8000, 6000, Duration::from_millis(200));
    let manager = open_slow(&decoder, 1000).await;
    let mut events = manager.subscribe();

    let first = Viewport::new(Rect::new(0, 0, 2000, 2000), 1.0);
    let second = Viewport::new(Rect::new(6000, 4000, 2000, 2000), 1.0);

    let first_generation = manager.update_viewport(first).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second_generation = manager.update_viewport(second).unwrap();
    assert!(second_generation > first_generation);

    let visible: HashSet<TileId> = manager.pyramid().visible_tiles(&second).into_iter().collect();
    let installed = wait_installed(&mut events, visible.len()).await;

    for (tile, generation) in &installed {
        assert_eq!(*generation, second_generation, "tile {} installed late", tile);
    }
    assert_eq!(decoded_ids(&manager), visible);
    assert!(!visible.contains(&TileId::new(0, 0, 0)));
}

// =============================================================================
// Real Image Data
// =============================================================================

#[tokio::test]
async fn test_png_tiles_hold_source_pixels() {
    let manager = TileManager::open(
        Bytes::from(png_bytes(600, 400)),
        Arc::new(StandardDecoder::new()),
        pool(),
        config(256),
    )
    .await
    .unwrap();
    let mut events = manager.subscribe();

    let viewport = Viewport::new(Rect::new(0, 0, 600, 400), 1.0);
    let expected = manager.pyramid().visible_tiles(&viewport).len();
    manager.update_viewport(viewport).unwrap();
    wait_installed(&mut events, expected).await;

    for tile in manager.pyramid().tiles(0) {
        let rect = tile.rect;
        let points = [(0, 0), (rect.width - 1, rect.height - 1), (rect.width / 2, 3)];
        for (x, y) in points {
            let pixel = manager
                .with_tile(tile.id, |buffer| rgba_at(buffer, x, y))
                .unwrap();
            assert_eq!(pixel, pixel_at(rect.x + x, rect.y + y), "tile {} at ({}, {})", tile.id, x, y);
        }
    }
}

#[tokio::test]
async fn test_rotated_png_tiles_follow_display_orientation() {
    let (source_width, source_height) = (300, 200);
    let config = TileConfig {
        orientation: Orientation::Deg90,
        ..config(256)
    };
    let manager = TileManager::open(
        Bytes::from(png_bytes(source_width, source_height)),
        Arc::new(StandardDecoder::new()),
        pool(),
        config,
    )
    .await
    .unwrap();
    assert_eq!(manager.pyramid().width(), source_height);
    assert_eq!(manager.pyramid().height(), source_width);

    let mut events = manager.subscribe();
    let viewport = Viewport::new(Rect::new(0, 0, source_height, source_width), 1.0);
    let expected = manager.pyramid().visible_tiles(&viewport).len();
    manager.update_viewport(viewport).unwrap();
    wait_installed(&mut events, expected).await;

    // Display (x, y) shows source (y, H - 1 - x) after a clockwise quarter turn
    for tile in manager.pyramid().tiles(0) {
        let rect = tile.rect;
        for (x, y) in [(0, 0), (rect.width - 1, rect.height - 1)] {
            let (dx, dy) = (rect.x + x, rect.y + y);
            let pixel = manager
                .with_tile(tile.id, |buffer| rgba_at(buffer, x, y))
                .unwrap();
            assert_eq!(pixel, pixel_at(dy, source_height - 1 - dx));
        }
    }
}

#[tokio::test]
async fn test_viewports_outside_image_keep_overview() {
    let decoder = SlowRegionDecoder::new(8000, 6000, Duration::ZERO);
    let manager = open_slow(&decoder, 1000).await;
    let overview = TileId::new(3, 0, 0);
    let mut events = manager.subscribe();

    // Partly outside: only the corner tile plus the overview
    let partial = Viewport::new(Rect::new(7500, 5500, 4000, 4000), 1.0);
    manager.update_viewport(partial).unwrap();
    wait_installed(&mut events, 2).await;
    assert_eq!(
        decoded_ids(&manager),
        HashSet::from([overview, TileId::new(0, 7, 5)])
    );

    // Fully outside and at the edge of the coordinate space
    for visible in [
        Rect::new(9000, 9000, 10, 10),
        Rect::new(u32::MAX - 10, 0, 100, 100),
        Rect::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX),
    ] {
        manager.update_viewport(Viewport::new(visible, 1.0)).unwrap();
        assert_eq!(decoded_ids(&manager), HashSet::from([overview]));
    }
    assert_eq!(manager.state(), TileState::Active);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_destroy_during_decode() {
    let decoder = SlowRegionDecoder::new(8000, 6000, Duration::from_millis(100));
    let pool = pool();
    let manager = TileManager::open(
        Bytes::from_static(b"mock"),
        Arc::new(decoder.clone()),
        pool.clone(),
        config(1000),
    )
    .await
    .unwrap();

    manager
        .update_viewport(Viewport::new(Rect::new(0, 0, 8000, 6000), 1.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.destroy();

    assert_eq!(manager.state(), TileState::Destroyed);
    assert!(manager.decoder_pool().is_destroyed());
    assert!(manager.update_viewport(Viewport::fit(8000, 6000, 100, 100)).is_err());

    // In-flight decodes finish and hand their buffers to the pool
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.decoded_count(), 0);
    assert!(manager.tiles().is_empty());
    assert!(!pool.is_empty());
    assert!(decoder.decode_count() <= manager.parallelism());
}
