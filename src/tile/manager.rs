//! Progressive tile decoding for one large image.
//!
//! # Lifecycle
//!
//! ```text
//! CONSTRUCTING ──open()──► READY ──update_viewport()──► ACTIVE ◄──resume()── PAUSED
//!                                                         │                    ▲
//!                                                         └──────pause()───────┘
//!                       any state ──destroy()/drop──► DESTROYED
//! ```
//!
//! # Generations
//!
//! Every viewport update, pause and destroy bumps a generation counter while
//! holding the state lock. Each decode job carries the generation it was
//! scheduled under. Workers drop jobs whose generation is already stale
//! before decoding, and compare again under the lock before installing, so a
//! superseded decode never touches installed tiles. Its buffer goes back to
//! the [`BufferPool`] instead.
//!
//! # Workers
//!
//! A fixed number of worker tasks (at most [`MAX_DECODE_PARALLELISM`]) share
//! one job queue. Decodes run on the blocking pool, each with a region decoder
//! borrowed from the image's [`RegionDecoderPool`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::codec::{
    decode_region_with_reuse, rotate, Allocator, ImageDecoder, Orientation, PixelBuffer,
};
use crate::error::{DecodeError, TileError};
use crate::pipeline::MAX_DECODE_PARALLELISM;
use crate::pool::BufferPool;

use super::decoder_pool::RegionDecoderPool;
use super::pyramid::{Tile, TileId, TilePyramid};
use super::viewport::Viewport;

/// Default upper bound on a decoded tile's width and height.
pub const DEFAULT_MAX_TILE_SIZE: u32 = 1024;

/// Tiles are never bounded below this by a small viewport.
pub const MIN_TILE_SIZE: u32 = 256;

const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for a [`TileManager`].
#[derive(Debug, Clone)]
pub struct TileConfig {
    /// Largest decoded tile dimension
    pub max_tile_size: u32,
    /// Number of decode workers, clamped to `1..=MAX_DECODE_PARALLELISM`
    pub parallelism: usize,
    /// Rotation applied to the source for display
    pub orientation: Orientation,
    /// Size of the on-screen area, when known
    pub viewport_size: Option<(u32, u32)>,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            max_tile_size: DEFAULT_MAX_TILE_SIZE,
            parallelism: MAX_DECODE_PARALLELISM,
            orientation: Orientation::Deg0,
            viewport_size: None,
        }
    }
}

impl TileConfig {
    /// Decoded tile bounds: the configured maximum, tightened to the viewport
    /// but never below [`MIN_TILE_SIZE`].
    pub fn max_tile_dimensions(&self) -> (u32, u32) {
        let max = self.max_tile_size.max(1);
        match self.viewport_size {
            Some((width, height)) => (
                max.min(width.max(MIN_TILE_SIZE)),
                max.min(height.max(MIN_TILE_SIZE)),
            ),
            None => (max, max),
        }
    }
}

// =============================================================================
// Public state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileState {
    Constructing,
    Ready,
    Active,
    Paused,
    Destroyed,
}

impl TileState {
    pub fn as_str(self) -> &'static str {
        match self {
            TileState::Constructing => "constructing",
            TileState::Ready => "ready",
            TileState::Active => "active",
            TileState::Paused => "paused",
            TileState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TileStatus {
    /// Visible, waiting for (or in) a decode
    Pending,
    /// Pixels installed
    Decoded,
    /// Last decode failed; retried on the next viewport change
    Failed,
}

/// Point-in-time view of one visible tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileSnapshot {
    pub tile: Tile,
    pub status: TileStatus,
}

/// Redraw notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileEvent {
    /// A tile's pixels were installed under `generation`
    Installed { tile: TileId, generation: u64 },
    /// A tile's decode failed; the coarser levels stay visible
    Failed { tile: TileId, message: String },
}

// =============================================================================
// Internals
// =============================================================================

struct TileEntry {
    tile: Tile,
    status: TileStatus,
    buffer: Option<PixelBuffer>,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    tile: Tile,
    generation: u64,
}

struct Inner {
    state: TileState,
    viewport: Option<Viewport>,
    tiles: HashMap<TileId, TileEntry>,
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl Inner {
    /// Queue every tile that is not decoded under `generation`.
    fn schedule(&mut self, generation: u64, only_failed: bool) -> usize {
        let Some(jobs) = &self.jobs else {
            return 0;
        };
        let mut scheduled = 0;
        for entry in self.tiles.values_mut() {
            let wanted = match entry.status {
                TileStatus::Decoded => false,
                TileStatus::Failed => true,
                TileStatus::Pending => !only_failed,
            };
            if !wanted {
                continue;
            }
            entry.status = TileStatus::Pending;
            if jobs
                .send(Job {
                    tile: entry.tile,
                    generation,
                })
                .is_ok()
            {
                scheduled += 1;
            }
        }
        scheduled
    }

    fn invalid(&self, operation: &'static str) -> TileError {
        TileError::InvalidState {
            state: self.state.as_str(),
            operation,
        }
    }
}

struct Shared {
    pyramid: TilePyramid,
    orientation: Orientation,
    source_size: (u32, u32),
    decoders: Arc<RegionDecoderPool>,
    pool: Arc<BufferPool>,
    generation: AtomicU64,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TileEvent>,
}

impl Shared {
    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) != generation
    }

    /// Only called with the state lock held.
    fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decode one tile in display orientation.
    fn decode_tile(&self, tile: &Tile) -> Result<PixelBuffer, DecodeError> {
        let (width, height) = self.source_size;
        let source_rect = self.orientation.display_to_source(tile.rect, width, height);

        let decoded = {
            let mut decoder = self.decoders.borrow()?;
            decode_region_with_reuse(
                &mut *decoder,
                source_rect,
                tile.sample_size,
                self.pool.as_ref(),
            )?
        };

        if self.orientation == Orientation::Deg0 {
            return Ok(decoded);
        }
        let rotated = rotate(&decoded, self.orientation, self.pool.as_ref());
        self.pool.release(decoded);
        rotated
    }

    /// Install a finished decode, or discard it if it was superseded.
    fn complete(&self, job: Job, result: Result<PixelBuffer, DecodeError>) {
        let id = job.tile.id;
        let mut inner = self.inner.lock();
        let current = inner.state == TileState::Active && !self.is_stale(job.generation);

        match result {
            Ok(buffer) => {
                let outcome = match inner.tiles.get_mut(&id) {
                    Some(entry) if current => {
                        entry.status = TileStatus::Decoded;
                        Ok(entry.buffer.replace(buffer))
                    }
                    _ => Err(buffer),
                };
                match outcome {
                    Ok(previous) => {
                        // Sent under the lock so no later generation can interleave
                        let _ = self.events.send(TileEvent::Installed {
                            tile: id,
                            generation: job.generation,
                        });
                        drop(inner);
                        if let Some(previous) = previous {
                            self.pool.release(previous);
                        }
                        debug!("Installed tile {} (generation {})", id, job.generation);
                    }
                    Err(buffer) => {
                        drop(inner);
                        debug!(
                            "Discarding stale tile {} (generation {})",
                            id, job.generation
                        );
                        self.pool.release(buffer);
                    }
                }
            }
            Err(err) => {
                if !current {
                    drop(inner);
                    debug!("Ignoring failure of stale tile {}: {}", id, err);
                    return;
                }
                if let Some(entry) = inner.tiles.get_mut(&id) {
                    entry.status = TileStatus::Failed;
                }
                let _ = self.events.send(TileEvent::Failed {
                    tile: id,
                    message: err.to_string(),
                });
                drop(inner);
                warn!("Failed to decode tile {}: {}", id, err);
            }
        }
    }
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>;

async fn run_worker(worker: usize, shared: Arc<Shared>, jobs: JobQueue) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            jobs.recv().await
        };
        let Some(job) = job else {
            break;
        };

        if shared.is_stale(job.generation) {
            debug!(
                "Skipping tile {} scheduled under generation {}",
                job.tile.id, job.generation
            );
            continue;
        }

        let decode = {
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || shared.decode_tile(&job.tile))
        };
        let result = match decode.await {
            Ok(result) => result,
            Err(e) => Err(DecodeError::Corrupt(format!("tile decode task failed: {}", e))),
        };
        shared.complete(job, result);
    }
    debug!("Tile worker {} stopped", worker);
}

// =============================================================================
// Tile Manager
// =============================================================================

/// Owns the pyramid, decoded tiles and decode workers of one image.
///
/// Dropping the manager destroys it.
pub struct TileManager {
    shared: Arc<Shared>,
    parallelism: usize,
}

impl TileManager {
    /// Open `data` for tiled decoding and start the decode workers.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn open(
        data: Bytes,
        decoder: Arc<dyn ImageDecoder>,
        pool: Arc<BufferPool>,
        config: TileConfig,
    ) -> Result<Self, TileError> {
        let decoders = tokio::task::spawn_blocking(move || RegionDecoderPool::open(data, decoder))
            .await
            .map_err(|e| TileError::InvalidImage(e.to_string()))??;

        let info = decoders.info().clone();
        let (width, height) = config.orientation.display_size(info.width, info.height);
        let (max_width, max_height) = config.max_tile_dimensions();
        let pyramid = TilePyramid::build(width, height, max_width, max_height).ok_or_else(|| {
            TileError::InvalidImage(format!("empty image {}x{}", info.width, info.height))
        })?;

        let parallelism = config.parallelism.clamp(1, MAX_DECODE_PARALLELISM);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            pyramid,
            orientation: config.orientation,
            source_size: (info.width, info.height),
            decoders,
            pool,
            generation: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: TileState::Constructing,
                viewport: None,
                tiles: HashMap::new(),
                jobs: Some(jobs_tx),
            }),
            events,
        });

        let jobs: JobQueue = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        for worker in 0..parallelism {
            tokio::spawn(run_worker(worker, shared.clone(), jobs.clone()));
        }

        shared.inner.lock().state = TileState::Ready;
        info!(
            "Opened {}x{} {} image: {} pyramid levels, {} workers",
            info.width,
            info.height,
            info.mime_type,
            shared.pyramid.level_count(),
            parallelism
        );

        Ok(Self {
            shared,
            parallelism,
        })
    }

    pub fn pyramid(&self) -> &TilePyramid {
        &self.shared.pyramid
    }

    pub fn state(&self) -> TileState {
        self.shared.inner.lock().state
    }

    /// Current generation; advances on every viewport update, pause and destroy.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.shared.inner.lock().viewport
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn decoder_pool(&self) -> &Arc<RegionDecoderPool> {
        &self.shared.decoders
    }

    /// Receive install and failure notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.shared.events.subscribe()
    }

    /// Show a new part of the image.
    ///
    /// Tiles that left the view are released to the buffer pool, newly
    /// visible tiles are scheduled, and decoded tiles that are still visible
    /// are kept. While paused the viewport is recorded but nothing is decoded
    /// until [`resume`](Self::resume). Returns the new generation.
    pub fn update_viewport(&self, viewport: Viewport) -> Result<u64, TileError> {
        let visible: HashSet<TileId> = self
            .shared
            .pyramid
            .visible_tiles(&viewport)
            .into_iter()
            .collect();

        let mut released = Vec::new();
        let (generation, scheduled) = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                TileState::Ready => inner.state = TileState::Active,
                TileState::Active | TileState::Paused => {}
                TileState::Constructing | TileState::Destroyed => {
                    return Err(inner.invalid("update viewport"))
                }
            }

            let generation = self.shared.advance();
            inner.viewport = Some(viewport);

            inner.tiles.retain(|id, entry| {
                if visible.contains(id) {
                    return true;
                }
                if let Some(buffer) = entry.buffer.take() {
                    released.push(buffer);
                }
                false
            });

            for id in &visible {
                if inner.tiles.contains_key(id) {
                    continue;
                }
                if let Some(tile) = self.shared.pyramid.tile(*id) {
                    inner.tiles.insert(
                        *id,
                        TileEntry {
                            tile,
                            status: TileStatus::Pending,
                            buffer: None,
                        },
                    );
                }
            }

            let scheduled = if inner.state == TileState::Active {
                inner.schedule(generation, false)
            } else {
                0
            };
            (generation, scheduled)
        };

        let evicted = released.len();
        for buffer in released {
            self.shared.pool.release(buffer);
        }
        debug!(
            "Viewport generation {}: {} visible, {} scheduled, {} released",
            generation,
            visible.len(),
            scheduled,
            evicted
        );
        Ok(generation)
    }

    /// Reschedule tiles whose last decode failed.
    pub fn retry_failed(&self) -> Result<usize, TileError> {
        let mut inner = self.shared.inner.lock();
        let state = inner.state;
        match state {
            TileState::Active => {}
            TileState::Ready | TileState::Paused => return Ok(0),
            TileState::Constructing | TileState::Destroyed => {
                return Err(inner.invalid("retry tiles"))
            }
        }
        let generation = self.generation();
        Ok(inner.schedule(generation, true))
    }

    /// Stop decoding and hand every decoded tile buffer back to the pool.
    ///
    /// The pyramid and the visible tile set are kept.
    pub fn pause(&self) -> Result<(), TileError> {
        let released: Vec<PixelBuffer> = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                TileState::Ready | TileState::Active => {}
                TileState::Paused => return Ok(()),
                TileState::Constructing | TileState::Destroyed => {
                    return Err(inner.invalid("pause"))
                }
            }
            inner.state = TileState::Paused;
            self.shared.advance();
            inner
                .tiles
                .values_mut()
                .filter_map(|entry| {
                    entry.status = TileStatus::Pending;
                    entry.buffer.take()
                })
                .collect()
        };

        debug!("Paused, released {} tile buffers", released.len());
        for buffer in released {
            self.shared.pool.release(buffer);
        }
        Ok(())
    }

    /// Resume decoding the current viewport after [`pause`](Self::pause).
    pub fn resume(&self) -> Result<(), TileError> {
        let mut inner = self.shared.inner.lock();
        let state = inner.state;
        match state {
            TileState::Paused => {}
            TileState::Ready | TileState::Active => return Ok(()),
            TileState::Constructing | TileState::Destroyed => return Err(inner.invalid("resume")),
        }
        inner.state = TileState::Active;
        let generation = self.shared.advance();
        let scheduled = inner.schedule(generation, false);
        drop(inner);
        debug!("Resumed at generation {}, {} tiles scheduled", generation, scheduled);
        Ok(())
    }

    /// Release all tiles and decoders and stop the workers. Idempotent.
    pub fn destroy(&self) {
        let released: Vec<PixelBuffer> = {
            let mut inner = self.shared.inner.lock();
            if inner.state == TileState::Destroyed {
                return;
            }
            inner.state = TileState::Destroyed;
            self.shared.advance();
            inner.viewport = None;
            // Closing the queue stops the workers once they finish their job
            inner.jobs = None;
            inner
                .tiles
                .drain()
                .filter_map(|(_, entry)| entry.buffer)
                .collect()
        };

        for buffer in released {
            self.shared.pool.release(buffer);
        }
        self.shared.decoders.destroy();
        info!("Tile manager destroyed");
    }

    /// Visible tiles and their status, ordered by level, row and column.
    pub fn tiles(&self) -> Vec<TileSnapshot> {
        let inner = self.shared.inner.lock();
        let mut tiles: Vec<TileSnapshot> = inner
            .tiles
            .values()
            .map(|entry| TileSnapshot {
                tile: entry.tile,
                status: entry.status,
            })
            .collect();
        tiles.sort_by_key(|snapshot| {
            let id = snapshot.tile.id;
            (id.level, id.row, id.col)
        });
        tiles
    }

    /// Run `f` on the installed pixels of tile `id`.
    ///
    /// The buffer is only borrowed for the duration of `f`; it stays owned by
    /// the manager.
    pub fn with_tile<R>(&self, id: TileId, f: impl FnOnce(&PixelBuffer) -> R) -> Option<R> {
        let inner = self.shared.inner.lock();
        inner
            .tiles
            .get(&id)
            .and_then(|entry| entry.buffer.as_ref())
            .map(f)
    }

    /// Number of tiles with installed pixels.
    pub fn decoded_count(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner
            .tiles
            .values()
            .filter(|entry| entry.buffer.is_some())
            .count()
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

// =============================================================================
// Tests
// =============================================================================
