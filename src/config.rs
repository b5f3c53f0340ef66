//! Configuration management for Tessera.
//!
//! This module provides the command-line interface, which supports:
//! - Command-line arguments via clap
//! - Environment variables with `TESSERA_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use tessera::config::Cli;
//!
//! let cli = Cli::parse();
//! cli.config.validate()?;
//! let loader = ImageLoader::builder()
//!     .config(cli.config.to_loader_config())
//!     .open()
//!     .await?;
//! ```
//!
//! # Environment Variables
//!
//! - `TESSERA_MEMORY_CACHE` - Memory cache budget in bytes (default: 64MB)
//! - `TESSERA_RESULT_CACHE` - Result cache budget in bytes (default: 256MB)
//! - `TESSERA_DOWNLOAD_CACHE` - Download cache budget in bytes (default: 256MB)
//! - `TESSERA_POOL_SIZE` - Buffer pool budget in bytes (default: 32MB)
//! - `TESSERA_CACHE_DIR` - Directory for the persistent caches (default: in memory)
//! - `TESSERA_DECODE_PARALLELISM` - Concurrent decodes, 1 to 4 (default: 4)
//! - `TESSERA_MAX_TILE` - Largest decoded tile dimension (default: 1024)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::cache::{DEFAULT_MEMORY_CACHE_CAPACITY, DEFAULT_STORE_CAPACITY};
use crate::codec::Orientation;
use crate::pipeline::{LoaderConfig, DEFAULT_DECODE_PARALLELISM, MAX_DECODE_PARALLELISM};
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::tile::{TileConfig, DEFAULT_MAX_TILE_SIZE};

// =============================================================================
// Default Values
// =============================================================================

/// Default number of times `load` runs its request.
pub const DEFAULT_REPEAT: usize = 2;

/// Smallest accepted `--max-tile`.
pub const MIN_MAX_TILE: u32 = 64;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tessera - image loading with tiered caches and tile pyramids.
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

/// Engine settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Memory cache budget in bytes.
    #[arg(long, default_value_t = DEFAULT_MEMORY_CACHE_CAPACITY, env = "TESSERA_MEMORY_CACHE")]
    pub memory_cache: usize,

    /// Result cache budget in bytes.
    #[arg(long, default_value_t = DEFAULT_STORE_CAPACITY, env = "TESSERA_RESULT_CACHE")]
    pub result_cache: u64,

    /// Download cache budget in bytes.
    #[arg(long, default_value_t = DEFAULT_STORE_CAPACITY, env = "TESSERA_DOWNLOAD_CACHE")]
    pub download_cache: u64,

    /// Pixel buffer pool budget in bytes. Zero disables pooling.
    #[arg(long, default_value_t = DEFAULT_POOL_CAPACITY, env = "TESSERA_POOL_SIZE")]
    pub pool_size: usize,

    /// Directory for the result and download caches.
    ///
    /// If not specified, both persistent tiers are kept in memory.
    #[arg(long, env = "TESSERA_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    // =========================================================================
    // Decode Configuration
    // =========================================================================
    /// Number of concurrent decodes (1-4).
    #[arg(long, default_value_t = DEFAULT_DECODE_PARALLELISM, env = "TESSERA_DECODE_PARALLELISM")]
    pub decode_parallelism: usize,

    /// Largest decoded tile width and height.
    #[arg(long, default_value_t = DEFAULT_MAX_TILE_SIZE, env = "TESSERA_MAX_TILE")]
    pub max_tile: u32,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_cache == 0 {
            return Err("memory_cache must be greater than 0".to_string());
        }
        if self.result_cache == 0 || self.download_cache == 0 {
            return Err("result_cache and download_cache must be greater than 0".to_string());
        }

        if self.decode_parallelism == 0 || self.decode_parallelism > MAX_DECODE_PARALLELISM {
            return Err(format!(
                "decode_parallelism must be between 1 and {}",
                MAX_DECODE_PARALLELISM
            ));
        }

        if self.max_tile < MIN_MAX_TILE {
            return Err(format!("max_tile must be at least {}", MIN_MAX_TILE));
        }

        Ok(())
    }

    /// Settings for [`crate::ImageLoader`].
    pub fn to_loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            memory_cache_size: self.memory_cache,
            result_cache_size: self.result_cache,
            download_cache_size: self.download_cache,
            pool_size: self.pool_size,
            cache_dir: self.cache_dir.clone(),
            decode_parallelism: self.decode_parallelism,
        }
    }

    /// Settings for [`crate::TileManager`].
    pub fn to_tile_config(
        &self,
        orientation: Orientation,
        viewport_size: Option<(u32, u32)>,
    ) -> TileConfig {
        TileConfig {
            max_tile_size: self.max_tile,
            parallelism: self.decode_parallelism,
            orientation,
            viewport_size,
        }
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load an image through the pipeline and print a JSON report.
    Load(LoadArgs),

    /// Print the tile pyramid of an image as JSON.
    Pyramid(PyramidArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Image locator (file path or file:// URL).
    pub locator: String,

    /// Target width in pixels.
    #[arg(long, requires = "height")]
    pub width: Option<u32>,

    /// Target height in pixels.
    #[arg(long, requires = "width")]
    pub height: Option<u32>,

    /// Number of sequential loads; the second and later should hit a cache.
    #[arg(long, default_value_t = DEFAULT_REPEAT)]
    pub repeat: usize,

    /// Rotate clockwise by 90, 180 or 270 degrees.
    #[arg(long)]
    pub rotate: Option<u32>,

    /// Convert to grayscale.
    #[arg(long, default_value_t = false)]
    pub grayscale: bool,
}

impl LoadArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.repeat == 0 {
            return Err("repeat must be greater than 0".to_string());
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err("width and height must be greater than 0".to_string());
        }
        if let Some(degrees) = self.rotate {
            if Orientation::from_degrees(degrees).is_none() {
                return Err(format!("rotate must be 0, 90, 180 or 270, got {}", degrees));
            }
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct PyramidArgs {
    /// Image locator (file path or file:// URL).
    pub locator: String,

    /// Viewport size as WIDTHxHEIGHT; decodes the tiles visible when the
    /// whole image is fitted into it.
    #[arg(long, value_parser = parse_dimensions)]
    pub viewport: Option<(u32, u32)>,

    /// Display rotation in degrees (0, 90, 180 or 270).
    #[arg(long, default_value_t = 0)]
    pub rotate: u32,
}

impl PyramidArgs {
    pub fn orientation(&self) -> Result<Orientation, String> {
        Orientation::from_degrees(self.rotate)
            .ok_or_else(|| format!("rotate must be 0, 90, 180 or 270, got {}", self.rotate))
    }
}

/// Parse `WIDTHxHEIGHT`.
pub fn parse_dimensions(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width in '{}'", value))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height in '{}'", value))?;
    if width == 0 || height == 0 {
        return Err(format!("dimensions must be non-zero, got '{}'", value));
    }
    Ok((width, height))
}

// =============================================================================
// Tests
// =============================================================================
