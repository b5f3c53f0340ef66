//! Tessera - image loading with tiered caches and tile pyramids.
//!
//! This binary runs loads through the engine and inspects tile pyramids,
//! printing JSON reports on stdout. Logs go to stderr.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera::{
    config::{Cli, Command, Config, LoadArgs, PyramidArgs},
    CacheStats, Grayscale, ImageLoader, Orientation, Request, Rotate, StandardDecoder,
    TileEvent, TileManager, TilePyramid, Viewport,
};

/// How long `pyramid --viewport` waits for visible tiles.
const TILE_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.config.verbose);

    if let Err(e) = cli.config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let loader = match open_loader(&cli.config).await {
        Some(loader) => loader,
        None => return ExitCode::FAILURE,
    };

    match cli.command {
        Command::Load(args) => run_load(&loader, args).await,
        Command::Pyramid(args) => run_pyramid(&cli.config, &loader, args).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose { "tessera=debug" } else { "tessera=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn open_loader(config: &Config) -> Option<ImageLoader> {
    match ImageLoader::builder()
        .config(config.to_loader_config())
        .open()
        .await
    {
        Ok(loader) => {
            info!(
                "Engine ready: {}MB memory cache, {} decode slots",
                config.memory_cache / (1024 * 1024),
                loader.decode_parallelism()
            );
            Some(loader)
        }
        Err(e) => {
            error!("Failed to open caches: {}", e);
            None
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Load Command
// =============================================================================

#[derive(Serialize)]
struct LoadReport {
    locator: String,
    cache_key: String,
    loads: Vec<LoadAttempt>,
    stats: CacheStats,
}

#[derive(Serialize)]
struct LoadAttempt {
    attempt: usize,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transformed: Vec<String>,
    /// SHA-256 of the decoded pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn run_load(loader: &ImageLoader, args: LoadArgs) -> ExitCode {
    if let Err(e) = args.validate() {
        error!("Invalid arguments: {}", e);
        return ExitCode::FAILURE;
    }

    let mut builder = Request::builder(args.locator.as_str());
    if let (Some(width), Some(height)) = (args.width, args.height) {
        builder = builder.size(width, height);
    }
    if let Some(rotate) = args.rotate.and_then(Rotate::degrees) {
        builder = builder.transformation(rotate);
    }
    if args.grayscale {
        builder = builder.transformation(Grayscale);
    }
    let request = builder.build();
    let cache_key = loader.cache_key(&request);

    let mut loads = Vec::with_capacity(args.repeat);
    let mut failed = false;
    for attempt in 1..=args.repeat {
        let started = Instant::now();
        let outcome = loader.execute(request.clone()).await;
        let elapsed_ms = started.elapsed().as_millis();

        loads.push(match outcome {
            Ok(result) => LoadAttempt {
                attempt,
                elapsed_ms,
                data_from: Some(result.data_from.to_string()),
                width: Some(result.buffer().width()),
                height: Some(result.buffer().height()),
                transformed: result.transformed().to_vec(),
                digest: Some(hex::encode(Sha256::digest(result.buffer().data()))),
                error: None,
            },
            Err(e) => {
                warn!("Load {} of {} failed: {}", attempt, args.locator, e);
                failed = true;
                LoadAttempt {
                    attempt,
                    elapsed_ms,
                    data_from: None,
                    width: None,
                    height: None,
                    transformed: Vec::new(),
                    digest: None,
                    error: Some(e.to_string()),
                }
            }
        });
    }

    let report = LoadReport {
        locator: args.locator,
        cache_key: cache_key.to_string(),
        loads,
        stats: loader.stats().await,
    };

    let code = print_json(&report);
    if failed {
        ExitCode::FAILURE
    } else {
        code
    }
}

// =============================================================================
// Pyramid Command
// =============================================================================

#[derive(Serialize)]
struct PyramidReport {
    locator: String,
    source_width: u32,
    source_height: u32,
    mime_type: String,
    orientation: Orientation,
    pyramid: TilePyramid,
    #[serde(skip_serializing_if = "Option::is_none")]
    viewport: Option<ViewportReport>,
}

#[derive(Serialize)]
struct ViewportReport {
    viewport: Viewport,
    level: usize,
    generation: u64,
    tiles: Vec<tessera::tile::TileSnapshot>,
    installed: usize,
    failed: usize,
}

async fn run_pyramid(config: &Config, loader: &ImageLoader, args: PyramidArgs) -> ExitCode {
    let orientation = match args.orientation() {
        Ok(orientation) => orientation,
        Err(e) => {
            error!("Invalid arguments: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let fetched = match loader.fetch(&Request::new(args.locator.as_str())).await {
        Ok(fetched) => fetched,
        Err(e) => {
            error!("Failed to fetch {}: {}", args.locator, e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Fetched {} bytes from {}",
        fetched.data.len(),
        fetched.data_from
    );

    let manager = match TileManager::open(
        fetched.data,
        Arc::new(StandardDecoder::new()),
        loader.pool().clone(),
        config.to_tile_config(orientation, args.viewport),
    )
    .await
    {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to open {} for tiling: {}", args.locator, e);
            return ExitCode::FAILURE;
        }
    };

    let viewport = match args.viewport {
        Some((width, height)) => match decode_viewport(&manager, width, height).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let info = manager.decoder_pool().info().clone();
    let report = PyramidReport {
        locator: args.locator,
        source_width: info.width,
        source_height: info.height,
        mime_type: info.mime_type,
        orientation,
        pyramid: manager.pyramid().clone(),
        viewport,
    };
    manager.destroy();

    print_json(&report)
}

/// Fit the image into a `width` x `height` viewport and wait for its tiles.
async fn decode_viewport(
    manager: &TileManager,
    width: u32,
    height: u32,
) -> Result<ViewportReport, String> {
    let pyramid = manager.pyramid();
    let viewport = Viewport::fit(pyramid.width(), pyramid.height(), width, height);
    let expected = pyramid.visible_tiles(&viewport).len();

    let mut events = manager.subscribe();
    let generation = manager
        .update_viewport(viewport)
        .map_err(|e| format!("Viewport update failed: {}", e))?;

    let mut installed = 0;
    let mut failed = 0;
    let waited = tokio::time::timeout(TILE_WAIT, async {
        while installed + failed < expected {
            match events.recv().await {
                Ok(TileEvent::Installed { .. }) => installed += 1,
                Ok(TileEvent::Failed { .. }) => failed += 1,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} tile events", skipped);
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        warn!(
            "Timed out after {:?} with {} of {} tiles decoded",
            TILE_WAIT, installed, expected
        );
    }

    Ok(ViewportReport {
        viewport,
        level: pyramid.level_for_scale(viewport.scale),
        generation,
        tiles: manager.tiles(),
        installed,
        failed,
    })
}
