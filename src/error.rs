use std::time::Duration;

use thiserror::Error;

/// Errors raised while fetching source bytes.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The locator does not resolve to anything
    #[error("Source not found: {0}")]
    NotFound(String),

    /// Read or transport failure
    #[error("I/O error: {0}")]
    Io(String),

    /// No fetcher understands this locator
    #[error("Unsupported locator: {0}")]
    UnsupportedLocator(String),

    /// The caller-supplied fetch timeout elapsed
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised while turning bytes into pixels.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// Bytes are in a format no decoder understands
    #[error("Unsupported image format: {0}")]
    Unsupported(String),

    /// Bytes are recognised but cannot be decoded
    #[error("Corrupt image data: {0}")]
    Corrupt(String),

    /// The decoded image is degenerate
    #[error("Invalid image size: {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    /// A buffer handed out by the pool cannot hold the decode output
    #[error("Reused buffer {actual:?} does not fit decode target {expected:?}")]
    PoolReuse {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// The requested region lies outside the image
    #[error("Region {x},{y} {width}x{height} is outside the image")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// A transformation failed
    #[error("Transformation {key} failed: {message}")]
    Transform { key: String, message: String },
}

impl DecodeError {
    /// Whether the failure is attributable to a reused pool buffer.
    pub fn is_pool_reuse(&self) -> bool {
        matches!(self, DecodeError::PoolReuse { .. })
    }
}

/// Errors raised by a persistent byte store.
///
/// These never fail a request; persistent tiers degrade them to a miss.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Filesystem or backend failure
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A stored record could not be parsed
    #[error("Malformed cache record: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Terminal classification of a load request.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Fetching the source failed
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Decoding the fetched bytes failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The request was cancelled before a result was delivered
    #[error("Request cancelled")]
    Cancelled,

    /// A registered interceptor aborted the chain
    #[error("Interceptor {name} failed: {message}")]
    Interceptor { name: String, message: String },
}

/// Coarse error classes reported on a request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Source,
    Decode,
    Cancelled,
    Interceptor,
}

impl LoadError {
    /// The single terminal classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Source(_) => ErrorKind::Source,
            LoadError::Decode(_) => ErrorKind::Decode,
            LoadError::Cancelled => ErrorKind::Cancelled,
            LoadError::Interceptor { .. } => ErrorKind::Interceptor,
        }
    }
}

/// Errors raised by the tile pyramid decoder itself.
///
/// Per-tile decode failures are logged and never surface here.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The source image cannot be tiled
    #[error("Invalid image for tiling: {0}")]
    InvalidImage(String),

    /// Opening the first region decoder failed
    #[error("Failed to open region decoder: {0}")]
    Decode(#[from] DecodeError),

    /// The operation is not allowed in the current state
    #[error("Tile manager is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
}
