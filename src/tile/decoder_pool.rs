//! Pool of region decoders for one image.
//!
//! Opening a region decoder can cost as much as a full decode, and a single
//! instance cannot serve two jobs at once. Jobs borrow an idle decoder (or
//! open a fresh one) and the [`PooledDecoder`] guard hands it back on drop.
//! After [`RegionDecoderPool::destroy`] returned decoders are dropped instead.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::codec::{ImageDecoder, ImageInfo, RegionDecoder};
use crate::error::DecodeError;

pub struct RegionDecoderPool {
    data: Bytes,
    decoder: Arc<dyn ImageDecoder>,
    info: ImageInfo,
    idle: Mutex<Vec<Box<dyn RegionDecoder>>>,
    opened: AtomicUsize,
    closed: AtomicBool,
}

impl RegionDecoderPool {
    /// Open the first region decoder over `data` and keep it idle.
    ///
    /// Fails when the bytes cannot be region-decoded at all.
    pub fn open(data: Bytes, decoder: Arc<dyn ImageDecoder>) -> Result<Arc<Self>, DecodeError> {
        let first = decoder.open_region(data.clone())?;
        let info = first.info().clone();
        Ok(Arc::new(Self {
            data,
            decoder,
            info,
            idle: Mutex::new(vec![first]),
            opened: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    /// Source image facts reported by the first decoder.
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// Take an idle decoder, opening a new one if none is idle.
    pub fn borrow(self: &Arc<Self>) -> Result<PooledDecoder, DecodeError> {
        let idle = self.idle.lock().pop();
        let decoder = match idle {
            Some(decoder) => decoder,
            None => {
                let decoder = self.decoder.open_region(self.data.clone())?;
                let opened = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Opened region decoder #{}", opened);
                decoder
            }
        };
        Ok(PooledDecoder {
            decoder: Some(decoder),
            pool: self.clone(),
        })
    }

    /// Drop every idle decoder and stop accepting returns.
    pub fn destroy(&self) {
        self.closed.store(true, Ordering::Release);
        let idle = std::mem::take(&mut *self.idle.lock());
        debug!("Released {} region decoders", idle.len());
    }

    pub fn is_destroyed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Total decoders opened over the pool's lifetime.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    fn give_back(&self, decoder: Box<dyn RegionDecoder>) {
        let mut idle = self.idle.lock();
        // Checked under the lock so a concurrent destroy() cannot miss it
        if !self.closed.load(Ordering::Acquire) {
            idle.push(decoder);
        }
    }
}

/// A borrowed region decoder, returned to its pool on drop.
pub struct PooledDecoder {
    decoder: Option<Box<dyn RegionDecoder>>,
    pool: Arc<RegionDecoderPool>,
}

impl Deref for PooledDecoder {
    type Target = dyn RegionDecoder;

    fn deref(&self) -> &Self::Target {
        // Only taken in drop()
        match &self.decoder {
            Some(decoder) => decoder.as_ref(),
            None => unreachable!("pooled decoder used after drop"),
        }
    }
}

impl DerefMut for PooledDecoder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.decoder {
            Some(decoder) => decoder.as_mut(),
            None => unreachable!("pooled decoder used after drop"),
        }
    }
}

impl Drop for PooledDecoder {
    fn drop(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            self.pool.give_back(decoder);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
