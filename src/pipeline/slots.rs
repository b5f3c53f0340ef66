use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::LoadError;

/// Upper bound on concurrent decodes, regardless of request volume.
pub const MAX_DECODE_PARALLELISM: usize = 4;

/// Default number of concurrent decodes.
pub const DEFAULT_DECODE_PARALLELISM: usize = 4;

/// Bounded set of slots for CPU-bound decode work.
///
/// Work runs on the blocking thread pool while holding a slot, so I/O tasks
/// are never starved by decodes and at most `parallelism` decodes run at once.
#[derive(Clone)]
pub struct DecodeSlots {
    semaphore: Arc<Semaphore>,
    parallelism: usize,
}

impl DecodeSlots {
    /// `parallelism` is clamped to `1..=MAX_DECODE_PARALLELISM`.
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.clamp(1, MAX_DECODE_PARALLELISM);
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot, then run `work` on the blocking pool.
    pub async fn run<F, R>(&self, work: F) -> Result<R, LoadError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LoadError::Cancelled)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| LoadError::Interceptor {
            name: "decode".to_string(),
            message: e.to_string(),
        })
    }
}
