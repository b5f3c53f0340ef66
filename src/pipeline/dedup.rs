//! In-flight request coalescing.
//!
//! # Singleflight
//!
//! The first caller for a key becomes the leader: it spawns the producer as
//! its own task and waits on a `watch` channel like everyone else. Later
//! callers find the entry and attach as followers. Looking up the entry and
//! attaching happen under one lock, and so does publishing (removing the entry
//! and sending the value), so a caller either attaches before publication and
//! is guaranteed to see the value, or arrives after and starts a new producer.
//!
//! # Cancellation
//!
//! Waiters are counted. A waiter that goes away (its future is dropped)
//! decrements the count; the producer task is aborted only when the count
//! reaches zero. Because the producer runs in its own task, the leader going
//! away does not disturb its followers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::LoadError;

type Slot<T> = Option<Result<T, LoadError>>;

struct Call<T> {
    id: u64,
    result: watch::Receiver<Slot<T>>,
    waiters: usize,
    producer: Option<AbortHandle>,
}

type Calls<T> = Arc<Mutex<HashMap<String, Call<T>>>>;

/// Coalesces concurrent executions that share a key.
pub struct InFlight<T> {
    calls: Calls<T>,
    next_id: AtomicU64,
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of keys with a running producer.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callers waiting on `key`, if a producer is running.
    pub fn waiters(&self, key: &str) -> Option<usize> {
        self.calls.lock().get(key).map(|call| call.waiters)
    }

    /// Run `producer` for `key`, or join the execution already running.
    ///
    /// `producer` is only polled if this caller becomes the leader.
    pub async fn run<F>(&self, key: &str, producer: F) -> Result<T, LoadError>
    where
        F: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        let (id, mut result) = {
            let mut calls = self.calls.lock();
            match calls.get_mut(key) {
                Some(call) => {
                    call.waiters += 1;
                    debug!("Joined in-flight load {} ({} waiting)", key, call.waiters);
                    (call.id, call.result.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let task = tokio::spawn(publish(
                        self.calls.clone(),
                        key.to_string(),
                        id,
                        tx,
                        producer,
                    ));
                    calls.insert(
                        key.to_string(),
                        Call {
                            id,
                            result: rx.clone(),
                            waiters: 1,
                            producer: Some(task.abort_handle()),
                        },
                    );
                    (id, rx)
                }
            }
        };

        let mut waiter = Waiter {
            calls: &self.calls,
            key,
            id,
            attached: true,
        };

        let outcome = match result.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(LoadError::Cancelled)),
            // Producer task ended without publishing (panicked)
            Err(_) => Err(LoadError::Interceptor {
                name: "producer".to_string(),
                message: "producer ended without a result".to_string(),
            }),
        };
        waiter.attached = false;
        outcome
    }
}

impl<T> Default for InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Producer task body: run, then publish under the lock.
async fn publish<T, F>(
    calls: Calls<T>,
    key: String,
    id: u64,
    tx: watch::Sender<Slot<T>>,
    producer: F,
) where
    F: Future<Output = Result<T, LoadError>>,
{
    let result = producer.await;
    let mut calls = calls.lock();
    if calls.get(&key).is_some_and(|call| call.id == id) {
        calls.remove(&key);
    }
    tx.send_replace(Some(result));
}

/// Unregisters a waiter whose future is dropped before the result arrives.
struct Waiter<'a, T> {
    calls: &'a Calls<T>,
    key: &'a str,
    id: u64,
    attached: bool,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        let mut calls = self.calls.lock();
        let Some(call) = calls.get_mut(self.key) else {
            return;
        };
        if call.id != self.id {
            return;
        }
        call.waiters -= 1;
        if call.waiters == 0 {
            if let Some(call) = calls.remove(self.key) {
                debug!("Last waiter left, aborting load {}", self.key);
                if let Some(producer) = call.producer {
                    producer.abort();
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
