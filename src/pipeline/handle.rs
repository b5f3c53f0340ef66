//! Request handles and lifecycle events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tracing::debug;

use super::chain::ImageResult;
use crate::error::LoadError;
use crate::request::RequestKey;

/// Steps reported through [`LoadEvent::Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStage {
    /// Source bytes are being fetched
    Fetching,
    /// Source bytes are available
    Fetched,
    /// Waiting for or holding a decode slot
    Decoding,
    /// Applying transformations
    Transforming,
}

/// Lifecycle of a submitted request.
///
/// Every handle sees `Started` first and exactly one terminal event
/// (`Success`, `Error` or `Cancelled`) last. `Progress` events are only
/// reported to the handle whose execution drives the shared producer; a
/// handle that joined an in-flight load goes straight to the terminal event.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    Started { request_key: RequestKey },
    Progress { stage: LoadStage },
    Success(ImageResult),
    Error(LoadError),
    Cancelled,
}

impl LoadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoadEvent::Success(_) | LoadEvent::Error(_) | LoadEvent::Cancelled
        )
    }
}

/// Sends the terminal event exactly once, whoever gets there first.
#[derive(Clone)]
pub(crate) struct TerminalSender {
    events: UnboundedSender<LoadEvent>,
    finished: Arc<AtomicBool>,
}

impl TerminalSender {
    pub(crate) fn new(events: UnboundedSender<LoadEvent>) -> Self {
        Self {
            events,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn events(&self) -> &UnboundedSender<LoadEvent> {
        &self.events
    }

    /// Returns `false` if a terminal event was already sent.
    pub(crate) fn finish(&self, event: LoadEvent) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.events.send(event);
        true
    }
}

/// Handle to a request started with [`ImageLoader::submit`](super::ImageLoader::submit).
///
/// Dropping the handle does not cancel the request; call [`cancel`](Self::cancel).
pub struct RequestHandle {
    request_key: RequestKey,
    events: UnboundedReceiver<LoadEvent>,
    terminal: TerminalSender,
    task: AbortHandle,
    done: bool,
}

impl RequestHandle {
    pub(crate) fn new(
        request_key: RequestKey,
        events: UnboundedReceiver<LoadEvent>,
        terminal: TerminalSender,
        task: AbortHandle,
    ) -> Self {
        Self {
            request_key,
            events,
            terminal,
            task,
            done: false,
        }
    }

    pub fn request_key(&self) -> &RequestKey {
        &self.request_key
    }

    /// Stop waiting for the result.
    ///
    /// A producer shared with other requests keeps running for them; it is
    /// only aborted once no request is waiting on it.
    pub fn cancel(&self) {
        if self.terminal.finish(LoadEvent::Cancelled) {
            debug!("Cancelled {}", self.request_key);
            self.task.abort();
        }
    }

    /// Next lifecycle event, or `None` after the terminal event was consumed.
    pub async fn next_event(&mut self) -> Option<LoadEvent> {
        if self.done {
            return None;
        }
        let event = self.events.recv().await?;
        self.done = event.is_terminal();
        Some(event)
    }

    /// Wait for the terminal event, discarding progress.
    pub async fn result(mut self) -> Result<ImageResult, LoadError> {
        while let Some(event) = self.next_event().await {
            match event {
                LoadEvent::Success(result) => return Ok(result),
                LoadEvent::Error(err) => return Err(err),
                LoadEvent::Cancelled => return Err(LoadError::Cancelled),
                LoadEvent::Started { .. } | LoadEvent::Progress { .. } => {}
            }
        }
        Err(LoadError::Cancelled)
    }
}
