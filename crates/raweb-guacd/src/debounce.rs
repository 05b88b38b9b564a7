//! Coalescing delay: only the most recently scheduled action runs.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Runs the latest scheduled action after a quiet period.
///
/// Scheduling again before the delay elapses cancels the pending action and
/// restarts the delay. An action that has already started is left alone.
#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => action().await,
            }
        });
    }

    /// Drop the pending action, if any.
    pub fn cancel(&self) {
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}
