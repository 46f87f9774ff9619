//! Runs blocking encodes on a bounded worker pool.
//!
//! Each submission waits for a pool permit, then runs on tokio's blocking
//! thread pool while the calling task is suspended. A cancelled or panicked
//! worker, or a pool that has been shut down, surfaces as
//! [`BundleError::Interrupted`] so it can be told apart from an encode error.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::error::{BundleError, BundleResult};

/// Default number of concurrent encodes.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Bounded pool for blocking jobs.
#[derive(Debug, Clone)]
pub struct Offloader {
    permits: Arc<Semaphore>,
    cancel: CancelToken,
}

impl Default for Offloader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl Offloader {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            cancel: CancelToken::new(),
        }
    }

    /// Pool-wide token. Cancelling it interrupts every running job.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stop accepting work and cancel running jobs.
    pub fn shutdown(&self) {
        self.permits.close();
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    /// Run `job` on a worker with a token derived from the pool token.
    pub async fn run<T, F>(&self, job: F) -> BundleResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> BundleResult<T> + Send + 'static,
    {
        self.submit(self.cancel.child(), job).await
    }

    /// Run `job` on a worker, handing it `cancel`.
    ///
    /// One-shot: a failed job is not retried.
    pub async fn submit<T, F>(&self, cancel: CancelToken, job: F) -> BundleResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> BundleResult<T> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BundleError::interrupted("worker pool is shut down"))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(&cancel)
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(BundleError::interrupted("worker was cancelled")),
            Err(e) => {
                tracing::warn!(error = %e, "bundle worker failed");
                Err(BundleError::interrupted(format!("worker failed: {e}")))
            }
        }
    }
}
