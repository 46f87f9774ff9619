//! Cooperative cancellation for blocking encodes.
//!
//! Encodes poll a [`CancelToken`] between files and between read chunks
//! instead of relying on process-wide signal handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BundleError, BundleResult};

/// Shared cancellation flag.
///
/// Clones share the same flag. A [`child`](Self::child) token reports
/// cancellation when either itself or any ancestor has been cancelled, so a
/// single package can be interrupted without touching its siblings.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Safe point: fail with [`BundleError::Interrupted`] once cancelled.
    pub fn check(&self) -> BundleResult<()> {
        if self.is_cancelled() {
            Err(BundleError::interrupted("cancelled by user"))
        } else {
            Ok(())
        }
    }

    /// Cancel this token when the process receives Ctrl-C.
    ///
    /// Must be called from within a tokio runtime. The returned handle can be
    /// aborted to stop listening.
    pub fn cancel_on_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::warn!("interrupt received, cancelling bundling");
                    token.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
            }
        })
    }
}
