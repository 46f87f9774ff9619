//! Per-package progress reporting.

use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of one bundling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Executed,
    Failed,
}

/// Reported once per bundled (not excluded) package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    pub workspace: PathBuf,
    pub message: String,
    pub kind: ReportKind,
}

/// Sink for bundle reports. The run calls this after each package finishes.
pub type ReportSink = Arc<dyn Fn(&BundleReport) + Send + Sync>;
