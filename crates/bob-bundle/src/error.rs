//! Error types for bundling and unbundling.

use std::io::ErrorKind;
use std::path::PathBuf;

/// Bundle errors.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The aggregate bundle already exists. Bundles are never overwritten.
    #[error("bundle {} already exists", path.display())]
    AlreadyExists { path: PathBuf },

    /// Walking, writing or compressing a workspace failed.
    #[error("cannot bundle workspace {}: {source}", workspace.display())]
    Encode {
        workspace: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encode was cancelled or the worker pool became unusable.
    #[error("bundling interrupted: {reason}")]
    Interrupted { reason: String },

    /// A manifest does not have the expected shape.
    #[error("invalid bundle manifest{}: {message}", display_path(path))]
    InvalidManifest {
        path: Option<PathBuf>,
        message: String,
    },

    /// A per-package archive does not match its recorded digest.
    #[error("digest mismatch for {}: expected {expected}, got {actual}", path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// An exclude pattern could not be compiled.
    #[error("invalid exclude pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Filesystem error outside of an encode.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" {}", p.display()),
        None => String::new(),
    }
}

impl BundleError {
    pub(crate) fn interrupted(reason: impl Into<String>) -> Self {
        Self::Interrupted {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn manifest(message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: None,
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Attach the manifest location to a validation failure.
    pub(crate) fn at_path(self, at: impl Into<PathBuf>) -> Self {
        match self {
            Self::InvalidManifest { path: None, message } => Self::InvalidManifest {
                path: Some(at.into()),
                message,
            },
            other => other,
        }
    }

    /// Returns true if the encode was cancelled or the pool broke down.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Whether the error is retryable.
    ///
    /// Only transient I/O failures qualify. An interrupt means the user asked
    /// to stop, and bad input fails the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Encode { source, .. } | Self::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidPattern { .. } => 1,
            Self::AlreadyExists { .. } => 2,
            Self::Encode { .. } | Self::Io { .. } => 3,
            Self::InvalidManifest { .. } | Self::DigestMismatch { .. } => 4,
            Self::Interrupted { .. } => 130,
        }
    }
}

/// Result type for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;
