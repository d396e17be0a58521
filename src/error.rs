use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network timeout, non-success status or an unreadable remote payload.
    #[error("transient: {0}")]
    Transient(String),

    /// A downloaded asset that is empty or fails to decode.
    #[error("invalid asset {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    /// Self-update failures that must leave the running app untouched.
    #[error("lifecycle: {0}")]
    Lifecycle(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("another instance is running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}
