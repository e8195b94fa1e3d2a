//! Error taxonomy for memsync operations.

use std::path::PathBuf;

use crate::git::GitError;

/// memsync errors.
///
/// Only resource ceilings, repository discovery and git transport surface as
/// errors. Malformed input files and elements are logged and skipped at the
/// smallest scope instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("entry limit exceeded for {label}: {observed} entries (max {allowed})")]
    EntryLimitExceeded {
        label: String,
        observed: usize,
        allowed: usize,
    },

    #[error("memory limit exceeded: {used_mb} MB in use (max {limit_mb} MB)")]
    MemoryLimitExceeded { used_mb: u64, limit_mb: u64 },

    #[error("not a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this error is a resource ceiling breach.
    pub fn is_resource_exceeded(&self) -> bool {
        matches!(
            self,
            SyncError::EntryLimitExceeded { .. } | SyncError::MemoryLimitExceeded { .. }
        )
    }
}

/// Result type for memsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
