//! Git transport for replica files.
//!
//! [`VersionControl`] is the narrow surface memsync needs from a version
//! control system. [`GitCli`] implements it by shelling out to `git`;
//! [`fakes::FakeVcs`] is an in-memory stand-in for tests. All paths are
//! relative to the repository root.

pub mod backend;
pub mod cli;
pub mod conflict;
pub mod fakes;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub use backend::{BackupOutcome, GitBackend};
pub use cli::GitCli;
pub use conflict::{resolve_conflicts, split_conflict_markers, ConflictSides, ResolutionReport};

/// Errors from git operations.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("push rejected by remote: {0}")]
    PushRejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = std::result::Result<T, GitError>;

/// What a pull did to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Remote state integrated, or already up to date.
    Updated,
    /// The merge stopped with unmerged paths.
    Conflicted,
    /// No remote is configured.
    NoRemote,
}

/// Whether a commit recorded anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

/// Whether a push reached a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    NoRemote,
}

/// Version control operations used by backup and conflict resolution.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Integrate the remote branch into the local one.
    async fn pull(&self) -> GitResult<PullOutcome>;

    /// Add `path` to the index.
    async fn stage(&self, path: &Path) -> GitResult<()>;

    /// Commit the index. An empty diff is [`CommitOutcome::NothingToCommit`].
    async fn commit(&self, message: &str) -> GitResult<CommitOutcome>;

    /// Push the current branch. Divergence is [`GitError::PushRejected`].
    async fn push(&self) -> GitResult<PushOutcome>;

    /// Paths with unresolved merge conflicts.
    async fn list_conflicted_files(&self) -> GitResult<Vec<PathBuf>>;

    /// Resolve `path` by taking the remote side and staging it.
    async fn take_remote_version(&self, path: &Path) -> GitResult<()>;

    /// Read a working-tree file.
    async fn read_file(&self, path: &Path) -> GitResult<String>;

    /// Replace a working-tree file.
    async fn write_file(&self, path: &Path, contents: &str) -> GitResult<()>;
}
