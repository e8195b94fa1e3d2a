//! memsync core library
//!
//! Conflict-free replication of memory entries across hosts, using a git
//! repository as transport. Each host stamps its entries with replica
//! metadata and backs them up as its own file; any host can merge all files
//! into one Last-Write-Wins view. Git merge conflicts on memory files are
//! resolved with the same merge engine.

pub mod config;
pub mod entry;
pub mod error;
pub mod git;
pub mod guard;
pub mod merge;
pub mod metadata;
pub mod obs;
pub mod orchestrator;
pub mod telemetry;
pub mod timestamp;

pub use config::{GitSettings, ResourceLimits, RetryPolicy, SyncConfig};
pub use entry::{EntryId, MemoryEntry, ReplicaEntryList, ReplicaMetadata};
pub use error::{Result, SyncError};
pub use git::{
    BackupOutcome, CommitOutcome, GitBackend, GitCli, GitError, PullOutcome, PushOutcome,
    VersionControl,
};
pub use guard::{detect_probe, MemoryProbe, NoopProbe, ProcfsProbe, ResourceGuard};
pub use merge::{MergeEngine, MergeResult, MergeStats};
pub use metadata::MetadataInjector;
pub use orchestrator::{
    default_host, host_file_name, BackupOrchestrator, BackupStatus, MergeStatus,
    UNIFIED_FILE_NAME,
};
pub use telemetry::init_tracing;

/// memsync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
