//! Backup and merge workflows over a replica repository.
//!
//! Backup: stamp a local entry file, write it as `memory-{host}.json` and
//! hand it to [`GitBackend`]. Merge: load every `memory-*.json` in the
//! repository and write the converged view.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::entry::{to_json_array, ReplicaEntryList};
use crate::error::Result;
use crate::git::cli::write_atomic;
use crate::git::{BackupOutcome, GitBackend, GitCli, VersionControl};
use crate::guard::ResourceGuard;
use crate::merge::{MergeEngine, MergeStats};
use crate::metadata::MetadataInjector;
use crate::obs;

/// File name of the merged view, relative to the repository.
pub const UNIFIED_FILE_NAME: &str = "unified-memory.json";

const HOST_FILE_PREFIX: &str = "memory-";
const HOST_FILE_SUFFIX: &str = ".json";

/// Result of a backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStatus {
    /// The input had no entries; nothing was written.
    NothingToBackUp,
    /// Entries were committed (and pushed when a remote exists).
    Completed {
        path: PathBuf,
        entries: usize,
        outcome: BackupOutcome,
    },
    /// The host file was written but git exhausted its retries.
    Failed { path: PathBuf, entries: usize },
}

impl BackupStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, BackupStatus::Failed { .. })
    }
}

/// Result of a merge run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    /// No `memory-*.json` files were found.
    NoInputs,
    Written {
        path: PathBuf,
        files: Vec<PathBuf>,
        stats: MergeStats,
    },
}

/// Coordinates injector, merge engine and git backend for one repository.
#[derive(Debug)]
pub struct BackupOrchestrator<V> {
    repo: PathBuf,
    guard: ResourceGuard,
    backend: GitBackend<V>,
}

impl BackupOrchestrator<GitCli> {
    /// Open `repo` with the git CLI. Fails unless `repo` is a git work tree.
    pub fn open(repo: impl Into<PathBuf>, config: &SyncConfig) -> Result<Self> {
        let repo = repo.into();
        let vcs = GitCli::open(&repo, config.git.clone())?;
        Ok(Self::with_vcs(
            repo,
            config,
            vcs,
            ResourceGuard::detect(config.limits),
        ))
    }
}

impl<V: VersionControl> BackupOrchestrator<V> {
    /// Build over any [`VersionControl`].
    pub fn with_vcs(
        repo: impl Into<PathBuf>,
        config: &SyncConfig,
        vcs: V,
        guard: ResourceGuard,
    ) -> Self {
        let engine = MergeEngine::new(guard.clone());
        Self {
            repo: repo.into(),
            backend: GitBackend::new(vcs, engine, config.git.retry),
            guard,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn backend(&self) -> &GitBackend<V> {
        &self.backend
    }

    /// Stamp `file` as written by `host` and back it up.
    ///
    /// Errors are resource ceilings or failures writing the host file; git
    /// failures become [`BackupStatus::Failed`].
    pub async fn backup(&self, file: &Path, host: &str) -> Result<BackupStatus> {
        let injector = MetadataInjector::new(host, self.guard.clone());
        let entries = injector.prepare_memory_file(file)?;
        if entries.is_empty() {
            info!(file = %file.display(), "no entries to back up");
            return Ok(BackupStatus::NothingToBackUp);
        }

        let rel = host_file_name(host);
        self.backend
            .vcs()
            .write_file(&rel, &to_json_array(&entries)?)
            .await?;

        let count = entries.len();
        match self.backend.run_backup(&rel, host).await {
            Ok(outcome) => Ok(BackupStatus::Completed {
                path: self.repo.join(&rel),
                entries: count,
                outcome,
            }),
            Err(e) if e.is_resource_exceeded() => Err(e),
            Err(e) => {
                error!(host = %host, error = %e, "backup failed after retries");
                Ok(BackupStatus::Failed {
                    path: self.repo.join(&rel),
                    entries: count,
                })
            }
        }
    }

    /// Merge every host file in the repository into `output`.
    ///
    /// `output` defaults to `{repo}/unified-memory.json`.
    pub fn merge(&self, output: Option<&Path>) -> Result<MergeStatus> {
        let files = self.host_files()?;
        if files.is_empty() {
            info!(repo = %self.repo.display(), "no memory files to merge");
            return Ok(MergeStatus::NoInputs);
        }

        let mut lists = Vec::with_capacity(files.len());
        let mut used = Vec::with_capacity(files.len());
        for path in files {
            if let Some(list) = self.load_replica(&path)? {
                lists.push(list);
                used.push(path);
            }
        }

        let merged = MergeEngine::new(self.guard.clone()).merge(lists)?;
        let out = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.repo.join(UNIFIED_FILE_NAME));
        write_atomic(&out, to_json_array(&merged.entries)?.as_bytes())?;

        obs::emit_merge_completed(&out, &merged.stats);
        Ok(MergeStatus::Written {
            path: out,
            files: used,
            stats: merged.stats,
        })
    }

    /// `memory-*.json` files in the repository root, sorted by name.
    fn host_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.repo)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(HOST_FILE_PREFIX) && name.ends_with(HOST_FILE_SUFFIX)
            })
            .map(|entry| entry.path())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Load one host file. Unreadable or malformed files are logged and
    /// excluded; only a breached entry ceiling is an error.
    fn load_replica(&self, path: &Path) -> Result<Option<ReplicaEntryList>> {
        let label = path.display().to_string();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %label, error = %e, "failed to read memory file; excluding");
                return Ok(None);
            }
        };
        let values = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(values)) => values,
            Ok(_) => {
                warn!(path = %label, "memory file is not a JSON array; excluding");
                return Ok(None);
            }
            Err(e) => {
                warn!(path = %label, error = %e, "memory file is not valid JSON; excluding");
                return Ok(None);
            }
        };
        self.guard.validate_entry_count(values.len(), &label)?;
        self.guard.check_memory_bounds()?;
        Ok(Some(ReplicaEntryList::from_values(label, values)))
    }
}

/// Repository-relative path of a host's memory file.
///
/// Characters that are unsafe in file names are replaced with `-`.
pub fn host_file_name(host: &str) -> PathBuf {
    let safe: String = host
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let safe = if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        safe
    };
    PathBuf::from(format!("{HOST_FILE_PREFIX}{safe}{HOST_FILE_SUFFIX}"))
}

/// Best-effort name of this machine.
pub fn default_host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
