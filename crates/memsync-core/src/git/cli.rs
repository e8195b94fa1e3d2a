//! [`VersionControl`] backed by the `git` binary.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use super::{CommitOutcome, GitError, GitResult, PullOutcome, PushOutcome, VersionControl};
use crate::config::GitSettings;
use crate::error::{Result, SyncError};

/// Markers git prints when `commit` finds nothing staged.
const NOTHING_TO_COMMIT: &[&str] = &[
    "nothing to commit",
    "nothing added to commit",
    "no changes added to commit",
];

/// Markers of a push refused because the remote moved ahead.
const DIVERGED: &[&str] = &["[rejected]", "non-fast-forward", "fetch first"];

/// Git working tree driven through the command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    settings: GitSettings,
}

impl GitCli {
    /// Open the repository at `root`. Fails unless `root/.git` exists.
    pub fn open(root: impl Into<PathBuf>, settings: GitSettings) -> Result<Self> {
        let root = root.into();
        if !root.join(".git").exists() {
            return Err(SyncError::NotARepository(root));
        }
        Ok(Self { root, settings })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git and return its output whatever the exit status.
    async fn run(&self, args: &[&str]) -> GitResult<Output> {
        let command = args.first().copied().unwrap_or_default().to_string();
        debug!(repo = %self.root.display(), ?args, "running git");

        let child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GitError::Spawn {
                command: command.clone(),
                source,
            })?;

        tokio::time::timeout(self.settings.timeout, child.wait_with_output())
            .await
            .map_err(|_| GitError::Timeout {
                command: command.clone(),
                secs: self.settings.timeout.as_secs(),
            })?
            .map_err(|source| GitError::Spawn { command, source })
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn run_checked(&self, args: &[&str]) -> GitResult<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: combined_output(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn has_remote(&self) -> GitResult<bool> {
        let remotes = self.run_checked(&["remote"]).await?;
        Ok(remotes.lines().any(|r| r.trim() == self.settings.remote))
    }

    /// Current branch name; works on an unborn branch too.
    async fn current_branch(&self) -> GitResult<String> {
        let branch = self.run_checked(&["symbolic-ref", "--short", "HEAD"]).await?;
        Ok(branch.trim().to_string())
    }

    fn path_arg(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn pull(&self) -> GitResult<PullOutcome> {
        if !self.has_remote().await? {
            return Ok(PullOutcome::NoRemote);
        }
        let branch = self.current_branch().await?;
        let output = self
            .run(&[
                "pull",
                "--no-rebase",
                "--no-edit",
                "--allow-unrelated-histories",
                &self.settings.remote,
                &branch,
            ])
            .await?;
        if output.status.success() {
            return Ok(PullOutcome::Updated);
        }
        if !self.list_conflicted_files().await?.is_empty() {
            return Ok(PullOutcome::Conflicted);
        }
        Err(GitError::CommandFailed {
            command: "pull".to_string(),
            stderr: combined_output(&output),
        })
    }

    async fn stage(&self, path: &Path) -> GitResult<()> {
        self.run_checked(&["add", "--", &Self::path_arg(path)])
            .await
            .map(|_| ())
    }

    async fn commit(&self, message: &str) -> GitResult<CommitOutcome> {
        let output = self.run(&["commit", "-m", message]).await?;
        if output.status.success() {
            return Ok(CommitOutcome::Committed);
        }
        let text = combined_output(&output);
        if NOTHING_TO_COMMIT.iter().any(|m| text.contains(m)) {
            return Ok(CommitOutcome::NothingToCommit);
        }
        Err(GitError::CommandFailed {
            command: "commit".to_string(),
            stderr: text,
        })
    }

    async fn push(&self) -> GitResult<PushOutcome> {
        if !self.has_remote().await? {
            return Ok(PushOutcome::NoRemote);
        }
        let output = self.run(&["push", &self.settings.remote, "HEAD"]).await?;
        if output.status.success() {
            return Ok(PushOutcome::Pushed);
        }
        let text = combined_output(&output);
        if DIVERGED.iter().any(|m| text.contains(m)) {
            return Err(GitError::PushRejected(text));
        }
        Err(GitError::CommandFailed {
            command: "push".to_string(),
            stderr: text,
        })
    }

    async fn list_conflicted_files(&self) -> GitResult<Vec<PathBuf>> {
        let out = self
            .run_checked(&["diff", "--name-only", "--diff-filter=U", "-z"])
            .await?;
        Ok(out
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    async fn take_remote_version(&self, path: &Path) -> GitResult<()> {
        let path = Self::path_arg(path);
        self.run_checked(&["checkout", "--theirs", "--", &path])
            .await?;
        self.run_checked(&["add", "--", &path]).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> GitResult<String> {
        Ok(tokio::fs::read_to_string(self.root.join(path)).await?)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> GitResult<()> {
        write_atomic(&self.root.join(path), contents.as_bytes())?;
        Ok(())
    }
}

/// Write through a temp file in the target directory, then rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{}{}", stdout, stderr).trim().to_string()
}
