//! Pull, commit and push of a host's memory file with retry and backoff.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use super::{
    resolve_conflicts, CommitOutcome, GitError, PullOutcome, PushOutcome, ResolutionReport,
    VersionControl,
};
use crate::config::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::merge::MergeEngine;
use crate::{obs, timestamp};

/// What a successful backup attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub commit: CommitOutcome,
    pub push: PushOutcome,
    /// Attempts used, starting at 1.
    pub attempts: u32,
    /// Conflicts resolved along the way.
    pub resolved: ResolutionReport,
}

/// Drives a [`VersionControl`] through backup attempts.
#[derive(Debug)]
pub struct GitBackend<V> {
    vcs: V,
    engine: MergeEngine,
    retry: RetryPolicy,
}

impl<V: VersionControl> GitBackend<V> {
    pub fn new(vcs: V, engine: MergeEngine, retry: RetryPolicy) -> Self {
        Self { vcs, engine, retry }
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Commit and push `path` for `host`, retrying with backoff.
    ///
    /// Returns `false` once every attempt has failed; errors never escape.
    pub async fn backup(&self, path: &Path, host: &str) -> bool {
        self.run_backup(path, host).await.is_ok()
    }

    /// Like [`GitBackend::backup`], but reports the outcome or the last error.
    pub async fn run_backup(&self, path: &Path, host: &str) -> Result<BackupOutcome> {
        obs::emit_backup_started(host, path);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut resolved = ResolutionReport::default();
        let mut last_err = None;

        for attempt in 0..max_attempts {
            match self.attempt(path, host, &mut resolved).await {
                Ok((commit, push)) => {
                    obs::emit_backup_finished(host, attempt + 1, true);
                    return Ok(BackupOutcome {
                        commit,
                        push,
                        attempts: attempt + 1,
                        resolved,
                    });
                }
                Err(e) => {
                    obs::emit_backup_attempt_failed(host, attempt + 1, &e);
                    last_err = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        obs::emit_backup_finished(host, max_attempts, false);
        Err(last_err.unwrap_or(SyncError::Git(GitError::CommandFailed {
            command: "backup".to_string(),
            stderr: "no attempts made".to_string(),
        })))
    }

    async fn attempt(
        &self,
        path: &Path,
        host: &str,
        resolved: &mut ResolutionReport,
    ) -> Result<(CommitOutcome, PushOutcome)> {
        match self.vcs.pull().await {
            Ok(PullOutcome::Conflicted) => info!("pull stopped on conflicts; resolving"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pull failed; continuing with local state"),
        }
        self.resolve_into(resolved).await?;

        self.vcs.stage(path).await?;
        let message = format!(
            "Memory backup from {host} at {}",
            timestamp::format(Utc::now())
        );
        let commit = self.vcs.commit(&message).await?;
        if commit == CommitOutcome::NothingToCommit {
            info!(path = %path.display(), "memory file unchanged; nothing to commit");
        }

        match self.vcs.push().await {
            Ok(push) => {
                if push == PushOutcome::NoRemote {
                    info!("no remote configured; backup kept locally");
                }
                Ok((commit, push))
            }
            Err(GitError::PushRejected(reason)) => {
                warn!(%reason, "push rejected; reconciling with remote");
                self.reconcile(host, resolved).await?;
                Err(GitError::PushRejected(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Integrate diverged remote state so the next push fast-forwards.
    async fn reconcile(&self, host: &str, resolved: &mut ResolutionReport) -> Result<()> {
        self.vcs.pull().await?;
        self.resolve_into(resolved).await?;
        self.vcs
            .commit(&format!("Merge remote memory state into {host}"))
            .await?;
        Ok(())
    }

    async fn resolve_into(&self, resolved: &mut ResolutionReport) -> Result<()> {
        let report = resolve_conflicts(&self.vcs, &self.engine).await?;
        resolved.merged.extend(report.merged);
        resolved.took_remote.extend(report.took_remote);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::git::fakes::{FakePush, FakeVcs};
    use crate::guard::{NoopProbe, ResourceGuard};
    use std::sync::Arc;
    use std::time::Duration;

    fn backend(vcs: FakeVcs) -> GitBackend<FakeVcs> {
        let guard = ResourceGuard::new(ResourceLimits::default(), Arc::new(NoopProbe));
        GitBackend::new(
            vcs,
            MergeEngine::new(guard),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    const FILE: &str = "memory-h1.json";

    #[tokio::test]
    async fn test_backup_commits_and_pushes() {
        let vcs = FakeVcs::new().with_file(FILE, "[]\n");
        let backend = backend(vcs);
        let outcome = backend.run_backup(Path::new(FILE), "h1").await.unwrap();
        assert_eq!(outcome.commit, CommitOutcome::Committed);
        assert_eq!(outcome.push, PushOutcome::Pushed);
        assert_eq!(outcome.attempts, 1);
        let commits = backend.vcs().commits();
        assert!(commits[0].starts_with("Memory backup from h1 at "));
    }

    #[tokio::test]
    async fn test_offline_backup_succeeds() {
        let backend = backend(FakeVcs::offline().with_file(FILE, "[]\n"));
        let outcome = backend.run_backup(Path::new(FILE), "h1").await.unwrap();
        assert_eq!(outcome.push, PushOutcome::NoRemote);
    }

    #[tokio::test]
    async fn test_pull_failure_is_tolerated() {
        let vcs = FakeVcs::new().with_file(FILE, "[]\n");
        vcs.fail_pulls(5);
        assert!(backend(vcs).backup(Path::new(FILE), "h1").await);
    }

    #[tokio::test]
    async fn test_transient_push_failure_is_retried() {
        let vcs = FakeVcs::new().with_file(FILE, "[]\n");
        vcs.script_push([FakePush::Fail, FakePush::Accept]);
        let backend = backend(vcs);
        let outcome = backend.run_backup(Path::new(FILE), "h1").await.unwrap();
        assert_eq!(outcome.attempts, 2);
        // Second attempt has nothing new to commit but still pushes.
        assert_eq!(outcome.commit, CommitOutcome::NothingToCommit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let vcs = FakeVcs::new().with_file(FILE, "[]\n");
        vcs.script_push([FakePush::Fail, FakePush::Fail, FakePush::Fail]);
        let guard = ResourceGuard::new(ResourceLimits::default(), Arc::new(NoopProbe));
        let backend = GitBackend::new(vcs, MergeEngine::new(guard), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        assert!(!backend.backup(Path::new(FILE), "h1").await);
        // 100 ms after the first failure, 200 ms after the second, none after the last.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_failure() {
        let vcs = FakeVcs::new().with_file(FILE, "[]\n");
        vcs.script_push([FakePush::Fail, FakePush::Fail, FakePush::Fail]);
        let backend = backend(vcs);
        assert!(!backend.backup(Path::new(FILE), "h1").await);
        assert_eq!(backend.vcs().pushes(), 0);
    }
}
