//! In-memory [`VersionControl`] for tests.
//!
//! `FakeVcs` keeps a working tree, an index and a committed snapshot in
//! maps. Remote behaviour is scripted: queued remote changes arrive on the
//! next pull (conflicting with local edits when both touched a file), and
//! push results can be queued one by one.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommitOutcome, GitError, GitResult, PullOutcome, PushOutcome, VersionControl};

/// Scripted result of one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakePush {
    Accept,
    /// Remote has diverged.
    Reject,
    /// Transport failure.
    Fail,
}

#[derive(Debug, Default)]
struct FakeState {
    has_remote: bool,
    worktree: BTreeMap<PathBuf, String>,
    index: BTreeMap<PathBuf, String>,
    head: BTreeMap<PathBuf, String>,
    conflicted: BTreeSet<PathBuf>,
    theirs: BTreeMap<PathBuf, String>,
    merging: bool,
    incoming: Vec<(PathBuf, String)>,
    push_script: VecDeque<FakePush>,
    pull_failures: usize,
    commits: Vec<String>,
    pushes: usize,
}

/// In-memory version control double.
#[derive(Debug)]
pub struct FakeVcs {
    state: Mutex<FakeState>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVcs {
    /// Repository with a reachable remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                has_remote: true,
                ..FakeState::default()
            }),
        }
    }

    /// Repository without any remote configured.
    pub fn offline() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Seed a working-tree file.
    pub fn with_file(self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.lock().worktree.insert(path.into(), contents.to_string());
        self
    }

    /// Deliver `contents` for `path` from the remote on the next pull.
    pub fn queue_remote_change(&self, path: impl Into<PathBuf>, contents: &str) {
        self.lock()
            .incoming
            .push((path.into(), contents.to_string()));
    }

    /// Queue push results; once exhausted, pushes are accepted.
    pub fn script_push(&self, results: impl IntoIterator<Item = FakePush>) {
        self.lock().push_script.extend(results);
    }

    /// Make the next `n` pulls fail.
    pub fn fail_pulls(&self, n: usize) {
        self.lock().pull_failures = n;
    }

    /// Current working-tree contents of `path`.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.lock().worktree.get(path.as_ref()).cloned()
    }

    /// Committed contents of `path`.
    pub fn committed(&self, path: impl AsRef<Path>) -> Option<String> {
        self.lock().head.get(path.as_ref()).cloned()
    }

    pub fn commits(&self) -> Vec<String> {
        self.lock().commits.clone()
    }

    pub fn pushes(&self) -> usize {
        self.lock().pushes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn failed(command: &str, stderr: &str) -> GitError {
    GitError::CommandFailed {
        command: command.to_string(),
        stderr: stderr.to_string(),
    }
}

fn with_newline(s: &str) -> String {
    if s.ends_with('\n') {
        s.to_string()
    } else {
        format!("{s}\n")
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn pull(&self) -> GitResult<PullOutcome> {
        let mut state = self.lock();
        if !state.has_remote {
            return Ok(PullOutcome::NoRemote);
        }
        if state.pull_failures > 0 {
            state.pull_failures -= 1;
            return Err(failed("pull", "could not read from remote repository"));
        }

        let incoming = std::mem::take(&mut state.incoming);
        let mut conflicted = false;
        for (path, remote) in incoming {
            match state.worktree.get(&path).cloned() {
                Some(local) if local != remote => {
                    let text = format!(
                        "<<<<<<< HEAD\n{}=======\n{}>>>>>>> origin/main\n",
                        with_newline(&local),
                        with_newline(&remote)
                    );
                    state.worktree.insert(path.clone(), text);
                    state.theirs.insert(path.clone(), remote);
                    state.conflicted.insert(path);
                    conflicted = true;
                }
                _ => {
                    state.worktree.insert(path.clone(), remote.clone());
                    state.head.insert(path, remote);
                }
            }
        }

        if conflicted {
            state.merging = true;
            Ok(PullOutcome::Conflicted)
        } else {
            Ok(PullOutcome::Updated)
        }
    }

    async fn stage(&self, path: &Path) -> GitResult<()> {
        let mut state = self.lock();
        let contents = state
            .worktree
            .get(path)
            .cloned()
            .ok_or_else(|| failed("add", "pathspec did not match any files"))?;
        state.conflicted.remove(path);
        state.index.insert(path.to_path_buf(), contents);
        Ok(())
    }

    async fn commit(&self, message: &str) -> GitResult<CommitOutcome> {
        let mut state = self.lock();
        if !state.conflicted.is_empty() {
            return Err(failed("commit", "you have unmerged files"));
        }
        let staged = std::mem::take(&mut state.index);
        let changed = staged
            .iter()
            .any(|(path, contents)| state.head.get(path) != Some(contents));
        if !changed && !state.merging {
            return Ok(CommitOutcome::NothingToCommit);
        }
        state.head.extend(staged);
        state.merging = false;
        state.commits.push(message.to_string());
        Ok(CommitOutcome::Committed)
    }

    async fn push(&self) -> GitResult<PushOutcome> {
        let mut state = self.lock();
        if !state.has_remote {
            return Ok(PushOutcome::NoRemote);
        }
        match state.push_script.pop_front().unwrap_or(FakePush::Accept) {
            FakePush::Accept => {
                state.pushes += 1;
                Ok(PushOutcome::Pushed)
            }
            FakePush::Reject => Err(GitError::PushRejected(
                "! [rejected] HEAD -> main (fetch first)".to_string(),
            )),
            FakePush::Fail => Err(failed("push", "connection reset")),
        }
    }

    async fn list_conflicted_files(&self) -> GitResult<Vec<PathBuf>> {
        Ok(self.lock().conflicted.iter().cloned().collect())
    }

    async fn take_remote_version(&self, path: &Path) -> GitResult<()> {
        let mut state = self.lock();
        let remote = state
            .theirs
            .remove(path)
            .ok_or_else(|| failed("checkout", "path does not have their version"))?;
        state.worktree.insert(path.to_path_buf(), remote.clone());
        state.index.insert(path.to_path_buf(), remote);
        state.conflicted.remove(path);
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> GitResult<String> {
        self.lock().worktree.get(path).cloned().ok_or_else(|| {
            GitError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ))
        })
    }

    async fn write_file(&self, path: &Path, contents: &str) -> GitResult<()> {
        self.lock()
            .worktree
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }
}
