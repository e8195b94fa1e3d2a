//! Runtime configuration for resource ceilings and git transport.
//!
//! Every component takes its settings explicitly so tests can run with tight
//! bounds and short timeouts. [`SyncConfig::default`] carries the production
//! values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default process memory ceiling (512 MB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Default per-file entry ceiling.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default timeout for a single git command.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level configuration handed to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub limits: ResourceLimits,
    pub git: GitSettings,
}

impl SyncConfig {
    /// Replace the resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the git settings.
    pub fn with_git(mut self, git: GitSettings) -> Self {
        self.git = git;
        self
    }
}

/// Ceilings enforced by [`crate::guard::ResourceGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Resident memory above which operations abort.
    pub max_memory_bytes: u64,
    /// Maximum entries accepted from a single file or produced by a merge.
    pub max_entries: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl ResourceLimits {
    pub fn new(max_memory_bytes: u64, max_entries: usize) -> Self {
        Self {
            max_memory_bytes,
            max_entries,
        }
    }

    /// Memory ceiling in whole megabytes.
    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_bytes / (1024 * 1024)
    }
}

/// Settings for the git transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSettings {
    /// Hard timeout for each git invocation.
    pub timeout: Duration,
    /// Remote to pull from and push to.
    pub remote: String,
    pub retry: RetryPolicy,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GIT_TIMEOUT,
            remote: "origin".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl GitSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff policy for backup attempts.
///
/// After failed attempt `n` (zero-based) the backend sleeps
/// `base_delay * 2^n` before trying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay to wait after the given failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}
