//! Structured observability hooks for backup and merge lifecycle events.
//!
//! Events are emitted at `info!` level (warnings for failed attempts) with a
//! stable `event` field so log pipelines can filter on them. Verbosity follows
//! `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use std::path::Path;

use tracing::{info, warn};

use crate::merge::MergeStats;

/// Emit event: a backup of `path` started for `host`.
pub fn emit_backup_started(host: &str, path: &Path) {
    info!(event = "backup.started", host = %host, path = %path.display());
}

/// Emit event: one backup attempt failed (warning level).
pub fn emit_backup_attempt_failed(host: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "backup.attempt_failed",
        host = %host,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: backup finished after `attempts` tries.
pub fn emit_backup_finished(host: &str, attempts: u32, success: bool) {
    info!(
        event = "backup.finished",
        host = %host,
        attempts = attempts,
        success = success,
    );
}

/// Emit event: replicas merged into `output`.
pub fn emit_merge_completed(output: &Path, stats: &MergeStats) {
    info!(
        event = "merge.completed",
        output = %output.display(),
        inputs = stats.inputs,
        entries_seen = stats.entries_seen,
        skipped = stats.skipped,
        recovered = stats.recovered,
        superseded = stats.superseded,
        entries = stats.output,
    );
}

/// Emit event: a conflicted file was resolved with `strategy`.
pub fn emit_conflict_resolved(path: &Path, strategy: &str, entries: usize) {
    info!(
        event = "conflict.resolved",
        path = %path.display(),
        strategy = %strategy,
        entries = entries,
    );
}
