//! memsync - replicate memory entries across hosts through a git remote.
//!
//! ## Modes
//!
//! - `--backup --file F`: stamp the entries in `F` with this host's replica
//!   metadata, write them as `memory-{host}.json` and commit/push.
//! - `--merge`: merge every `memory-*.json` in the repository into one
//!   Last-Write-Wins view (`unified-memory.json` by default).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::{error, info, Level};

use memsync_core::{
    default_host, BackupOrchestrator, BackupStatus, GitSettings, MergeStatus, ResourceLimits,
    RetryPolicy, SyncConfig,
};

#[derive(Parser, Debug)]
#[command(name = "memsync")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Conflict-free memory backup and merge over git", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["backup", "merge"])))]
struct Cli {
    /// Back up a memory file for this host
    #[arg(long)]
    backup: bool,

    /// Merge all host files into one unified view
    #[arg(long)]
    merge: bool,

    /// Memory file to back up (JSON array of entries)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Host name recorded in replica metadata (default: this machine)
    #[arg(long)]
    host: Option<String>,

    /// Git repository holding the host files (default: current directory)
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// Output path for the merged view (default: {repo}/unified-memory.json)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum entries per file or merged result
    #[arg(long, env = "MEMSYNC_MAX_ENTRIES", default_value_t = 10_000)]
    max_entries: usize,

    /// Process memory ceiling in megabytes
    #[arg(long, env = "MEMSYNC_MAX_MEMORY_MB", default_value_t = 512)]
    max_memory_mb: u64,

    /// Timeout for each git command, in seconds
    #[arg(long, env = "MEMSYNC_GIT_TIMEOUT_SECS", default_value_t = 30)]
    git_timeout_secs: u64,

    /// Git remote to pull from and push to
    #[arg(long, env = "MEMSYNC_REMOTE", default_value = "origin")]
    remote: String,

    /// Backup attempts before giving up
    #[arg(long, env = "MEMSYNC_RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,
}

impl Cli {
    fn config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_limits(ResourceLimits::new(
                self.max_memory_mb.saturating_mul(1024 * 1024),
                self.max_entries,
            ))
            .with_git(
                GitSettings::default()
                    .with_timeout(Duration::from_secs(self.git_timeout_secs))
                    .with_remote(self.remote.clone())
                    .with_retry(RetryPolicy {
                        max_attempts: self.retry_attempts,
                        ..RetryPolicy::default()
                    }),
            )
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    memsync_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the selected mode. `Ok(false)` maps to exit code 1.
async fn run(cli: Cli) -> Result<bool> {
    if cli.backup && cli.file.is_none() {
        eprintln!("error: --backup requires --file <path>");
        return Ok(false);
    }

    let config = cli.config();
    let orchestrator = BackupOrchestrator::open(&cli.repo, &config)
        .with_context(|| format!("Failed to open repository {}", cli.repo.display()))?;

    match cli.file.as_deref() {
        Some(file) if cli.backup => {
            let host = cli.host.clone().unwrap_or_else(default_host);
            cmd_backup(&orchestrator, file, &host).await
        }
        _ => cmd_merge(&orchestrator, cli.output.as_deref()),
    }
}

async fn cmd_backup<V: memsync_core::VersionControl>(
    orchestrator: &BackupOrchestrator<V>,
    file: &Path,
    host: &str,
) -> Result<bool> {
    let status = orchestrator
        .backup(file, host)
        .await
        .with_context(|| format!("Backup of {} failed", file.display()))?;

    match &status {
        BackupStatus::NothingToBackUp => {
            println!("Nothing to back up from {}", file.display());
        }
        BackupStatus::Completed {
            path,
            entries,
            outcome,
        } => {
            info!(attempts = outcome.attempts, push = ?outcome.push, "backup complete");
            println!("Backed up {} entries to {}", entries, path.display());
        }
        BackupStatus::Failed { path, entries } => {
            eprintln!(
                "Backup of {} entries to {} failed; see log for details",
                entries,
                path.display()
            );
        }
    }

    Ok(status.is_success())
}

fn cmd_merge<V: memsync_core::VersionControl>(
    orchestrator: &BackupOrchestrator<V>,
    output: Option<&Path>,
) -> Result<bool> {
    let status = orchestrator.merge(output).context("Merge failed")?;
    match status {
        MergeStatus::NoInputs => {
            println!(
                "No memory files found in {}",
                orchestrator.repo().display()
            );
        }
        MergeStatus::Written { path, files, stats } => {
            println!(
                "Merged {} entries from {} files into {}",
                stats.output,
                files.len(),
                path.display()
            );
        }
    }
    Ok(true)
}
