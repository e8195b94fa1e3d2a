//! Resource ceilings for entry counts and process memory.
//!
//! Backups and merges fail outright when a ceiling is breached; truncating
//! the data instead would silently corrupt backup history.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ResourceLimits;
use crate::error::{Result, SyncError};

/// Fraction of the memory ceiling at which a warning is logged.
const MEMORY_WARN_RATIO: f64 = 0.8;

/// Multiple of the entry ceiling tolerated for a combined merge workload.
const MERGE_WORKLOAD_FACTOR: usize = 2;

/// Source of resident-memory samples.
pub trait MemoryProbe: Send + Sync {
    /// Current resident set size in bytes, or `None` when unavailable.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Resident set size from procfs.
///
/// Prefers the `Rss:` line of `/proc/self/smaps_rollup`, which is in kB and
/// independent of the page size. Kernels older than 4.14 lack that file;
/// there the resident page count from `/proc/self/statm` is used instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsProbe;

impl ProcfsProbe {
    const ROLLUP_PATH: &'static str = "/proc/self/smaps_rollup";
    const STATM_PATH: &'static str = "/proc/self/statm";
    /// Assumed page size for the `statm` fallback. Hosts with 16K or 64K
    /// pages (some aarch64 kernels) are under-reported by that factor.
    const FALLBACK_PAGE_SIZE: u64 = 4096;

    /// Whether either procfs source can be read on this host.
    pub fn is_available() -> bool {
        std::fs::metadata(Self::ROLLUP_PATH).is_ok() || std::fs::metadata(Self::STATM_PATH).is_ok()
    }
}

impl MemoryProbe for ProcfsProbe {
    fn resident_bytes(&self) -> Option<u64> {
        if let Some(rss) = std::fs::read_to_string(Self::ROLLUP_PATH)
            .ok()
            .and_then(|text| rollup_rss_bytes(&text))
        {
            return Some(rss);
        }
        let statm = std::fs::read_to_string(Self::STATM_PATH).ok()?;
        statm_rss_bytes(&statm, Self::FALLBACK_PAGE_SIZE)
    }
}

/// `Rss:` of an `smaps_rollup` dump, in bytes.
fn rollup_rss_bytes(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("Rss:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Second field of `statm` (resident pages), in bytes.
fn statm_rss_bytes(text: &str, page_size: u64) -> Option<u64> {
    text.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u64>().ok())
        .map(|pages| pages * page_size)
}

/// Probe for hosts without memory introspection. Never reports a sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

impl MemoryProbe for NoopProbe {
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

/// Pick the best probe this host supports.
pub fn detect_probe() -> Arc<dyn MemoryProbe> {
    if cfg!(target_os = "linux") && ProcfsProbe::is_available() {
        Arc::new(ProcfsProbe)
    } else {
        debug!("memory introspection unavailable; memory checks disabled");
        Arc::new(NoopProbe)
    }
}

/// Enforces [`ResourceLimits`].
#[derive(Clone)]
pub struct ResourceGuard {
    limits: ResourceLimits,
    probe: Arc<dyn MemoryProbe>,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ResourceGuard {
    pub fn new(limits: ResourceLimits, probe: Arc<dyn MemoryProbe>) -> Self {
        Self { limits, probe }
    }

    /// Guard using the probe detected for this host.
    pub fn detect(limits: ResourceLimits) -> Self {
        Self::new(limits, detect_probe())
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Fail if resident memory is above the ceiling.
    ///
    /// Warns from 80% of the ceiling. Without a probe sample this is a no-op.
    pub fn check_memory_bounds(&self) -> Result<()> {
        let Some(used) = self.probe.resident_bytes() else {
            return Ok(());
        };
        let limit = self.limits.max_memory_bytes;
        let used_mb = used / (1024 * 1024);

        if used > limit {
            return Err(SyncError::MemoryLimitExceeded {
                used_mb,
                limit_mb: self.limits.max_memory_mb(),
            });
        }
        if used as f64 > limit as f64 * MEMORY_WARN_RATIO {
            warn!(
                used_mb,
                limit_mb = self.limits.max_memory_mb(),
                "memory usage approaching limit"
            );
        }
        Ok(())
    }

    /// Fail if `count` exceeds the per-file entry ceiling.
    pub fn validate_entry_count(&self, count: usize, label: &str) -> Result<()> {
        if count > self.limits.max_entries {
            return Err(SyncError::EntryLimitExceeded {
                label: label.to_string(),
                observed: count,
                allowed: self.limits.max_entries,
            });
        }
        Ok(())
    }

    /// Warn when the total input of a merge is unusually large.
    ///
    /// Merging legitimately reads more elements than any single file holds,
    /// so this never fails.
    pub fn check_merge_workload(&self, total: usize) {
        let soft_limit = self.limits.max_entries.saturating_mul(MERGE_WORKLOAD_FACTOR);
        if total > soft_limit {
            warn!(total, soft_limit, "merge workload exceeds soft limit");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Probe reporting a fixed sample.
    pub(crate) struct FixedProbe(pub Option<u64>);

    impl MemoryProbe for FixedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            self.0
        }
    }

    fn guard_with(sample: Option<u64>, max_memory_bytes: u64) -> ResourceGuard {
        ResourceGuard::new(
            ResourceLimits::new(max_memory_bytes, 10),
            Arc::new(FixedProbe(sample)),
        )
    }

    #[test]
    fn test_entry_ceiling_is_inclusive() {
        let guard = guard_with(None, u64::MAX);
        assert!(guard.validate_entry_count(10, "f").is_ok());
        let err = guard.validate_entry_count(11, "f").unwrap_err();
        assert!(matches!(
            err,
            SyncError::EntryLimitExceeded {
                observed: 11,
                allowed: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_memory_above_ceiling_fails() {
        let guard = guard_with(Some(200 * 1024 * 1024), 100 * 1024 * 1024);
        let err = guard.check_memory_bounds().unwrap_err();
        assert!(matches!(
            err,
            SyncError::MemoryLimitExceeded {
                used_mb: 200,
                limit_mb: 100
            }
        ));
    }

    #[test]
    fn test_memory_near_ceiling_only_warns() {
        let guard = guard_with(Some(90), 100);
        assert!(guard.check_memory_bounds().is_ok());
    }

    #[test]
    fn test_missing_probe_is_soft_open() {
        let guard = guard_with(None, 0);
        assert!(guard.check_memory_bounds().is_ok());
        let noop = ResourceGuard::new(ResourceLimits::new(0, 1), Arc::new(NoopProbe));
        assert!(noop.check_memory_bounds().is_ok());
    }

    #[test]
    fn test_merge_workload_never_fails() {
        let guard = guard_with(None, u64::MAX);
        guard.check_merge_workload(1_000);
    }

    #[test]
    fn test_rollup_rss_is_read_in_kilobytes() {
        let text = "55d0c0a00000-7ffd1e9f3000 ---p 00000000 00:00 0    [rollup]\n\
                    Rss:               12345 kB\n\
                    Pss:                6000 kB\n";
        assert_eq!(rollup_rss_bytes(text), Some(12345 * 1024));
        assert_eq!(rollup_rss_bytes("Pss: 10 kB\n"), None);
    }

    #[test]
    fn test_statm_rss_uses_given_page_size() {
        assert_eq!(statm_rss_bytes("1000 250 40 1 0 120 0", 4096), Some(250 * 4096));
        assert_eq!(statm_rss_bytes("1000 250 40", 65536), Some(250 * 65536));
        assert_eq!(statm_rss_bytes("garbage", 4096), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_reports_nonzero_rss() {
        let rss = ProcfsProbe.resident_bytes().unwrap();
        assert!(rss > 0);
    }
}
