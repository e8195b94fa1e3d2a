//! Stamping entries with replica metadata before they leave the host.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::entry::{unique_id, MemoryEntry, ReplicaEntryList, ReplicaMetadata};
use crate::error::Result;
use crate::guard::ResourceGuard;
use crate::timestamp;

/// Entries processed between two memory checks.
pub const MEMORY_CHECK_INTERVAL: usize = 1000;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Attaches host, timestamp, version and unique id to entries.
#[derive(Clone)]
pub struct MetadataInjector {
    host: String,
    guard: ResourceGuard,
    clock: Clock,
}

impl std::fmt::Debug for MetadataInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataInjector")
            .field("host", &self.host)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl MetadataInjector {
    pub fn new(host: impl Into<String>, guard: ResourceGuard) -> Self {
        Self {
            host: host.into(),
            guard,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to replay writes at fixed times.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Stamp one entry as written by this host now.
    pub fn inject(&self, mut entry: MemoryEntry) -> MemoryEntry {
        let ts = timestamp::format((self.clock)());
        let version = entry.metadata.as_ref().map_or(1, |m| m.version + 1);
        entry.metadata = Some(ReplicaMetadata {
            unique_id: unique_id(&self.host, &entry.id.to_string(), &ts),
            host: self.host.clone(),
            timestamp: ts,
            version,
        });
        entry
    }

    /// Load a JSON array of entries from `path` and stamp each one.
    ///
    /// A missing file, malformed JSON or a non-array document yields an empty
    /// list; only resource ceilings return an error.
    pub fn prepare_memory_file(&self, path: &Path) -> Result<Vec<MemoryEntry>> {
        let label = path.display().to_string();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %label, "memory file not found; nothing to back up");
                return Ok(Vec::new());
            }
            Err(e) => {
                error!(path = %label, error = %e, "failed to read memory file");
                return Ok(Vec::new());
            }
        };

        let values = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(values)) => values,
            Ok(_) => {
                error!(path = %label, "memory file must contain a JSON array");
                return Ok(Vec::new());
            }
            Err(e) => {
                error!(path = %label, error = %e, "memory file is not valid JSON");
                return Ok(Vec::new());
            }
        };
        drop(raw);

        self.guard.validate_entry_count(values.len(), &label)?;
        self.guard.check_memory_bounds()?;

        let list = ReplicaEntryList::from_values(label.clone(), values);
        let mut prepared = Vec::with_capacity(list.len());
        for (i, entry) in list.entries.into_iter().enumerate() {
            if i > 0 && i % MEMORY_CHECK_INTERVAL == 0 {
                self.guard.check_memory_bounds()?;
            }
            prepared.push(self.inject(entry));
        }

        if list.skipped > 0 {
            debug!(path = %label, skipped = list.skipped, "skipped non-entry elements");
        }
        info!(path = %label, entries = prepared.len(), host = %self.host, "prepared memory file");
        Ok(prepared)
    }
}
