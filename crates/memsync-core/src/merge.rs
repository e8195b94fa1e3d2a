//! Last-Write-Wins merge of replica entry lists.
//!
//! Every entry is ranked by `(instant, unique_id)`. For each id the entry with
//! the greatest rank wins; because the rank is a total order that ignores
//! content and input position, the merge is commutative, associative and
//! idempotent. This is the only merge implementation: the CLI merge command
//! and git conflict resolution both go through [`MergeEngine`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::entry::{MemoryEntry, ReplicaEntryList, ReplicaMetadata};
use crate::error::Result;
use crate::guard::ResourceGuard;

/// Counters describing one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Replica lists fed into the merge.
    pub inputs: usize,
    /// Entries read across all inputs.
    pub entries_seen: usize,
    /// Elements dropped because they were not entry objects.
    pub skipped: usize,
    /// Entries given recovery metadata.
    pub recovered: usize,
    /// Entries that lost to a newer or higher-ranked version.
    pub superseded: usize,
    /// Entries in the merged result.
    pub output: usize,
}

/// Converged view of all replicas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeResult {
    /// One entry per id, sorted by `(timestamp, unique_id)`.
    pub entries: Vec<MemoryEntry>,
    pub stats: MergeStats,
}

/// Sort and comparison key of a stamped entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    instant: DateTime<Utc>,
    unique_id: String,
}

impl Rank {
    fn of(meta: &ReplicaMetadata) -> Self {
        Self {
            instant: meta.instant(),
            unique_id: meta.unique_id.clone(),
        }
    }
}

/// Single-pass LWW merge engine.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    guard: ResourceGuard,
}

impl MergeEngine {
    pub fn new(guard: ResourceGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &ResourceGuard {
        &self.guard
    }

    /// Merge any number of replica lists.
    ///
    /// Fails only when the merged result breaches a resource ceiling.
    pub fn merge<I>(&self, lists: I) -> Result<MergeResult>
    where
        I: IntoIterator<Item = ReplicaEntryList>,
    {
        let mut stats = MergeStats::default();
        let mut winners: HashMap<String, (Rank, MemoryEntry)> = HashMap::new();

        for list in lists {
            stats.inputs += 1;
            stats.skipped += list.skipped;
            stats.entries_seen += list.entries.len();
            self.guard.check_merge_workload(stats.entries_seen);

            for mut entry in list.entries {
                let rank = Rank::of(entry.metadata.get_or_insert_with(|| {
                    stats.recovered += 1;
                    debug!(entry_id = %entry.id, source = %list.label, "assigning recovery metadata");
                    ReplicaMetadata::recovery(&entry.id.to_string())
                }));

                let key = entry.id.key();
                match winners.get_mut(&key) {
                    Some(current) => {
                        stats.superseded += 1;
                        if rank > current.0 {
                            *current = (rank, entry);
                        }
                    }
                    None => {
                        winners.insert(key, (rank, entry));
                    }
                }
            }
        }

        let mut ranked: Vec<(Rank, MemoryEntry)> = winners.into_values().collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));
        let entries: Vec<MemoryEntry> = ranked.into_iter().map(|(_, e)| e).collect();

        self.guard.validate_entry_count(entries.len(), "merged result")?;
        self.guard.check_memory_bounds()?;

        stats.output = entries.len();
        debug!(
            inputs = stats.inputs,
            seen = stats.entries_seen,
            output = stats.output,
            "merge complete"
        );
        Ok(MergeResult { entries, stats })
    }

    /// Merge raw JSON arrays, e.g. the two sides of a git conflict.
    pub fn merge_values<I, S>(&self, sides: I) -> Result<MergeResult>
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: Into<String>,
    {
        self.merge(
            sides
                .into_iter()
                .map(|(label, values)| ReplicaEntryList::from_values(label, values)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::error::SyncError;
    use crate::guard::NoopProbe;
    use serde_json::json;
    use std::sync::Arc;

    fn engine(max_entries: usize) -> MergeEngine {
        MergeEngine::new(ResourceGuard::new(
            ResourceLimits::new(u64::MAX, max_entries),
            Arc::new(NoopProbe),
        ))
    }

    fn stamped(id: &str, content: &str, ts: &str, uid: &str) -> MemoryEntry {
        MemoryEntry::new(id)
            .with_field("content", json!(content))
            .with_metadata(ReplicaMetadata {
                host: "h".to_string(),
                timestamp: ts.to_string(),
                version: 1,
                unique_id: uid.to_string(),
            })
    }

    fn list(entries: Vec<MemoryEntry>) -> ReplicaEntryList {
        ReplicaEntryList::new("test", entries)
    }

    #[test]
    fn test_empty_merge_is_empty() {
        let out = engine(10).merge(Vec::new()).unwrap();
        assert!(out.entries.is_empty());
        assert_eq!(out.stats.inputs, 0);
    }

    #[test]
    fn test_newer_timestamp_wins() {
        let old = stamped("m1", "old", "2024-01-01T00:00:00Z", "a");
        let new = stamped("m1", "new", "2024-01-02T00:00:00Z", "a");
        let out = engine(10)
            .merge(vec![list(vec![new]), list(vec![old])])
            .unwrap();
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].field("content"), Some(&json!("new")));
        assert_eq!(out.stats.superseded, 1);
    }

    #[test]
    fn test_equal_instants_in_different_encodings_tie_break_on_unique_id() {
        let a = stamped("m1", "a", "2024-01-01T00:00:00Z", "zzz");
        let b = stamped("m1", "b", "2024-01-01T00:00:00+00:00", "aaa");
        let out = engine(10).merge(vec![list(vec![b]), list(vec![a])]).unwrap();
        assert_eq!(out.entries[0].field("content"), Some(&json!("a")));
    }

    #[test]
    fn test_output_sorted_by_timestamp_then_unique_id() {
        let out = engine(10)
            .merge(vec![list(vec![
                stamped("c", "", "2024-01-03T00:00:00Z", "1"),
                stamped("a", "", "2024-01-01T00:00:00Z", "2"),
                stamped("b", "", "2024-01-01T00:00:00Z", "1"),
            ])])
            .unwrap();
        let ids: Vec<String> = out.entries.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_number_and_string_ids_merge_separately() {
        let out = engine(10)
            .merge_values([
                ("h1", vec![json!({"id": 1, "content": "number"})]),
                ("h2", vec![json!({"id": "1", "content": "text"})]),
            ])
            .unwrap();
        assert_eq!(out.entries.len(), 2);
        assert_eq!(out.stats.superseded, 0);

        let ids: Vec<Value> = out
            .entries
            .iter()
            .map(|e| e.to_value()["id"].clone())
            .collect();
        assert!(ids.contains(&json!(1)));
        assert!(ids.contains(&json!("1")));
    }

    #[test]
    fn test_missing_metadata_gets_recovery_and_loses() {
        let bare = MemoryEntry::new("m1").with_field("content", json!("bare"));
        let real = stamped("m1", "real", "2000-01-01T00:00:00Z", "0");
        let out = engine(10)
            .merge(vec![list(vec![bare.clone()]), list(vec![real])])
            .unwrap();
        assert_eq!(out.entries[0].field("content"), Some(&json!("real")));
        assert_eq!(out.stats.recovered, 1);

        let alone = engine(10).merge(vec![list(vec![bare])]).unwrap();
        assert!(alone.entries[0].metadata.as_ref().unwrap().is_recovery());
    }

    #[test]
    fn test_malformed_timestamp_loses_without_error() {
        let broken = stamped("m1", "broken", "not-a-time", "zzzz");
        let real = stamped("m1", "real", "1999-01-01T00:00:00Z", "0");
        let out = engine(10)
            .merge(vec![list(vec![broken]), list(vec![real])])
            .unwrap();
        assert_eq!(out.entries[0].field("content"), Some(&json!("real")));
    }

    #[test]
    fn test_merged_result_checked_against_ceiling() {
        let a = list(vec![
            stamped("a", "", "2024-01-01T00:00:00Z", "1"),
            stamped("b", "", "2024-01-01T00:00:00Z", "2"),
        ]);
        let b = list(vec![stamped("c", "", "2024-01-01T00:00:00Z", "3")]);
        let err = engine(2).merge(vec![a, b]).unwrap_err();
        assert!(matches!(err, SyncError::EntryLimitExceeded { observed: 3, .. }));
    }

    #[test]
    fn test_merge_values_skips_non_objects() {
        let out = engine(10)
            .merge_values(vec![
                ("ours", vec![json!({"id": "a"}), json!(1)]),
                ("theirs", vec![json!("x"), json!({"id": "b"})]),
            ])
            .unwrap();
        assert_eq!(out.entries.len(), 2);
        assert_eq!(out.stats.skipped, 2);
    }
}
