//! Automatic resolution of git merge conflicts in memory files.
//!
//! JSON memory files are rebuilt from the two sides recorded in git's
//! conflict markers and merged with the same [`MergeEngine`] the merge
//! command uses. Anything that cannot be reconstructed with certainty takes
//! the remote version; remote data is never guessed at or dropped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use super::VersionControl;
use crate::entry::to_json_array;
use crate::error::Result;
use crate::merge::MergeEngine;
use crate::obs;

const OURS_MARKER: &str = "<<<<<<<";
const BASE_MARKER: &str = "|||||||";
const SPLIT_MARKER: &str = "=======";
const THEIRS_MARKER: &str = ">>>>>>>";

/// The two documents recovered from a conflicted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSides {
    /// Local version.
    pub ours: String,
    /// Remote version.
    pub theirs: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Common,
    Ours,
    Base,
    Theirs,
}

/// Rebuild both sides of a conflicted file from its markers.
///
/// Text outside conflict hunks belongs to both sides, so files with several
/// hunks come back as two complete documents. A diff3 base section is
/// dropped. Returns `None` for a file without markers, with unbalanced or
/// nested markers, or with a marker line outside a hunk.
pub fn split_conflict_markers(text: &str) -> Option<ConflictSides> {
    let mut ours = String::with_capacity(text.len());
    let mut theirs = String::with_capacity(text.len());
    let mut section = Section::Common;
    let mut hunks = 0usize;

    for line in text.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\n', '\r']);
        section = match (section, marker_of(bare)) {
            (Section::Common, Some(OURS_MARKER)) => Section::Ours,
            (Section::Ours, Some(BASE_MARKER)) => Section::Base,
            (Section::Ours | Section::Base, Some(SPLIT_MARKER)) => Section::Theirs,
            (Section::Theirs, Some(THEIRS_MARKER)) => {
                hunks += 1;
                Section::Common
            }
            (_, Some(_)) => return None,
            (current, None) => {
                match current {
                    Section::Common => {
                        ours.push_str(line);
                        theirs.push_str(line);
                    }
                    Section::Ours => ours.push_str(line),
                    Section::Theirs => theirs.push_str(line),
                    Section::Base => {}
                }
                current
            }
        };
    }

    (section == Section::Common && hunks > 0).then_some(ConflictSides { ours, theirs })
}

fn marker_of(line: &str) -> Option<&'static str> {
    if line == SPLIT_MARKER {
        return Some(SPLIT_MARKER);
    }
    [OURS_MARKER, BASE_MARKER, THEIRS_MARKER]
        .into_iter()
        .find(|m| line == *m || line.strip_prefix(m).is_some_and(|rest| rest.starts_with(' ')))
}

/// Paths handled by one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    /// JSON files merged entry by entry.
    pub merged: Vec<PathBuf>,
    /// Files resolved by taking the remote version.
    pub took_remote: Vec<PathBuf>,
}

impl ResolutionReport {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty() && self.took_remote.is_empty()
    }
}

/// Resolve every conflicted path in the working tree.
///
/// Fails only on git errors or when a merged file breaches a resource
/// ceiling.
pub async fn resolve_conflicts(
    vcs: &dyn VersionControl,
    engine: &MergeEngine,
) -> Result<ResolutionReport> {
    let mut report = ResolutionReport::default();

    for path in vcs.list_conflicted_files().await? {
        if !is_json(&path) {
            vcs.take_remote_version(&path).await?;
            obs::emit_conflict_resolved(&path, "take_remote", 0);
            report.took_remote.push(path);
            continue;
        }

        let text = vcs.read_file(&path).await?;
        let Some((ours, theirs)) = decode_sides(&path, &text) else {
            vcs.take_remote_version(&path).await?;
            obs::emit_conflict_resolved(&path, "take_remote", 0);
            report.took_remote.push(path);
            continue;
        };

        let label = path.display().to_string();
        let merged = engine.merge_values([
            (format!("{label} (local)"), ours),
            (format!("{label} (remote)"), theirs),
        ])?;
        vcs.write_file(&path, &to_json_array(&merged.entries)?)
            .await?;
        vcs.stage(&path).await?;
        obs::emit_conflict_resolved(&path, "merged", merged.stats.output);
        report.merged.push(path);
    }

    Ok(report)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Split and parse both sides, logging why when that is not possible.
fn decode_sides(path: &Path, text: &str) -> Option<(Vec<Value>, Vec<Value>)> {
    let Some(sides) = split_conflict_markers(text) else {
        warn!(path = %path.display(), "unexpected conflict marker layout; taking remote version");
        return None;
    };
    let parse = |side: &str, body: &str| match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(values)) => Some(values),
        Ok(_) => {
            warn!(path = %path.display(), side, "conflict side is not a JSON array; taking remote version");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), side, error = %e, "conflict side is not valid JSON; taking remote version");
            None
        }
    };
    let ours = parse("local", &sides.ours)?;
    let theirs = parse("remote", &sides.theirs)?;
    Some((ours, theirs))
}
