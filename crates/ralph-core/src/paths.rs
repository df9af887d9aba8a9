//! Path conventions shared across subsystems (spec §4.7, §6): the
//! managed worktree root layout and the per-run log/summary file names a
//! run's output is written under.

use std::path::{Path, PathBuf};

use crate::worktree::{MergeConflictSlot, WorktreeSlot};

/// The worktree directory for ordinary task work:
/// `<root>/<repo-key>/slot-<N>/<issue>/<task-key>`.
pub fn worktree_path(root: &Path, slot: &WorktreeSlot) -> PathBuf {
    root.join(slot.relative_path())
}

/// The worktree directory for the merge-conflict recovery lane:
/// `<root>/<repo-key>/merge-conflict/<issue>/attempt-<N>`.
pub fn merge_conflict_worktree_path(root: &Path, slot: &MergeConflictSlot) -> PathBuf {
    root.join(slot.relative_path())
}

/// Sanitize a `owner/name` repo slug into a filesystem-safe key, since
/// the slash cannot appear as a path component.
pub fn repo_key(repo: &str) -> String {
    repo.replace('/', "__")
}

/// Per-run append-only event log, one JSON object per line.
pub fn events_log_path(worktree_path: &Path) -> PathBuf {
    worktree_path.join(".ralph").join("events.jsonl")
}

/// Per-run summary written once the session completes.
pub fn summary_path(worktree_path: &Path) -> PathBuf {
    worktree_path.join(".ralph").join("summary.json")
}
