//! Merge-Conflict Recovery Lane (spec §4.9): a dedicated worktree, a
//! no-commit merge to enumerate conflicts, a signature-based no-progress
//! check, bounded agent-assisted attempts, and a comment-marker lease so
//! two Workers never recover the same PR at once.

use sha2::{Digest, Sha256};
use sqlx::PgPool;

use ralph_db::models::LeaseScope;
use ralph_db::queries::leases;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const LEASE_TTL_SECS: i64 = 20 * 60;
pub const POST_SESSION_TIMEOUT_SECS: i64 = 10 * 60;

#[derive(Debug, Clone)]
pub struct ConflictState {
    pub base_sha: String,
    pub head_sha: String,
    pub conflict_paths: Vec<String>,
}

/// Conflict signature over `{baseSha, headSha, sorted conflict paths}`.
/// An unchanged signature across attempts means the agent made no
/// progress resolving the conflict.
pub fn conflict_signature(state: &ConflictState) -> String {
    let mut paths = state.conflict_paths.clone();
    paths.sort();
    let mut hasher = Sha256::new();
    hasher.update(state.base_sha.as_bytes());
    hasher.update(b"|");
    hasher.update(state.head_sha.as_bytes());
    hasher.update(b"|");
    hasher.update(paths.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStep {
    Attempt,
    NoProgress,
    Escalate { reason: String },
}

/// Decide what to do given the current conflict signature versus the
/// last recorded one and the attempt budget.
pub fn next_step(signature: &str, prior_signature: Option<&str>, attempt: u32, max_attempts: u32) -> RecoveryStep {
    if prior_signature == Some(signature) {
        return RecoveryStep::NoProgress;
    }
    if attempt >= max_attempts {
        return RecoveryStep::Escalate {
            reason: format!("merge-conflict recovery exhausted {max_attempts} attempts"),
        };
    }
    RecoveryStep::Attempt
}

/// Parse `git ls-files -u` porcelain output into the set of conflicted
/// paths (the third column onward, deduplicated).
pub fn parse_conflicted_paths(ls_files_output: &str) -> Vec<String> {
    let mut paths: Vec<String> = ls_files_output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|s| s.to_string())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

/// Acquire the comment-marker-backed recovery lease for a PR so only one
/// Worker attempts recovery at a time.
pub async fn acquire_recovery_lease(
    pool: &PgPool,
    repo: &str,
    pr_number: i64,
    holder: &str,
) -> anyhow::Result<bool> {
    let key = format!("{repo}#pr#{pr_number}#merge-conflict");
    let lease = leases::try_claim(
        pool,
        &key,
        LeaseScope::MergeConflict,
        holder,
        serde_json::json!({}),
        LEASE_TTL_SECS,
    )
    .await?;
    Ok(lease.is_some())
}

pub async fn release_recovery_lease(
    pool: &PgPool,
    repo: &str,
    pr_number: i64,
    holder: &str,
) -> anyhow::Result<bool> {
    let key = format!("{repo}#pr#{pr_number}#merge-conflict");
    leases::release(pool, &key, LeaseScope::MergeConflict, holder).await
}

/// Whether the PR looks recovered after a session: head SHA changed,
/// merge state is no longer DIRTY, and checks have been observed (not
/// still "UNKNOWN"/absent).
pub fn looks_recovered(
    head_sha_before: &str,
    head_sha_after: &str,
    merge_state_status_after: &str,
    checks_observed: bool,
) -> bool {
    head_sha_before != head_sha_after && merge_state_status_after != "DIRTY" && checks_observed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_regardless_of_path_order() {
        let a = ConflictState {
            base_sha: "b1".into(),
            head_sha: "h1".into(),
            conflict_paths: vec!["b.rs".into(), "a.rs".into()],
        };
        let b = ConflictState {
            base_sha: "b1".into(),
            head_sha: "h1".into(),
            conflict_paths: vec!["a.rs".into(), "b.rs".into()],
        };
        assert_eq!(conflict_signature(&a), conflict_signature(&b));
    }

    #[test]
    fn signature_changes_with_head_sha() {
        let a = ConflictState { base_sha: "b1".into(), head_sha: "h1".into(), conflict_paths: vec![] };
        let b = ConflictState { base_sha: "b1".into(), head_sha: "h2".into(), conflict_paths: vec![] };
        assert_ne!(conflict_signature(&a), conflict_signature(&b));
    }

    #[test]
    fn no_progress_when_signature_repeats() {
        assert_eq!(next_step("sig", Some("sig"), 0, 2), RecoveryStep::NoProgress);
    }

    #[test]
    fn escalates_when_attempts_exhausted() {
        assert!(matches!(next_step("sig", None, 2, 2), RecoveryStep::Escalate { .. }));
    }

    #[test]
    fn attempts_when_budget_remains_and_progress_made() {
        assert_eq!(next_step("sig2", Some("sig1"), 0, 2), RecoveryStep::Attempt);
    }

    #[test]
    fn parses_ls_files_unmerged_output() {
        let output = "100644 abc 1\tfile_a.rs\n100644 def 2\tfile_a.rs\n100644 ghi 3\tfile_a.rs\n100644 xyz 2\tfile_b.rs\n";
        let paths = parse_conflicted_paths(output);
        assert_eq!(paths, vec!["file_a.rs".to_string(), "file_b.rs".to_string()]);
    }

    #[test]
    fn recovered_requires_new_sha_clean_state_and_observed_checks() {
        assert!(looks_recovered("h1", "h2", "CLEAN", true));
        assert!(!looks_recovered("h1", "h1", "CLEAN", true));
        assert!(!looks_recovered("h1", "h2", "DIRTY", true));
        assert!(!looks_recovered("h1", "h2", "CLEAN", false));
    }
}
