//! Merge semantics (spec §4.8.3): the pre-merge guard, base-branch and
//! CI-only refusal policies, the merge call itself, and post-merge head
//! branch cleanup.

use sqlx::PgPool;

use ralph_db::queries::leases;
use ralph_db::models::LeaseScope;

use crate::ports::{GitHubApiError, GitHubPort, PrFile, PrView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Merge,
    RouteToMergeConflict,
    ResumePolling,
    AttemptAutoUpdate,
    Refused { reason: String },
}

/// Auto-update-behind is gated by a label and a per-PR rate limit: at most
/// one auto-update attempt per lease TTL window.
pub const AUTO_UPDATE_LABEL: &str = "ralph-auto-update";
pub const AUTO_UPDATE_LEASE_TTL_SECS: i64 = 300;

/// Re-examine merge state immediately before merging (spec's "pre-merge
/// guard: re-check status once more").
pub fn pre_merge_guard(pr: &PrView, has_auto_update_label: bool) -> MergeDecision {
    match pr.merge_state_status.as_str() {
        "DIRTY" => MergeDecision::RouteToMergeConflict,
        "BEHIND" if has_auto_update_label => MergeDecision::AttemptAutoUpdate,
        "BEHIND" => MergeDecision::Refused {
            reason: format!(
                "PR is behind base and missing the {AUTO_UPDATE_LABEL} label; refusing auto-update"
            ),
        },
        "CLEAN" => MergeDecision::Merge,
        _ => MergeDecision::ResumePolling,
    }
}

/// One auto-update attempt per [`AUTO_UPDATE_LEASE_TTL_SECS`] window, and
/// never across repos (the lease key is scoped to this repo+PR).
pub async fn try_claim_auto_update_rate_limit(
    pool: &PgPool,
    repo: &str,
    pr_number: i64,
    holder: &str,
) -> anyhow::Result<bool> {
    let key = format!("{repo}#pr#{pr_number}#auto-update");
    let lease = leases::try_claim(
        pool,
        &key,
        LeaseScope::MergeConflict,
        holder,
        serde_json::json!({}),
        AUTO_UPDATE_LEASE_TTL_SECS,
    )
    .await?;
    Ok(lease.is_some())
}

/// Refuse a merge whose base is the repo default branch unless the bot's
/// integration branch equals the default, or an explicit override label
/// is present.
pub fn check_base_branch_policy(
    pr: &PrView,
    default_branch: &str,
    integration_branch: &str,
    override_label: &str,
) -> Option<String> {
    if pr.base_branch != default_branch {
        return None;
    }
    if integration_branch == default_branch {
        return None;
    }
    if pr.labels.iter().any(|l| l == override_label) {
        return None;
    }
    Some(format!(
        "refusing merge: base branch {} is the repo default and neither the integration branch matches it nor the {override_label} override label is present",
        pr.base_branch
    ))
}

/// Block a merge whose changed files are entirely CI/workflow paths when
/// the issue itself is not CI-flavored.
pub fn check_ci_only_guard(files: &[PrFile], issue_is_ci_flavored: bool) -> Option<String> {
    if issue_is_ci_flavored || files.is_empty() {
        return None;
    }
    let all_ci = files.iter().all(|f| is_ci_path(&f.path));
    if all_ci {
        Some("refusing merge: all changed files are CI/workflow paths and the issue is not CI-flavored".to_string())
    } else {
        None
    }
}

fn is_ci_path(path: &str) -> bool {
    path.starts_with(".github/workflows/") || path.starts_with(".github/actions/")
}

/// Call the merge API. On an "out of date with base" / "required checks
/// expected" error, the caller should perform a single auto-update and
/// retry the gate — detection of that condition lives here so it is
/// exercised by a pure function.
pub fn is_retryable_merge_error(err: &GitHubApiError) -> bool {
    let text = err.response_text.to_ascii_lowercase();
    text.contains("out of date with the base branch") || text.contains("required status check")
}

pub async fn merge(github: &dyn GitHubPort, repo: &str, pr_number: i64) -> Result<(), GitHubApiError> {
    github.pr_merge(repo, pr_number).await
}

/// Decide whether the head branch may be deleted post-merge: same repo,
/// default-target only, and the branch's current SHA must match what was
/// just merged (no force-push or new commits landed in between).
pub fn should_delete_head_branch(
    pr: &PrView,
    default_branch: &str,
    head_sha_at_merge: &str,
    current_head_sha: &str,
    cross_repo: bool,
) -> bool {
    !cross_repo && pr.base_branch == default_branch && head_sha_at_merge == current_head_sha
}
