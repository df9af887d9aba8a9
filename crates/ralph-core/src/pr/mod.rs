//! PR resolution and the PR-create lease (spec §4.6).
//!
//! A task may accumulate more than one PR candidate (a GitHub search can
//! surface one opened by a prior attempt, plus one the current session
//! just created). The canonical PR is resolved deterministically rather
//! than by "whichever we saw last" — oldest `created_at`, then
//! `updated_at`, then `url`, matching the ordering `pr_candidates::list_candidates`
//! already applies in SQL. The PR-create lease prevents two concurrent
//! attempts (a resumed task and a stale worker) from both creating a PR
//! for the same issue.

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::{PrCandidate, PrCandidateSource};
use ralph_db::queries::{leases, pr_candidates};
use ralph_db::models::LeaseScope;

use crate::ports::{GitHubPort, PrView};

/// Default TTL for the PR-create lease: long enough to cover a session
/// plus the dashboard write that follows it, short enough that a crashed
/// worker does not block the issue indefinitely.
pub const PR_CREATE_LEASE_TTL_SECS: i64 = 600;

/// Record every PR this task might plausibly own: whatever the live
/// session returned, plus anything GitHub's search turns up by the
/// issue-link convention (`Closes #N`, `Fixes org/repo#N`, etc., left to
/// the GitHub Port's own search semantics).
pub async fn discover_candidates(
    pool: &PgPool,
    github: &dyn GitHubPort,
    task_id: Uuid,
    repo: &str,
    issue_number: i64,
    session_pr_url: Option<&str>,
) -> anyhow::Result<Vec<PrCandidate>> {
    if let Some(url) = session_pr_url {
        pr_candidates::record_candidate(pool, task_id, url, PrCandidateSource::Db).await?;
    }

    match github.pr_search_by_issue_link(repo, issue_number).await {
        Ok(found) => {
            for pr in &found {
                pr_candidates::record_candidate(pool, task_id, &pr.url, PrCandidateSource::GhSearch).await?;
            }
        }
        Err(err) => {
            tracing::warn!(task_id = %task_id, %err, "PR search by issue link failed, continuing with known candidates");
        }
    }

    pr_candidates::list_candidates(pool, task_id).await
}

/// Pick the canonical candidate per the deterministic tie-break. The
/// candidates must already be sorted by `(created_at, updated_at, url)` —
/// callers that got their list from `discover_candidates`/`list_candidates`
/// get this for free.
pub fn resolve_canonical(candidates: &[PrCandidate]) -> Option<&PrCandidate> {
    candidates.first()
}

/// Resolve the canonical candidate's live view from GitHub, discarding
/// stale/closed candidates that no longer resolve.
pub async fn resolve_canonical_view(
    github: &dyn GitHubPort,
    repo: &str,
    candidates: &[PrCandidate],
) -> anyhow::Result<Option<PrView>> {
    for candidate in candidates {
        let Some(number) = pr_number_from_url(&candidate.url) else {
            continue;
        };
        match github.pr_view(repo, number).await {
            Ok(view) => return Ok(Some(view)),
            Err(err) => {
                tracing::warn!(url = %candidate.url, %err, "candidate PR no longer resolves, trying next");
                continue;
            }
        }
    }
    Ok(None)
}

fn pr_number_from_url(url: &str) -> Option<i64> {
    url.rsplit('/').next()?.parse().ok()
}

/// Acquire the PR-create lease for `(repo, issue)`. Returns `true` if the
/// caller now holds it (fresh claim or reclaimed a stale one), `false` if
/// another attempt currently holds a live lease.
pub async fn acquire_pr_create_lease(
    pool: &PgPool,
    repo: &str,
    issue_number: i64,
    holder: &str,
) -> anyhow::Result<bool> {
    let key = lease_key(repo, issue_number);
    let lease = leases::try_claim(
        pool,
        &key,
        LeaseScope::PrCreate,
        holder,
        serde_json::json!({}),
        PR_CREATE_LEASE_TTL_SECS,
    )
    .await?;
    Ok(lease.is_some())
}

pub async fn release_pr_create_lease(
    pool: &PgPool,
    repo: &str,
    issue_number: i64,
    holder: &str,
) -> anyhow::Result<bool> {
    leases::release(pool, &lease_key(repo, issue_number), LeaseScope::PrCreate, holder).await
}

fn lease_key(repo: &str, issue_number: i64) -> String {
    format!("{repo}#{issue_number}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(url: &str, created_offset_secs: i64) -> PrCandidate {
        PrCandidate {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            url: url.to_string(),
            source: PrCandidateSource::Db,
            created_at: Utc::now() + chrono::Duration::seconds(created_offset_secs),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn resolve_canonical_picks_first() {
        let candidates = vec![candidate("https://example/pr/1", 0), candidate("https://example/pr/2", 10)];
        let canonical = resolve_canonical(&candidates).unwrap();
        assert_eq!(canonical.url, "https://example/pr/1");
    }

    #[test]
    fn resolve_canonical_empty_is_none() {
        assert!(resolve_canonical(&[]).is_none());
    }

    #[test]
    fn pr_number_parses_trailing_segment() {
        assert_eq!(pr_number_from_url("https://github.com/acme/repo/pull/42"), Some(42));
        assert_eq!(pr_number_from_url("not-a-url"), None);
    }

    #[test]
    fn lease_key_is_stable() {
        assert_eq!(lease_key("acme/repo", 7), "acme/repo#7");
    }
}
