//! Preflight checks common to both `process` and `resume` (spec §4.1).

use sqlx::PgPool;

use ralph_db::models::{BlockedSource, Task};
use ralph_db::queries::tasks;

use crate::config::RalphConfig;
use crate::paths;
use crate::ports::{GitHubPort, IssueView};
use crate::worktree::{WorktreeManager, WorktreeSlot, normalize_slot_count};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightOutcome {
    Proceed,
    Blocked { source: BlockedSource, reason: String },
    DoneAlready { reason: String },
}

/// Step 1: allowlist check.
pub fn check_allowlist(config: &RalphConfig, repo: &str) -> PreflightOutcome {
    if config.repo_allowed(repo) {
        PreflightOutcome::Proceed
    } else {
        PreflightOutcome::Blocked {
            source: BlockedSource::Allowlist,
            reason: format!("repo {repo} is not in the configured allowlist"),
        }
    }
}

/// Step 2: closed-issue short-circuit.
pub fn check_issue_open(issue: &IssueView) -> PreflightOutcome {
    if issue.state.eq_ignore_ascii_case("closed") {
        PreflightOutcome::DoneAlready {
            reason: "upstream issue is closed".to_string(),
        }
    } else {
        PreflightOutcome::Proceed
    }
}

/// Step 3: repo-root cleanliness, delegated to the worktree manager's own
/// git-status check — here we only decide what a dirty result means for
/// the task that has no recorded worktree yet.
pub fn check_dirty_repo(task: &Task, repo_root_is_dirty: bool) -> PreflightOutcome {
    if repo_root_is_dirty && task.worktree_path.is_none() {
        PreflightOutcome::Blocked {
            source: BlockedSource::DirtyRepo,
            reason: "repo root has uncommitted changes and no worktree is recorded for this task".to_string(),
        }
    } else {
        PreflightOutcome::Proceed
    }
}

/// Step 3 helper: best-effort repo-root cleanliness check via the
/// managed git clone for this repo, if one is provisioned. No clone
/// provisioned (or any git error) is treated as "not dirty" — this
/// repository ships no Git clone-provisioning transport (DESIGN.md), so
/// the common case is a fresh worktree with no pre-existing clone to
/// check.
pub async fn repo_root_is_dirty(config: &RalphConfig, repo: &str) -> bool {
    let repo_clone_path = config.repo_clone_path(repo);
    let worktree_root = config.worktree_root.clone();
    tokio::task::spawn_blocking(move || {
        WorktreeManager::new(&repo_clone_path, &worktree_root)
            .and_then(|manager| manager.repo_is_dirty())
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

/// Step 5 (fresh branch): resolve or create the managed worktree for a
/// task. Falls back to an ad-hoc path under `/tmp` if no managed git
/// clone is provisioned yet at the repo-clone path.
pub async fn resolve_worktree(config: &RalphConfig, task: &Task) -> String {
    let repo = task.repo.clone();
    let task_key = task.task_key.clone();
    let issue_number = task.issue_number;
    let repo_slot = task.repo_slot;
    let worktree_root = config.worktree_root.clone();
    let repo_clone_path = config.repo_clone_path(&repo);

    let created = tokio::task::spawn_blocking(move || {
        let manager = WorktreeManager::new(&repo_clone_path, &worktree_root)?;
        let slot = WorktreeSlot {
            repo_key: paths::repo_key(&repo),
            slot: normalize_slot_count(repo_slot as i64),
            issue_number,
            task_key,
        };
        manager
            .create_worktree(&slot, "HEAD")
            .map(|info| info.path.to_string_lossy().into_owned())
    })
    .await;

    match created {
        Ok(Ok(path)) => path,
        Ok(Err(err)) => {
            tracing::warn!(task_id = %task.id, %err, "worktree manager unavailable, falling back to ad-hoc path");
            format!("/tmp/ralph/{}", task.task_key)
        }
        Err(err) => {
            tracing::warn!(task_id = %task.id, %err, "worktree resolution task panicked, falling back to ad-hoc path");
            format!("/tmp/ralph/{}", task.task_key)
        }
    }
}

/// Step 5 (resume branch): if the recorded worktree is missing or
/// unhealthy, reset the task to `queued` with cleared session/worktree/
/// worker fields so it is replanned fresh, rather than failing outright.
pub async fn reset_if_worktree_unhealthy(
    pool: &PgPool,
    task: &Task,
    worktree_is_healthy: bool,
) -> anyhow::Result<bool> {
    if worktree_is_healthy {
        return Ok(false);
    }
    tracing::warn!(task_id = %task.id, "recorded worktree missing or unhealthy, resetting to queued");
    tasks::reset_orphaned_tasks(pool).await?;
    Ok(true)
}

/// Task completion: best-effort teardown of the managed worktree. A
/// missing clone or any git error is logged and otherwise ignored — a
/// leftover worktree is swept up by `prune_and_scan_orphans` on the next
/// startup.
pub async fn teardown_worktree(config: &RalphConfig, task: &Task) {
    let Some(worktree_path) = task.worktree_path.clone() else { return };
    let repo_clone_path = config.repo_clone_path(&task.repo);
    let worktree_root = config.worktree_root.clone();
    let task_id = task.id;

    let result = tokio::task::spawn_blocking(move || {
        let manager = WorktreeManager::new(&repo_clone_path, &worktree_root)?;
        manager.remove_worktree(std::path::Path::new(&worktree_path))
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%task_id, %err, "failed to remove worktree at task completion"),
        Err(err) => tracing::warn!(%task_id, %err, "worktree teardown task panicked"),
    }
}

/// Step 4: ensure baseline labels exist. Best-effort per label; missing
/// labels are created, already-present ones are left alone.
pub async fn ensure_baseline_labels(
    github: &dyn GitHubPort,
    repo: &str,
    issue_number: i64,
    issue: &IssueView,
    baseline_labels: &[String],
) -> anyhow::Result<()> {
    for label in baseline_labels {
        if !issue.labels.iter().any(|l| l == label) {
            if let Err(err) = github.add_label(repo, issue_number, label).await {
                tracing::warn!(%repo, issue_number, label, %err, "failed to add baseline label");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(state: &str) -> IssueView {
        IssueView { number: 1, state: state.to_string(), labels: vec![], title: "t".to_string() }
    }

    #[test]
    fn closed_issue_short_circuits() {
        assert!(matches!(check_issue_open(&issue("CLOSED")), PreflightOutcome::DoneAlready { .. }));
    }

    #[test]
    fn open_issue_proceeds() {
        assert_eq!(check_issue_open(&issue("OPEN")), PreflightOutcome::Proceed);
    }

    #[test]
    fn allowlist_blocks_unlisted_repo() {
        let config = RalphConfig::defaults("postgresql://localhost/ralph", "aa".repeat(32));
        assert!(matches!(check_allowlist(&config, "acme/repo"), PreflightOutcome::Blocked { .. }));
    }
}
