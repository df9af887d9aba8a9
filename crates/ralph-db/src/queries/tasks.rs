//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BlockedSource, Checkpoint, Task, TaskStatus};

/// Parameters for inserting a new task.
pub struct NewTask<'a> {
    pub repo: &'a str,
    pub issue_number: i64,
    pub task_key: &'a str,
    pub task_display_name: &'a str,
    pub repo_slot: i32,
}

/// Insert a new task in `queued` status, or return the existing row if one
/// already exists for `(repo, issue_number, task_key)` — queue re-delivery
/// must not create duplicate tasks.
pub async fn insert_task_idempotent(pool: &PgPool, new: NewTask<'_>) -> Result<Task> {
    let existing = get_task_by_key(pool, new.repo, new.issue_number, new.task_key).await?;
    if let Some(task) = existing {
        return Ok(task);
    }

    sqlx::query_as::<_, Task>(
        r#"
        INSERT INTO tasks (repo, issue_number, task_key, task_display_name, repo_slot, status)
        VALUES ($1, $2, $3, $4, $5, 'queued')
        ON CONFLICT (repo, issue_number, task_key) DO UPDATE SET repo = EXCLUDED.repo
        RETURNING *
        "#,
    )
    .bind(new.repo)
    .bind(new.issue_number)
    .bind(new.task_key)
    .bind(new.task_display_name)
    .bind(new.repo_slot)
    .fetch_one(pool)
    .await
    .context("failed to insert task")
}

pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")
}

pub async fn get_task_by_key(
    pool: &PgPool,
    repo: &str,
    issue_number: i64,
    task_key: &str,
) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE repo = $1 AND issue_number = $2 AND task_key = $3",
    )
    .bind(repo)
    .bind(issue_number)
    .bind(task_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch task by key")
}

pub async fn list_tasks_for_repo(pool: &PgPool, repo: &str) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE repo = $1 ORDER BY created_at")
        .bind(repo)
        .fetch_all(pool)
        .await
        .context("failed to list tasks for repo")
}

/// Tasks whose `resume_at` has passed — ready to be picked back up from
/// `throttled`.
pub async fn list_due_for_resume(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'throttled' AND resume_at IS NOT NULL AND resume_at <= $1",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list tasks due for resume")
}

/// Optimistic-locked status transition: succeeds only if the row's current
/// status still matches `from`. Returns the number of rows updated (0 means
/// either the task does not exist or another worker already moved it).
pub async fn transition_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $3, updated_at = now()
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(task_id)
    .bind(from)
    .bind(to)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

    Ok(result.rows_affected())
}

/// Record a checkpoint reached: bump `checkpoint_seq`, set
/// `last_checkpoint`, only if `expected_seq` still matches the row's
/// current `checkpoint_seq` — the same optimistic-lock shape as status
/// transitions, giving checkpoint publication its exactly-once guarantee.
pub async fn record_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    expected_seq: i64,
    checkpoint: Checkpoint,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET checkpoint_seq = checkpoint_seq + 1,
            last_checkpoint = $3,
            updated_at = now()
        WHERE id = $1 AND checkpoint_seq = $2
        "#,
    )
    .bind(task_id)
    .bind(expected_seq)
    .bind(checkpoint)
    .execute(pool)
    .await
    .context("failed to record checkpoint")?;

    Ok(result.rows_affected())
}

pub async fn set_pause_requested(pool: &PgPool, task_id: Uuid, requested: bool) -> Result<()> {
    sqlx::query("UPDATE tasks SET pause_requested = $2, updated_at = now() WHERE id = $1")
        .bind(task_id)
        .bind(requested)
        .execute(pool)
        .await
        .context("failed to set pause_requested")?;
    Ok(())
}

pub async fn set_paused_at_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    checkpoint: Option<Checkpoint>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET paused_at_checkpoint = $2, updated_at = now() WHERE id = $1")
        .bind(task_id)
        .bind(checkpoint)
        .execute(pool)
        .await
        .context("failed to set paused_at_checkpoint")?;
    Ok(())
}

/// Record a `blocked` state: sets status + blocked fields in one update
/// (the Worker always sets both together).
pub async fn set_blocked(
    pool: &PgPool,
    task_id: Uuid,
    source: BlockedSource,
    reason: &str,
    details: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'blocked',
            blocked_source = $2,
            blocked_reason = $3,
            blocked_details = $4,
            blocked_at = $5,
            blocked_checked_at = $5,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(source)
    .bind(reason)
    .bind(details)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to set blocked state")?;
    Ok(())
}

pub async fn touch_blocked_checked_at(pool: &PgPool, task_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE tasks SET blocked_checked_at = $2 WHERE id = $1")
        .bind(task_id)
        .bind(now)
        .execute(pool)
        .await
        .context("failed to touch blocked_checked_at")?;
    Ok(())
}

pub async fn set_throttled(pool: &PgPool, task_id: Uuid, resume_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'throttled', throttled_at = now(), resume_at = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(resume_at)
    .execute(pool)
    .await
    .context("failed to set throttled state")?;
    Ok(())
}

pub async fn set_session(
    pool: &PgPool,
    task_id: Uuid,
    session_id: Option<&str>,
    worker_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET session_id = $2, worker_id = $3, updated_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .bind(session_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to set session")?;
    Ok(())
}

pub async fn set_worktree(
    pool: &PgPool,
    task_id: Uuid,
    worktree_path: &str,
    repo_slot: i32,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET worktree_path = $2, repo_slot = $3, updated_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .bind(worktree_path)
    .bind(repo_slot)
    .execute(pool)
    .await
    .context("failed to set worktree path")?;
    Ok(())
}

pub async fn set_agent_profile(pool: &PgPool, task_id: Uuid, profile: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET agent_profile = $2, updated_at = now() WHERE id = $1")
        .bind(task_id)
        .bind(profile)
        .execute(pool)
        .await
        .context("failed to set agent profile")?;
    Ok(())
}

pub async fn increment_watchdog_retries(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE tasks SET watchdog_retries = watchdog_retries + 1, updated_at = now() WHERE id = $1 RETURNING watchdog_retries",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to increment watchdog_retries")?;
    Ok(row.0)
}

pub async fn increment_stall_retries(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE tasks SET stall_retries = stall_retries + 1, updated_at = now() WHERE id = $1 RETURNING stall_retries",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to increment stall_retries")?;
    Ok(row.0)
}

pub async fn increment_guardrail_retries(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE tasks SET guardrail_retries = guardrail_retries + 1, updated_at = now() WHERE id = $1 RETURNING guardrail_retries",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to increment guardrail_retries")?;
    Ok(row.0)
}

pub async fn mark_assigned(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'starting', assigned_at = now(), updated_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark task assigned")?;
    Ok(())
}

pub async fn mark_done(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'done', completed_at = now(), updated_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark task done")?;
    Ok(())
}

pub async fn mark_escalated(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'escalated', completed_at = now(), updated_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark task escalated")?;
    Ok(())
}

/// Operator override: requeue an escalated task.
pub async fn reset_to_queued(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'queued',
            blocked_source = NULL,
            blocked_reason = NULL,
            blocked_details = NULL,
            completed_at = NULL,
            updated_at = now()
        WHERE id = $1 AND status = 'escalated'
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reset escalated task to queued")?;
    Ok(result.rows_affected())
}

/// Restart recovery: any task left in `starting`/`in_progress` when the
/// process restarts did not actually finish — reset it to `queued` so it
/// gets picked up again, mirroring the orphan-recovery sweep the teacher
/// runs over stuck `assigned`/`running`/`checking` tasks.
pub async fn reset_orphaned_tasks(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'queued', updated_at = now()
        WHERE status IN ('starting', 'in_progress')
        "#,
    )
    .execute(pool)
    .await
    .context("failed to reset orphaned tasks")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_builds() {
        let new = NewTask {
            repo: "acme/foo",
            issue_number: 42,
            task_key: "default",
            task_display_name: "Fix the thing",
            repo_slot: 0,
        };
        assert_eq!(new.repo, "acme/foo");
        assert_eq!(new.issue_number, 42);
    }
}
