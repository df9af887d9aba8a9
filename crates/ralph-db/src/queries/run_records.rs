//! Database query functions for the `run_records` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AttemptKind, CompletionKind, RunOutcome, RunRecord};

/// Open a run record at Worker entry.
pub async fn open_run(
    pool: &PgPool,
    repo: &str,
    issue_number: i64,
    task_id: Uuid,
    attempt_kind: AttemptKind,
) -> Result<RunRecord> {
    sqlx::query_as::<_, RunRecord>(
        r#"
        INSERT INTO run_records (repo, issue_number, task_id, attempt_kind)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(repo)
    .bind(issue_number)
    .bind(task_id)
    .bind(attempt_kind)
    .fetch_one(pool)
    .await
    .context("failed to open run record")
}

/// Seal a run record at Worker exit.
pub async fn seal_run(
    pool: &PgPool,
    run_id: Uuid,
    outcome: RunOutcome,
    pr_url: Option<&str>,
    completion_kind: Option<CompletionKind>,
    reason_code: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE run_records
        SET completed_at = now(),
            outcome = $2,
            pr_url = $3,
            completion_kind = $4,
            reason_code = $5
        WHERE id = $1
        "#,
    )
    .bind(run_id)
    .bind(outcome)
    .bind(pr_url)
    .bind(completion_kind)
    .bind(reason_code)
    .execute(pool)
    .await
    .context("failed to seal run record")?;
    Ok(())
}

pub async fn get_run(pool: &PgPool, run_id: Uuid) -> Result<Option<RunRecord>> {
    sqlx::query_as::<_, RunRecord>("SELECT * FROM run_records WHERE id = $1")
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run record")
}

pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<RunRecord>> {
    sqlx::query_as::<_, RunRecord>(
        "SELECT * FROM run_records WHERE task_id = $1 ORDER BY started_at",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list run records for task")
}

/// Runs left open (never sealed) when the process restarts — the run-ledger
/// counterpart to `tasks::reset_orphaned_tasks`.
pub async fn list_open_runs(pool: &PgPool) -> Result<Vec<RunRecord>> {
    sqlx::query_as::<_, RunRecord>("SELECT * FROM run_records WHERE completed_at IS NULL")
        .fetch_all(pool)
        .await
        .context("failed to list open run records")
}
