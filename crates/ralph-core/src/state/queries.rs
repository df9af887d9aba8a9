//! Query helpers for the scheduler-facing view of task state: what's due
//! to resume, and per-repo status counts. Ralph has no multi-task DAG —
//! scheduling and slotting live entirely outside this crate (spec §5) —
//! so these wrap `ralph_db::queries::tasks` directly rather than adding
//! orchestration logic of their own.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use ralph_db::models::{Task, TaskStatus};

/// Tasks whose `resume_at` has passed: throttled tasks ready to be handed
/// back to a Worker, and blocked tasks due for a recheck.
pub async fn get_due_for_resume(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    ralph_db::queries::tasks::list_due_for_resume(pool, now).await
}

/// A count of tasks by status for one repo — the input to a simple
/// operator status view.
pub async fn status_counts_for_repo(pool: &PgPool, repo: &str) -> Result<HashMap<TaskStatus, usize>> {
    let tasks = ralph_db::queries::tasks::list_tasks_for_repo(pool, repo).await?;
    let mut counts = HashMap::new();
    for task in tasks {
        *counts.entry(task.status).or_insert(0) += 1;
    }
    Ok(counts)
}

/// Restart recovery: reset any task left in `starting`/`in_progress` by a
/// process that crashed or was killed, so the scheduler can hand it back
/// out. Should be called once at process startup before assigning new
/// work.
pub async fn reset_orphaned_tasks(pool: &PgPool) -> Result<u64> {
    ralph_db::queries::tasks::reset_orphaned_tasks(pool).await
}
