//! `ralph task enqueue` / `ralph task retry`: the operator-facing surface
//! onto the task queue, outside of whatever upstream webhook or scheduler
//! normally drives it.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use ralph_core::state::dispatch;
use ralph_db::queries::tasks;

use crate::adapters::new_task;

pub struct EnqueueArgs {
    pub repo: String,
    pub issue_number: i64,
    pub task_key: String,
    pub task_display_name: String,
    pub repo_slot: i32,
}

pub async fn run_enqueue(pool: &PgPool, args: EnqueueArgs) -> Result<()> {
    let new = new_task(&args.repo, args.issue_number, &args.task_key, &args.task_display_name, args.repo_slot);
    let task = tasks::insert_task_idempotent(pool, new).await?;
    println!("Task {} ({}#{}) is {}", task.id, task.repo, task.issue_number, task.status);
    Ok(())
}

pub async fn run_retry(pool: &PgPool, task_id: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    dispatch::operator_retry(pool, id).await?;
    println!("Task {task_id} reset to queued for retry.");
    Ok(())
}
