//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::TaskStatus;

use super::TaskStateMachine;

/// A Worker picks the task up: `queued -> starting`.
pub async fn assign_task(pool: &PgPool, task_id: Uuid, worker_id: &str) -> Result<()> {
    TaskStateMachine::assign_task(pool, task_id, worker_id).await
}

/// Preflight checks pass and the session loop begins: `starting -> in_progress`.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Starting, TaskStatus::InProgress).await
}

/// A throttle/rate-limit gate rests the task: `in_progress -> throttled`.
pub async fn throttle_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::InProgress, TaskStatus::Throttled).await
}

/// The scheduler resumes a throttled task: `throttled -> in_progress`.
pub async fn resume_from_throttle(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Throttled, TaskStatus::InProgress).await
}

/// A supervisor requeue or blocked-source condition pauses the task:
/// `in_progress -> blocked`.
pub async fn block_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::InProgress, TaskStatus::Blocked).await
}

/// The scheduler resumes a blocked task: `blocked -> in_progress`.
pub async fn resume_from_blocked(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Blocked, TaskStatus::InProgress).await
}

/// The task reaches `survey_complete` and finalizes: `in_progress -> done`.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::InProgress, TaskStatus::Done).await
}

/// Escalate from whichever non-terminal status the task is currently in.
pub async fn escalate_task(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Escalated).await
}

/// The operator override: `escalated -> queued`.
pub async fn operator_retry(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::operator_retry(pool, task_id).await
}
