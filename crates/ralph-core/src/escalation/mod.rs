//! Escalation protocol (spec §4.5): the terminal path out of the Worker
//! state machine. Four idempotent steps — status transition, a GitHub
//! comment carrying a machine-readable marker, a Notify Port call, and a
//! sealed run record — each guarded so a retried escalation (e.g. after a
//! crash between steps) does not duplicate comments or notifications.

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::{EscalationCause, RunOutcome, TaskStatus};
use ralph_db::queries::{run_records, tasks, worker_events};

use crate::ports::NotifyPort;

/// Marker embedded in the escalation comment body so a retried escalation
/// can detect it already posted and skip straight to the remaining steps.
pub const ESCALATION_MARKER_PREFIX: &str = "<!-- ralph:escalation:v1 ";

#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub task_id: Uuid,
    pub repo: String,
    pub issue_number: i64,
    pub cause: EscalationCause,
    pub reason: String,
    pub run_id: Option<Uuid>,
}

fn marker_body(cause: EscalationCause, reason: &str) -> String {
    let payload = serde_json::json!({ "cause": cause.to_string(), "reason": reason });
    format!(
        "{ESCALATION_MARKER_PREFIX}{} -->\n\nRalph escalated this task: **{cause}**.\n\n{reason}",
        payload
    )
}

/// Run all four escalation steps. Safe to call more than once for the
/// same task: each step checks the task's current state before acting.
pub async fn escalate(
    pool: &PgPool,
    github: &dyn crate::ports::GitHubPort,
    notify: &dyn NotifyPort,
    ctx: &EscalationContext,
) -> anyhow::Result<()> {
    let task = tasks::get_task(pool, ctx.task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {} not found", ctx.task_id))?;

    // Step 1: status transition. Idempotent because the optimistic-lock
    // update is a no-op once the task is already `escalated`.
    if task.status != TaskStatus::Escalated {
        tasks::mark_escalated(pool, ctx.task_id).await?;
    }

    // Step 2: GitHub comment with the machine-readable marker. Skipped if
    // a comment with this marker already exists, so a retried escalation
    // after a crash does not double-post.
    let already_commented = github
        .list_issue_comments(&ctx.repo, ctx.issue_number)
        .await?
        .iter()
        .any(|c| c.body.contains(ESCALATION_MARKER_PREFIX));
    if !already_commented {
        let body = marker_body(ctx.cause, &ctx.reason);
        github.create_comment(&ctx.repo, ctx.issue_number, &body).await?;
    }

    // Step 3: Notify Port. Best-effort: a notification failure does not
    // block the remaining steps, but is logged loudly.
    let refreshed = tasks::get_task(pool, ctx.task_id).await?.unwrap_or(task);
    if let Err(err) = notify.notify_escalation(&refreshed, &ctx.reason).await {
        tracing::error!(task_id = %ctx.task_id, %err, "escalation notification failed");
    }

    // Step 4: seal the run record, if one is open.
    if let Some(run_id) = ctx.run_id {
        run_records::seal_run(pool, run_id, RunOutcome::Escalated, None, None, Some(&ctx.reason)).await?;
    }

    worker_events::insert_event_idempotent(
        pool,
        ctx.task_id,
        refreshed.checkpoint_seq,
        "worker.escalated",
        serde_json::json!({ "cause": ctx.cause.to_string(), "reason": ctx.reason }),
    )
    .await?;

    tracing::error!(task_id = %ctx.task_id, cause = %ctx.cause, "task escalated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_body_contains_prefix() {
        let body = marker_body(EscalationCause::WatchdogRepeat, "timed out");
        assert!(body.starts_with(ESCALATION_MARKER_PREFIX));
        assert!(body.contains("timed out"));
    }
}
