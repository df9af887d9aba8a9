//! Merge Gate (spec §4.8): advances a validated PR from created to
//! merged, handling required-check drift and CI remediation along the
//! way.

pub mod merge;
pub mod poll;
pub mod triage;

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::BlockedSource;
use ralph_db::queries::{tasks, worker_events};

pub use merge::MergeDecision;
pub use poll::RollupSummary;
pub use triage::{TriageAction, TriageVerdict};

/// What the Worker should do after consulting the merge gate for one
/// iteration. Distinct from [`poll::RollupSummary`]: this is the action,
/// not just the check rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeGateOutcome {
    Merged,
    Blocked { reason: String },
    RouteToMergeConflict,
    Quarantined { resume_in_secs: u64 },
    Escalate { reason: String },
    KeepPolling,
}

/// Record that the merge gate quarantined a task, transitioning it to
/// `throttled` with the triage-computed backoff.
pub async fn apply_quarantine(
    pool: &PgPool,
    task_id: Uuid,
    resume_in_secs: u64,
) -> anyhow::Result<()> {
    let task = tasks::get_task(pool, task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
    let resume_at = chrono::Utc::now() + chrono::Duration::seconds(resume_in_secs as i64);

    let now = chrono::Utc::now();
    tasks::set_throttled(pool, task_id, resume_at).await?;
    tasks::set_blocked(
        pool,
        task_id,
        BlockedSource::CiFailure,
        "quarantined pending suspected flake/infra recovery",
        None,
        now,
    )
    .await?;

    worker_events::insert_event_idempotent(
        pool,
        task_id,
        task.checkpoint_seq,
        "worker.pause.requested",
        serde_json::json!({ "reason": "ci-quarantine", "resume_at": resume_at }),
    )
    .await?;

    tracing::warn!(%task_id, resume_in_secs, "merge gate quarantined task");
    Ok(())
}
