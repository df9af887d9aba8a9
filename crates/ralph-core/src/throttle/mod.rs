//! Throttle/Quota Gate and GitHub Rate-Limit Gate (spec §4.3).
//!
//! Both gates converge on the same resting state: a hard throttle decision,
//! or a caught GitHub rate-limit error, both transition the task to
//! `throttled` with a `resume_at` and publish the pause-requested/reached
//! events. A soft decision is informational only and never blocks the
//! Worker.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::queries::{tasks, worker_events};

use crate::ports::{GitHubApiError, ThrottleDecision, ThrottleState};

/// What the Worker should do after consulting the throttle/rate-limit
/// gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Proceed,
    Rest { resume_at: DateTime<Utc> },
}

/// Apply a [`ThrottleDecision`] from the Throttle Port.
pub async fn apply_throttle_decision(
    pool: &PgPool,
    task_id: Uuid,
    decision: &ThrottleDecision,
) -> anyhow::Result<GateOutcome> {
    match decision.state {
        ThrottleState::Ok | ThrottleState::Soft => Ok(GateOutcome::Proceed),
        ThrottleState::Hard => {
            let resume_at = decision
                .resume_at_ts
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(5));
            rest(pool, task_id, resume_at).await?;
            Ok(GateOutcome::Rest { resume_at })
        }
    }
}

/// Convert a caught GitHub rate-limit error into the same resting state.
pub async fn apply_rate_limit_error(
    pool: &PgPool,
    task_id: Uuid,
    err: &GitHubApiError,
) -> anyhow::Result<GateOutcome> {
    anyhow::ensure!(err.is_rate_limit(), "not a rate-limit error: {err}");
    let resume_at = err
        .resume_at_ts
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(15));
    rest(pool, task_id, resume_at).await?;
    Ok(GateOutcome::Rest { resume_at })
}

async fn rest(pool: &PgPool, task_id: Uuid, resume_at: DateTime<Utc>) -> anyhow::Result<()> {
    let task = tasks::get_task(pool, task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

    tasks::set_throttled(pool, task_id, resume_at).await?;

    worker_events::insert_event_idempotent(
        pool,
        task_id,
        task.checkpoint_seq,
        "worker.pause.requested",
        serde_json::json!({ "resume_at": resume_at }),
    )
    .await?;
    worker_events::insert_event_idempotent(
        pool,
        task_id,
        task.checkpoint_seq,
        "worker.pause.reached",
        serde_json::json!({ "resume_at": resume_at, "reason": "throttled" }),
    )
    .await?;

    tracing::warn!(%task_id, %resume_at, "task throttled");
    Ok(())
}

/// Choose which agent profile to request for a fresh-work session versus a
/// resumed one, per spec §4.3's "fresh-work vs resume profile-selection
/// distinction" — resuming reuses the profile already recorded on the task.
pub fn select_profile<'a>(default_profile: &'a str, existing_profile: Option<&'a str>) -> &'a str {
    existing_profile.unwrap_or(default_profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_profile_prefers_existing() {
        assert_eq!(select_profile("default", Some("careful")), "careful");
        assert_eq!(select_profile("default", None), "default");
    }
}
