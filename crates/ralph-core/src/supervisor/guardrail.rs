//! Guardrail supervisor: a soft wall-clock/tool-call budget, tighter than
//! the watchdog, meant to catch a session that is technically making
//! progress but has overrun what a checkpoint-sized unit of work should
//! cost. First trip nudges the task back to blocked for a retry with a
//! tighter prompt; repeat trips escalate.

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::BlockedSource;
use ralph_db::queries::tasks;

use crate::ports::SupervisorTrip;

use super::SupervisorVerdict;

pub const MAX_GUARDRAIL_RETRIES: i32 = 2;

pub async fn handle_trip(
    pool: &PgPool,
    task_id: Uuid,
    trip: &SupervisorTrip,
) -> anyhow::Result<SupervisorVerdict> {
    let retries = tasks::increment_guardrail_retries(pool, task_id).await?;

    tracing::warn!(%task_id, retries, reason = %trip.reason, "guardrail trip");

    if retries > MAX_GUARDRAIL_RETRIES {
        return Ok(SupervisorVerdict::Escalate {
            cause: "guardrail".to_string(),
            reason: format!(
                "guardrail tripped {retries} times: {}",
                trip.reason
            ),
        });
    }

    Ok(SupervisorVerdict::Requeue {
        source: BlockedSource::Guardrail,
        reason: trip.reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_retries_nonzero() {
        assert!(MAX_GUARDRAIL_RETRIES > 0);
    }
}
