//! Stall supervisor: trips when a session produces output but makes no
//! further tool-call progress for longer than the idle budget. Distinct
//! from the watchdog (zero output) and counted separately so a
//! long-but-progressing session is not penalized.

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::BlockedSource;
use ralph_db::queries::tasks;

use crate::ports::SupervisorTrip;

use super::SupervisorVerdict;

pub const MAX_STALL_RETRIES: i32 = 2;

pub async fn handle_trip(
    pool: &PgPool,
    task_id: Uuid,
    trip: &SupervisorTrip,
) -> anyhow::Result<SupervisorVerdict> {
    let retries = tasks::increment_stall_retries(pool, task_id).await?;

    tracing::warn!(%task_id, retries, reason = %trip.reason, "stall trip");

    if retries > MAX_STALL_RETRIES {
        return Ok(SupervisorVerdict::Escalate {
            cause: "stall".to_string(),
            reason: format!("stall tripped {retries} times: {}", trip.reason),
        });
    }

    Ok(SupervisorVerdict::Requeue {
        source: BlockedSource::Stall,
        reason: trip.reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_allows_more_retries_than_watchdog() {
        assert!(MAX_STALL_RETRIES > super::super::watchdog::MAX_WATCHDOG_RETRIES);
    }
}
