//! Watchdog supervisor: trips when a session produces no output at all
//! within its hard wall-clock budget. First trip requeues the task for a
//! fresh attempt; a second consecutive trip escalates.

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::BlockedSource;
use ralph_db::queries::tasks;

use crate::ports::SupervisorTrip;

use super::SupervisorVerdict;

/// Maximum number of watchdog trips tolerated before escalating.
pub const MAX_WATCHDOG_RETRIES: i32 = 1;

/// Handle a watchdog trip attached to a session result: bump the retry
/// counter and decide whether to requeue or escalate.
pub async fn handle_trip(
    pool: &PgPool,
    task_id: Uuid,
    trip: &SupervisorTrip,
) -> anyhow::Result<SupervisorVerdict> {
    let retries = tasks::increment_watchdog_retries(pool, task_id).await?;

    tracing::warn!(%task_id, retries, reason = %trip.reason, "watchdog trip");

    if retries > MAX_WATCHDOG_RETRIES {
        return Ok(SupervisorVerdict::Escalate {
            cause: "watchdog".to_string(),
            reason: format!(
                "watchdog tripped {retries} times: {}",
                trip.reason
            ),
        });
    }

    Ok(SupervisorVerdict::Requeue {
        source: BlockedSource::RuntimeError,
        reason: trip.reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_retries_is_small() {
        assert_eq!(MAX_WATCHDOG_RETRIES, 1);
    }
}
