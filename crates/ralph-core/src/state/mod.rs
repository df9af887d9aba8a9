//! Task state machine transitions (spec §3's status graph:
//! `Queued -> Starting -> InProgress <-> Throttled -> {Done, Blocked,
//! Escalated}`).
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph and optimistic locking. All mutation goes
//! through `ralph_db::queries::tasks::transition_status`, which applies
//! the `WHERE id = $1 AND status = $2` compare-and-set.

pub mod dispatch;
pub mod queries;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::TaskStatus;
use ralph_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued      -> starting
/// starting    -> in_progress
/// in_progress -> throttled     (throttle/rate-limit gate, supervisor requeue)
/// throttled   -> in_progress   (resume)
/// in_progress -> blocked       (supervisor requeue, CI/merge-conflict blocked source)
/// blocked     -> in_progress   (resume after operator/automatic unblock)
/// in_progress -> done
/// in_progress -> escalated
/// throttled   -> escalated
/// blocked     -> escalated
/// escalated   -> queued        (operator retry override, see `reset_to_queued`)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Queued, Starting)
                | (Starting, InProgress)
                | (InProgress, Throttled)
                | (Throttled, InProgress)
                | (InProgress, Blocked)
                | (Blocked, InProgress)
                | (InProgress, Done)
                | (InProgress, Escalated)
                | (Throttled, Escalated)
                | (Blocked, Escalated)
                | (Escalated, Queued)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Returns an error if the transition is not a legal edge, the task
    /// does not exist, or the current database status does not match
    /// `from` (optimistic lock failure — another Worker or the scheduler
    /// moved the task concurrently).
    pub async fn transition(pool: &PgPool, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }

        let rows = db::transition_status(pool, task_id, from, to)
            .await
            .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {task_id} not found"),
                Some(t) => bail!(
                    "optimistic lock failed: task {task_id} has status {}, expected {from}",
                    t.status
                ),
            }
        }

        Ok(())
    }

    /// Assign a task picked up by a Worker: `queued -> starting`.
    pub async fn assign_task(pool: &PgPool, task_id: Uuid, worker_id: &str) -> Result<()> {
        db::set_session(pool, task_id, None, worker_id).await?;
        db::mark_assigned(pool, task_id).await?;
        Ok(())
    }

    /// The operator override for an `escalated` task: back to `queued`
    /// for a fresh attempt. Not a plain `transition` call because it also
    /// clears the blocked/escalation bookkeeping on the task row.
    pub async fn operator_retry(pool: &PgPool, task_id: Uuid) -> Result<()> {
        let rows = db::reset_to_queued(pool, task_id).await?;
        if rows == 0 {
            bail!("task {task_id} is not in escalated status, cannot retry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn queued_starting_in_progress_is_valid() {
        assert!(TaskStateMachine::is_valid_transition(Queued, Starting));
        assert!(TaskStateMachine::is_valid_transition(Starting, InProgress));
    }

    #[test]
    fn throttle_and_resume_round_trip() {
        assert!(TaskStateMachine::is_valid_transition(InProgress, Throttled));
        assert!(TaskStateMachine::is_valid_transition(Throttled, InProgress));
    }

    #[test]
    fn blocked_and_resume_round_trip() {
        assert!(TaskStateMachine::is_valid_transition(InProgress, Blocked));
        assert!(TaskStateMachine::is_valid_transition(Blocked, InProgress));
    }

    #[test]
    fn done_only_reachable_from_in_progress() {
        assert!(TaskStateMachine::is_valid_transition(InProgress, Done));
        assert!(!TaskStateMachine::is_valid_transition(Throttled, Done));
        assert!(!TaskStateMachine::is_valid_transition(Blocked, Done));
    }

    #[test]
    fn escalation_reachable_from_in_progress_throttled_and_blocked() {
        assert!(TaskStateMachine::is_valid_transition(InProgress, Escalated));
        assert!(TaskStateMachine::is_valid_transition(Throttled, Escalated));
        assert!(TaskStateMachine::is_valid_transition(Blocked, Escalated));
    }

    #[test]
    fn escalated_only_returns_to_queued() {
        assert!(TaskStateMachine::is_valid_transition(Escalated, Queued));
        assert!(!TaskStateMachine::is_valid_transition(Escalated, InProgress));
    }

    #[test]
    fn done_is_terminal() {
        assert!(!TaskStateMachine::is_valid_transition(Done, Queued));
        assert!(!TaskStateMachine::is_valid_transition(Done, InProgress));
    }
}
