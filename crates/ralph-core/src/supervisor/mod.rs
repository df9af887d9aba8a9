//! Supervisors (spec §4.4): watchdog, stall detector, guardrail, and loop
//! detector. Each inspects a [`SupervisorTrip`] (or, for the loop detector,
//! a gate-command failure signature) and returns a typed verdict — trips
//! are never raised as exceptions, only returned.

pub mod guardrail;
pub mod loop_detector;
pub mod stall;
pub mod watchdog;

use serde::{Deserialize, Serialize};

use ralph_db::models::{BlockedSource, EscalationCause};

/// What a supervisor decided should happen next. A supervisor trip never
/// counts as success — there is no `Continue` variant that means "treat the
/// session result as passing"; the session's own success flag governs that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorVerdict {
    /// First trip: requeue the task as blocked with the given source/reason
    /// so it gets picked back up.
    Requeue {
        source: BlockedSource,
        reason: String,
    },
    /// Repeat trip, or a restart budget exhausted: terminal.
    Escalate { cause: String, reason: String },
}

/// A bundle of retry counters read off the task row, passed to each
/// supervisor's decision function so it can tell a first trip from a
/// repeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCounters {
    pub watchdog_retries: i32,
    pub stall_retries: i32,
    pub guardrail_retries: i32,
}

/// Map a supervisor's own cause tag (`SupervisorVerdict::Escalate.cause`)
/// to the persisted terminal taxonomy (spec §7/§8). Unrecognized tags fall
/// back to `RuntimeError` rather than panicking, since this list has to
/// track whatever tags the supervisors below emit.
pub fn escalation_cause(cause: &str) -> EscalationCause {
    match cause {
        "watchdog" => EscalationCause::WatchdogRepeat,
        "stall" => EscalationCause::StallMaxRestarts,
        "guardrail" => EscalationCause::GuardrailRepeat,
        "loop_detected" => EscalationCause::LoopDetected,
        _ => EscalationCause::RuntimeError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_cause_maps_known_tags() {
        assert_eq!(escalation_cause("watchdog"), EscalationCause::WatchdogRepeat);
        assert_eq!(escalation_cause("stall"), EscalationCause::StallMaxRestarts);
        assert_eq!(escalation_cause("guardrail"), EscalationCause::GuardrailRepeat);
        assert_eq!(escalation_cause("loop_detected"), EscalationCause::LoopDetected);
    }

    #[test]
    fn escalation_cause_falls_back_to_runtime_error() {
        assert_eq!(escalation_cause("unknown_tag"), EscalationCause::RuntimeError);
    }
}
