//! Loop detector: watches a rolling window of failure signatures (CI
//! triage signatures, merge-conflict file sets, or a session's own
//! self-reported loop trip) and declares no-progress when the same
//! signature repeats past a threshold. Unlike the other supervisors there
//! is no retry budget to consult on the task row — a loop trip is always
//! terminal, since by definition retrying has already been tried and
//! produced the same outcome.

use ralph_db::models::BlockedSource;

use crate::ports::SupervisorTrip;

use super::SupervisorVerdict;

/// How many times the same signature may repeat before it counts as a
/// loop. A value of 1 means "no repeats tolerated".
pub const DEFAULT_REPEAT_THRESHOLD: usize = 2;

/// Count the longest run of consecutive equal signatures at the end of
/// `history` (the most recent attempts first is not assumed; callers pass
/// history in chronological order, oldest first).
pub fn longest_trailing_run(history: &[String]) -> usize {
    let mut iter = history.iter().rev();
    let Some(last) = iter.next() else {
        return 0;
    };
    let mut run = 1;
    for sig in iter {
        if sig == last {
            run += 1;
        } else {
            break;
        }
    }
    run
}

/// True once the trailing run of identical signatures meets or exceeds
/// `threshold`.
pub fn is_no_progress(history: &[String], threshold: usize) -> bool {
    longest_trailing_run(history) >= threshold
}

/// Handle a session-reported loop trip. There is no requeue path: a loop
/// trip is always terminal.
pub fn handle_trip(trip: &SupervisorTrip) -> SupervisorVerdict {
    SupervisorVerdict::Escalate {
        cause: "loop_detected".to_string(),
        reason: trip.reason.clone(),
    }
}

/// Handle a signature-repeat detection outside of a session trip (e.g. CI
/// triage observing the same check-failure fingerprint across attempts).
pub fn handle_signature_repeat(signature: &str, run_len: usize) -> SupervisorVerdict {
    SupervisorVerdict::Escalate {
        cause: "loop_detected".to_string(),
        reason: format!("signature repeated {run_len} times: {signature}"),
    }
}

/// Not used for escalation directly, but exposed so callers that prefer
/// to requeue with a blocked source (e.g. a single repeat that hasn't yet
/// crossed the threshold) have the right taxonomy value at hand.
pub const BLOCKED_SOURCE: BlockedSource = BlockedSource::Stall;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_has_no_run() {
        assert_eq!(longest_trailing_run(&[]), 0);
    }

    #[test]
    fn detects_trailing_repeat() {
        let history = vec!["a".to_string(), "b".to_string(), "b".to_string(), "b".to_string()];
        assert_eq!(longest_trailing_run(&history), 3);
        assert!(is_no_progress(&history, DEFAULT_REPEAT_THRESHOLD));
    }

    #[test]
    fn non_repeating_tail_is_not_no_progress() {
        let history = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(!is_no_progress(&history, DEFAULT_REPEAT_THRESHOLD));
    }
}
