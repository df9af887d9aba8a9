//! CI Triage (spec §4.8.2): a pure decision function mapping a failure
//! signature and attempt history to one of {resume, spawn, quarantine,
//! escalate}. Kept side-effect-free so it can be exhaustively unit tested;
//! callers in `merge_gate::mod` carry out whichever action it picks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingCheck {
    pub name: String,
    pub raw_state: String,
    pub log_excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageInput {
    pub timed_out: bool,
    pub failing_checks: Vec<FailingCheck>,
    pub detected_commands: Vec<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub has_session: bool,
    pub signature: String,
    pub prior_signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageAction {
    Resume,
    Spawn,
    Quarantine,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub classification: String,
    pub action: TriageAction,
    pub reason: String,
}

/// Backoff (seconds) applied to a quarantine verdict, capped-exponential
/// by attempt number with no jitter here (the throttle gate adds its own
/// when it resumes the task).
pub fn quarantine_backoff_secs(attempt: u32) -> u64 {
    let base = 30u64;
    let capped_attempt = attempt.min(6);
    (base * 2u64.pow(capped_attempt)).min(3600)
}

/// Decide the triage action. Pure function: no I/O, no mutation.
pub fn decide(input: &TriageInput) -> TriageVerdict {
    if input.attempt >= input.max_attempts {
        return TriageVerdict {
            classification: "attempts-exhausted".to_string(),
            action: TriageAction::Escalate,
            reason: format!(
                "CI triage attempt {} reached the max of {}",
                input.attempt, input.max_attempts
            ),
        };
    }

    let no_progress = input
        .prior_signature
        .as_deref()
        .is_some_and(|prior| prior == input.signature);
    if no_progress {
        return TriageVerdict {
            classification: "no-progress".to_string(),
            action: TriageAction::Escalate,
            reason: "identical failure signature across attempts, no progress detected".to_string(),
        };
    }

    if input.timed_out {
        return TriageVerdict {
            classification: "timeout".to_string(),
            action: TriageAction::Quarantine,
            reason: "required-checks polling timed out before reaching a terminal summary".to_string(),
        };
    }

    if looks_like_flake(&input.failing_checks) {
        return TriageVerdict {
            classification: "suspected-flake".to_string(),
            action: TriageAction::Quarantine,
            reason: "failing checks match a known flake/infra signature".to_string(),
        };
    }

    if input.has_session {
        return TriageVerdict {
            classification: "fixable-in-session".to_string(),
            action: TriageAction::Resume,
            reason: "an open session can attempt a CI fix in place".to_string(),
        };
    }

    TriageVerdict {
        classification: "fixable-needs-session".to_string(),
        action: TriageAction::Spawn,
        reason: "no open session; spawning a CI-debug worktree".to_string(),
    }
}

fn looks_like_flake(failing: &[FailingCheck]) -> bool {
    failing.iter().any(|c| {
        let name = c.name.to_ascii_lowercase();
        name.contains("flake") || c.raw_state.eq_ignore_ascii_case("cancelled")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> TriageInput {
        TriageInput {
            timed_out: false,
            failing_checks: vec![],
            detected_commands: vec![],
            attempt: 0,
            max_attempts: 3,
            has_session: false,
            signature: "sig-1".to_string(),
            prior_signature: None,
        }
    }

    #[test]
    fn escalates_when_attempts_exhausted() {
        let mut input = base_input();
        input.attempt = 3;
        assert_eq!(decide(&input).action, TriageAction::Escalate);
    }

    #[test]
    fn escalates_on_repeated_signature() {
        let mut input = base_input();
        input.prior_signature = Some("sig-1".to_string());
        assert_eq!(decide(&input).action, TriageAction::Escalate);
    }

    #[test]
    fn quarantines_on_timeout() {
        let mut input = base_input();
        input.timed_out = true;
        assert_eq!(decide(&input).action, TriageAction::Quarantine);
    }

    #[test]
    fn quarantines_flake_signature() {
        let mut input = base_input();
        input.failing_checks = vec![FailingCheck {
            name: "ci/flake".to_string(),
            raw_state: "failure".to_string(),
            log_excerpt: None,
        }];
        assert_eq!(decide(&input).action, TriageAction::Quarantine);
    }

    #[test]
    fn resumes_when_session_open() {
        let mut input = base_input();
        input.has_session = true;
        input.failing_checks = vec![FailingCheck {
            name: "test".to_string(),
            raw_state: "failure".to_string(),
            log_excerpt: Some("assertion failed".to_string()),
        }];
        assert_eq!(decide(&input).action, TriageAction::Resume);
    }

    #[test]
    fn spawns_when_no_session() {
        let mut input = base_input();
        input.failing_checks = vec![FailingCheck {
            name: "test".to_string(),
            raw_state: "failure".to_string(),
            log_excerpt: None,
        }];
        assert_eq!(decide(&input).action, TriageAction::Spawn);
    }

    #[test]
    fn quarantine_backoff_is_capped_exponential() {
        assert_eq!(quarantine_backoff_secs(0), 30);
        assert_eq!(quarantine_backoff_secs(1), 60);
        assert!(quarantine_backoff_secs(10) <= 3600);
    }
}
