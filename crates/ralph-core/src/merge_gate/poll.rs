//! Readiness polling (spec §4.8.1): drive a PR's required-check rollup to
//! a terminal summary, with capped exponential backoff on an unchanged
//! pending signature and an overall 45-minute timeout.

use std::time::Duration;

use rand::Rng;

use crate::ports::{CheckConclusion, CheckRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupSummary {
    Success,
    Pending,
    Failure,
}

pub const BASE_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(180);
pub const OVERALL_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Reduce the set of required-check runs to one summary. Only checks
/// named in `required` are consulted; anything else is ignored. Incomplete
/// runs (no conclusion yet) count as pending; failure/error/cancelled/
/// timed_out/action_required/stale all count as failure.
pub fn summarize(required: &[String], checks: &[CheckRun]) -> RollupSummary {
    let mut saw_pending = false;

    for name in required {
        let Some(check) = checks.iter().find(|c| &c.name == name) else {
            saw_pending = true;
            continue;
        };
        match check.conclusion {
            CheckConclusion::Success => {}
            CheckConclusion::Pending => saw_pending = true,
            CheckConclusion::Failure => return RollupSummary::Failure,
        }
    }

    if saw_pending {
        RollupSummary::Pending
    } else {
        RollupSummary::Success
    }
}

/// A stable signature for "nothing changed since last poll" detection:
/// the sorted list of `(name, conclusion)` pairs among the required
/// checks, concatenated.
pub fn rollup_signature(required: &[String], checks: &[CheckRun]) -> String {
    let mut pairs: Vec<String> = required
        .iter()
        .map(|name| {
            let conclusion = checks
                .iter()
                .find(|c| &c.name == name)
                .map(|c| format!("{:?}", c.conclusion))
                .unwrap_or_else(|| "missing".to_string());
            format!("{name}={conclusion}")
        })
        .collect();
    pairs.sort();
    pairs.join(",")
}

/// The next poll interval: doubled from `current` with jitter, capped at
/// [`MAX_POLL_INTERVAL`], when the rollup signature has not changed since
/// the prior poll.
pub fn next_interval(current: Duration, signature_unchanged: bool) -> Duration {
    if !signature_unchanged {
        return BASE_POLL_INTERVAL;
    }
    let doubled = std::cmp::min(current * 2, MAX_POLL_INTERVAL);
    let jitter_ms = rand::rng().random_range(0..=1000u64);
    std::cmp::min(doubled + Duration::from_millis(jitter_ms), MAX_POLL_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, conclusion: CheckConclusion) -> CheckRun {
        CheckRun { name: name.to_string(), conclusion, logs_url: None }
    }

    #[test]
    fn summarize_missing_check_is_pending() {
        let required = vec!["build".to_string()];
        assert_eq!(summarize(&required, &[]), RollupSummary::Pending);
    }

    #[test]
    fn summarize_all_success() {
        let required = vec!["build".to_string(), "test".to_string()];
        let checks = vec![check("build", CheckConclusion::Success), check("test", CheckConclusion::Success)];
        assert_eq!(summarize(&required, &checks), RollupSummary::Success);
    }

    #[test]
    fn summarize_any_failure_wins() {
        let required = vec!["build".to_string(), "test".to_string()];
        let checks = vec![check("build", CheckConclusion::Success), check("test", CheckConclusion::Failure)];
        assert_eq!(summarize(&required, &checks), RollupSummary::Failure);
    }

    #[test]
    fn next_interval_resets_on_change() {
        let interval = next_interval(Duration::from_secs(60), false);
        assert_eq!(interval, BASE_POLL_INTERVAL);
    }

    #[test]
    fn next_interval_caps_at_max() {
        let interval = next_interval(MAX_POLL_INTERVAL, true);
        assert!(interval <= MAX_POLL_INTERVAL + Duration::from_secs(1));
    }
}
