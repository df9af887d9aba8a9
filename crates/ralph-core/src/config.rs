//! Operational configuration (spec §6, SPEC_FULL §0.3): every tunable the
//! Worker and its subsystems consult at runtime. `ralph-cli` owns the
//! resolution chain (CLI flag > env var > TOML file > default) and the
//! on-disk file format; this type is what that chain ultimately produces.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fully resolved operational configuration for one Worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphConfig {
    pub database_url: String,
    /// Hex-decoded HMAC secret backing `RALPH_AGENT_TOKEN` issuance.
    pub token_secret_hex: String,
    /// Root directory under which all managed worktrees are created.
    pub worktree_root: String,
    /// Repos this process is permitted to operate on.
    pub allowlist: Vec<String>,
    /// Required-check context names consulted by the merge gate when a
    /// repo has no branch-protection rule configured.
    pub required_checks_override: Vec<String>,
    /// Per-repo concurrency slot count.
    pub concurrency_slots: u32,
    pub pr_create_lease_ttl_secs: i64,
    pub merge_conflict_lease_ttl_secs: i64,
    pub ci_triage_max_attempts: u32,
    /// Upper bound on total time a task may spend cycling through
    /// CI-quarantine backoff before the Worker gives up and escalates.
    /// Left unenforced by default (spec §9 Open Question): set `None` to
    /// keep the previous behavior of only bounding by attempt count.
    pub ci_quarantine_max_total_secs: Option<u64>,
    pub watchdog_timeout: Duration,
    pub stall_timeout: Duration,
    pub guardrail_timeout: Duration,
    pub default_agent_profile: String,
    /// Labels preflight ensures exist on an issue before work starts
    /// (spec §4.1 preflight step 4).
    pub baseline_labels: Vec<String>,
}

impl RalphConfig {
    /// A configuration with conservative defaults, suitable for tests and
    /// as the base the CLI's resolution chain falls back to.
    pub fn defaults(database_url: impl Into<String>, token_secret_hex: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            token_secret_hex: token_secret_hex.into(),
            worktree_root: "/var/lib/ralph/worktrees".to_string(),
            allowlist: Vec::new(),
            required_checks_override: Vec::new(),
            concurrency_slots: 1,
            pr_create_lease_ttl_secs: 600,
            merge_conflict_lease_ttl_secs: 20 * 60,
            ci_triage_max_attempts: 3,
            ci_quarantine_max_total_secs: None,
            watchdog_timeout: Duration::from_secs(20 * 60),
            stall_timeout: Duration::from_secs(10 * 60),
            guardrail_timeout: Duration::from_secs(45 * 60),
            default_agent_profile: "default".to_string(),
            baseline_labels: vec!["ralph".to_string()],
        }
    }

    /// True if `repo` (owner/name) appears in the allowlist. An empty
    /// allowlist permits nothing — an operator must opt repos in
    /// explicitly.
    pub fn repo_allowed(&self, repo: &str) -> bool {
        self.allowlist.iter().any(|r| r == repo)
    }

    /// The managed git clone this process creates worktrees off of for
    /// `repo`, nested under the worktree root: `<worktree_root>/_repos/
    /// <repo-key>`. No clone-provisioning transport ships in this
    /// repository (DESIGN.md); callers treat a missing clone as "no
    /// worktree manager available" and fall back accordingly.
    pub fn repo_clone_path(&self, repo: &str) -> PathBuf {
        PathBuf::from(&self.worktree_root).join("_repos").join(crate::paths::repo_key(repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_permits_nothing() {
        let cfg = RalphConfig::defaults("postgresql://localhost/ralph", "aa".repeat(32));
        assert!(!cfg.repo_allowed("acme/repo"));
    }

    #[test]
    fn allowlisted_repo_is_permitted() {
        let mut cfg = RalphConfig::defaults("postgresql://localhost/ralph", "aa".repeat(32));
        cfg.allowlist.push("acme/repo".to_string());
        assert!(cfg.repo_allowed("acme/repo"));
    }
}
