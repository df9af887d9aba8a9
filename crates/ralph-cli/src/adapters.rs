//! Demonstration adapters for the Ports the Worker depends on.
//!
//! No production GitHub/queue/session-runtime implementation ships with
//! this repository (see `ralph_core::ports`); these stand-ins log every
//! call through `tracing` and return canned, always-succeeding results so
//! `ralph run` can exercise the Worker state machine end to end against a
//! real database without any external service configured.

use async_trait::async_trait;
use ralph_db::models::Task;

use ralph_core::ports::{
    BranchProtection, CheckConclusion, CheckRun, Comment, GitHubApiError, GitHubPort, IssueView,
    NotifyPort, PrFile, PrMergeCandidate, PrView, SessionPort, SessionResult, StateStore,
    ThrottleDecision, ThrottlePort, ThrottleState,
};
use ralph_db::queries::tasks::NewTask;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Stub `GitHubPort`: every read returns a canned, always-green view of a
/// single open PR; every write is logged and reported as successful.
pub struct StubGitHubPort;

#[async_trait]
impl GitHubPort for StubGitHubPort {
    async fn issue_view(&self, repo: &str, issue_number: i64) -> Result<IssueView, GitHubApiError> {
        tracing::info!(repo, issue_number, "stub: issue_view");
        Ok(IssueView {
            number: issue_number,
            state: "open".to_string(),
            labels: vec![],
            title: format!("issue #{issue_number}"),
        })
    }

    async fn list_issue_comments(&self, repo: &str, issue_number: i64) -> Result<Vec<Comment>, GitHubApiError> {
        tracing::info!(repo, issue_number, "stub: list_issue_comments");
        Ok(vec![])
    }

    async fn create_comment(&self, repo: &str, issue_number: i64, body: &str) -> Result<Comment, GitHubApiError> {
        tracing::info!(repo, issue_number, body, "stub: create_comment");
        Ok(Comment {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
    }

    async fn update_comment(&self, repo: &str, comment_id: &str, body: &str) -> Result<(), GitHubApiError> {
        tracing::info!(repo, comment_id, body, "stub: update_comment");
        Ok(())
    }

    async fn add_label(&self, repo: &str, issue_number: i64, label: &str) -> Result<(), GitHubApiError> {
        tracing::info!(repo, issue_number, label, "stub: add_label");
        Ok(())
    }

    async fn remove_label(&self, repo: &str, issue_number: i64, label: &str) -> Result<(), GitHubApiError> {
        tracing::info!(repo, issue_number, label, "stub: remove_label");
        Ok(())
    }

    async fn get_branch_protection(&self, repo: &str, branch: &str) -> Result<BranchProtection, GitHubApiError> {
        tracing::info!(repo, branch, "stub: get_branch_protection");
        Ok(BranchProtection { required_status_checks: vec!["build".to_string()] })
    }

    async fn put_branch_protection(&self, repo: &str, branch: &str, _protection: &BranchProtection) -> Result<(), GitHubApiError> {
        tracing::info!(repo, branch, "stub: put_branch_protection");
        Ok(())
    }

    async fn get_commit_check_runs(&self, repo: &str, sha: &str) -> Result<Vec<CheckRun>, GitHubApiError> {
        tracing::info!(repo, sha, "stub: get_commit_check_runs");
        Ok(vec![CheckRun { name: "build".to_string(), conclusion: CheckConclusion::Success, logs_url: None }])
    }

    async fn get_commit_statuses(&self, repo: &str, sha: &str) -> Result<Vec<CheckRun>, GitHubApiError> {
        tracing::info!(repo, sha, "stub: get_commit_statuses");
        Ok(vec![])
    }

    async fn get_git_ref(&self, repo: &str, reference: &str) -> Result<String, GitHubApiError> {
        tracing::info!(repo, reference, "stub: get_git_ref");
        Ok("0".repeat(40))
    }

    async fn create_git_ref(&self, repo: &str, reference: &str, sha: &str) -> Result<(), GitHubApiError> {
        tracing::info!(repo, reference, sha, "stub: create_git_ref");
        Ok(())
    }

    async fn pr_search_by_issue_link(&self, repo: &str, issue_number: i64) -> Result<Vec<PrView>, GitHubApiError> {
        tracing::info!(repo, issue_number, "stub: pr_search_by_issue_link");
        Ok(vec![])
    }

    async fn pr_view(&self, repo: &str, pr_number: i64) -> Result<PrView, GitHubApiError> {
        tracing::info!(repo, pr_number, "stub: pr_view");
        Ok(PrView {
            url: format!("https://github.com/{repo}/pull/{pr_number}"),
            number: pr_number,
            head_sha: "1".repeat(40),
            base_branch: "main".to_string(),
            head_branch: format!("ralph/pr-{pr_number}"),
            draft: false,
            merge_state_status: "CLEAN".to_string(),
            labels: vec![],
        })
    }

    async fn pr_merge_candidate(&self, repo: &str, pr_number: i64) -> Result<PrMergeCandidate, GitHubApiError> {
        tracing::info!(repo, pr_number, "stub: pr_merge_candidate");
        Ok(PrMergeCandidate { mergeable: true, merge_state_status: "CLEAN".to_string() })
    }

    async fn pr_files(&self, repo: &str, pr_number: i64) -> Result<Vec<PrFile>, GitHubApiError> {
        tracing::info!(repo, pr_number, "stub: pr_files");
        Ok(vec![])
    }

    async fn pr_merge(&self, repo: &str, pr_number: i64) -> Result<(), GitHubApiError> {
        tracing::info!(repo, pr_number, "stub: pr_merge");
        Ok(())
    }

    async fn pr_update_branch(&self, repo: &str, pr_number: i64) -> Result<(), GitHubApiError> {
        tracing::info!(repo, pr_number, "stub: pr_update_branch");
        Ok(())
    }

    async fn delete_ref(&self, repo: &str, reference: &str) -> Result<(), GitHubApiError> {
        tracing::info!(repo, reference, "stub: delete_ref");
        Ok(())
    }
}

/// Stub `SessionPort`: never actually spawns an agent session; returns a
/// canned success with a synthetic PR URL so the rest of the Worker's
/// control flow can be observed against a real database.
pub struct StubSessionPort;

#[async_trait]
impl SessionPort for StubSessionPort {
    async fn run_agent(&self, task: &Task, profile: &str, prompt: &str, working_dir: &str) -> anyhow::Result<SessionResult> {
        tracing::info!(task_id = %task.id, profile, working_dir, prompt_len = prompt.len(), "stub: run_agent");
        Ok(canned_success(task))
    }

    async fn continue_session(&self, session_id: &str, prompt: &str, working_dir: &str) -> anyhow::Result<SessionResult> {
        tracing::info!(session_id, working_dir, prompt_len = prompt.len(), "stub: continue_session");
        Ok(canned_success_no_task())
    }

    async fn continue_command(&self, session_id: &str, command: &str, working_dir: &str) -> anyhow::Result<SessionResult> {
        tracing::info!(session_id, working_dir, command, "stub: continue_command");
        Ok(canned_success_no_task())
    }

    fn xdg_cache_home(&self, task: &Task) -> String {
        format!("/tmp/ralph/cache/{}", task.id)
    }
}

fn canned_success(task: &Task) -> SessionResult {
    SessionResult {
        success: true,
        output: "stub session completed".to_string(),
        session_id: Some(format!("stub-session-{}", task.id)),
        pr_url: Some(format!("https://github.com/{}/pull/1", task.repo)),
        error_code: None,
        watchdog_timeout: None,
        stall_timeout: None,
        guardrail_timeout: None,
        loop_trip: None,
        events: vec![],
        metrics: HashMap::new(),
    }
}

fn canned_success_no_task() -> SessionResult {
    SessionResult {
        success: true,
        output: "stub session completed".to_string(),
        session_id: Some(format!("stub-session-{}", Uuid::new_v4())),
        pr_url: None,
        error_code: None,
        watchdog_timeout: None,
        stall_timeout: None,
        guardrail_timeout: None,
        loop_trip: None,
        events: vec![],
        metrics: HashMap::new(),
    }
}

/// Stub `ThrottlePort`: always reports headroom.
pub struct StubThrottlePort;

#[async_trait]
impl ThrottlePort for StubThrottlePort {
    async fn get_throttle_decision(&self, _now_ms: i64, profile: &str) -> anyhow::Result<ThrottleDecision> {
        tracing::debug!(profile, "stub: get_throttle_decision");
        Ok(ThrottleDecision { state: ThrottleState::Ok, resume_at_ts: None, snapshot: serde_json::json!({}) })
    }
}

/// Stub `NotifyPort`: logs instead of paging anyone.
pub struct StubNotifyPort;

#[async_trait]
impl NotifyPort for StubNotifyPort {
    async fn notify_escalation(&self, task: &Task, reason: &str) -> anyhow::Result<()> {
        tracing::warn!(task_id = %task.id, reason, "stub: notify_escalation");
        Ok(())
    }

    async fn notify_error(&self, task: &Task, message: &str) -> anyhow::Result<()> {
        tracing::warn!(task_id = %task.id, message, "stub: notify_error");
        Ok(())
    }

    async fn notify_task_complete(&self, task: &Task, pr_url: Option<&str>) -> anyhow::Result<()> {
        tracing::info!(task_id = %task.id, pr_url, "stub: notify_task_complete");
        Ok(())
    }
}

/// Stub `StateStore`: no `token_usage` table exists in this repository's
/// migrations, so totals live in process memory and reset on restart —
/// good enough to demonstrate the Worker's ledger footer without
/// inventing schema this repository doesn't otherwise need.
#[derive(Default)]
pub struct StubStateStore {
    totals: Mutex<HashMap<Uuid, (u64, u64)>>,
}

#[async_trait]
impl StateStore for StubStateStore {
    async fn get_token_total(&self, task_id: Uuid) -> anyhow::Result<u64> {
        let totals = self.totals.lock().expect("token totals mutex poisoned");
        Ok(totals.get(&task_id).map(|(i, o)| i + o).unwrap_or(0))
    }

    async fn add_token_usage(&self, task_id: Uuid, input_tokens: u64, output_tokens: u64) -> anyhow::Result<()> {
        let mut totals = self.totals.lock().expect("token totals mutex poisoned");
        let entry = totals.entry(task_id).or_insert((0, 0));
        entry.0 += input_tokens;
        entry.1 += output_tokens;
        Ok(())
    }
}

/// Helper kept alongside the stubs: builds a [`NewTask`] row's immutable
/// fields from the `ralph task enqueue` CLI arguments.
pub fn new_task<'a>(repo: &'a str, issue_number: i64, task_key: &'a str, task_display_name: &'a str, repo_slot: i32) -> NewTask<'a> {
    NewTask { repo, issue_number, task_key, task_display_name, repo_slot }
}
