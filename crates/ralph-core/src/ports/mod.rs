//! External collaborators, reached through typed interfaces (spec §6).
//!
//! No production transport implementation ships in this crate: GitHub
//! REST/GraphQL, the task-queue backend, the agent-session runtime, and
//! notification sinks are all out of scope. `ralph-test-utils` carries the
//! only real implementations, as fakes for exercising the Worker's control
//! flow in tests. `ralph-cli`'s demonstration binary wires stub adapters
//! that log and return canned results.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ralph_db::models::{Task, TaskStatus};

// ---------------------------------------------------------------------------
// Queue Port
// ---------------------------------------------------------------------------

/// A narrow patch applied alongside a status transition — the typed
/// replacement for a dynamic dict of fields to update (spec §9 Design
/// Notes: "dynamic dicts replaced by typed Task + narrow patch API").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub session_id: Option<String>,
    pub worker_id: Option<String>,
    pub worktree_path: Option<String>,
    pub agent_profile: Option<String>,
    pub blocked_reason: Option<String>,
    pub resume_at: Option<DateTime<Utc>>,
}

/// The task-queue backend: the only mutator of task status visible to the
/// Worker. `update_task_status` is expected to apply the patch
/// transactionally and return `false` if another worker already moved the
/// task out of its expected prior state (optimistic-lock failure).
#[async_trait]
pub trait QueuePort: Send + Sync {
    async fn update_task_status(
        &self,
        task: &Task,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> anyhow::Result<bool>;
}

// ---------------------------------------------------------------------------
// Session Port
// ---------------------------------------------------------------------------

/// Structured error code on a [`SessionResult`] — the typed replacement for
/// exceptions-as-control-flow (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
    ContextLengthExceeded,
    AuthFailure,
    Timeout,
    TransportError,
}

/// A supervisor trip attached to a [`SessionResult`], carrying the reason,
/// threshold, and context the supervisor fired with. Never raised as an
/// exception — always a field on the typed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorTrip {
    pub reason: String,
    pub threshold_ms: Option<u64>,
    pub context: serde_json::Value,
}

/// A single event emitted by a session (tool call, message, token usage,
/// completion marker) — recorded on the Run Ledger best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Message { role: String, content: String },
    ToolCall { tool: String, input: serde_json::Value },
    ToolResult { tool: String, output: String },
    TokenUsage { input_tokens: u64, output_tokens: u64 },
    Text { text: String },
}

/// The typed sum-type result of a session invocation. Supervisor trips and
/// error codes are carried as fields, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub success: bool,
    pub output: String,
    pub session_id: Option<String>,
    pub pr_url: Option<String>,
    pub error_code: Option<SessionErrorCode>,
    pub watchdog_timeout: Option<SupervisorTrip>,
    pub stall_timeout: Option<SupervisorTrip>,
    pub guardrail_timeout: Option<SupervisorTrip>,
    pub loop_trip: Option<SupervisorTrip>,
    pub events: Vec<SessionEvent>,
    pub metrics: HashMap<String, serde_json::Value>,
}

impl SessionResult {
    pub fn has_any_trip(&self) -> bool {
        self.watchdog_timeout.is_some()
            || self.stall_timeout.is_some()
            || self.guardrail_timeout.is_some()
            || self.loop_trip.is_some()
    }
}

/// The agent-session runtime: runs a fresh session, continues an existing
/// one, or runs a short throwaway command (CI-debug prompts, merge-conflict
/// resolution) inside a session's working directory.
#[async_trait]
pub trait SessionPort: Send + Sync {
    async fn run_agent(
        &self,
        task: &Task,
        profile: &str,
        prompt: &str,
        working_dir: &str,
    ) -> anyhow::Result<SessionResult>;

    async fn continue_session(
        &self,
        session_id: &str,
        prompt: &str,
        working_dir: &str,
    ) -> anyhow::Result<SessionResult>;

    async fn continue_command(
        &self,
        session_id: &str,
        command: &str,
        working_dir: &str,
    ) -> anyhow::Result<SessionResult>;

    /// The `XDG_CACHE_HOME` a spawned session should use, scoped per task so
    /// concurrent sessions do not share caches.
    fn xdg_cache_home(&self, task: &Task) -> String;
}

// ---------------------------------------------------------------------------
// GitHub Port
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone)]
#[error("GitHub API error {status}{code_suffix}: {response_text}", code_suffix = self.code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct GitHubApiError {
    pub status: u16,
    pub code: Option<String>,
    pub response_text: String,
    pub request_id: Option<String>,
    pub resume_at_ts: Option<i64>,
}

impl GitHubApiError {
    pub fn is_rate_limit(&self) -> bool {
        self.status == 403 || self.status == 429
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueView {
    pub number: i64,
    pub state: String,
    pub labels: Vec<String>,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchProtection {
    pub required_status_checks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub conclusion: CheckConclusion,
    pub logs_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrView {
    pub url: String,
    pub number: i64,
    pub head_sha: String,
    pub base_branch: String,
    pub head_branch: String,
    pub draft: bool,
    /// GitHub's `mergeStateStatus` equivalent, e.g. "CLEAN", "DIRTY",
    /// "BEHIND", "BLOCKED".
    pub merge_state_status: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrMergeCandidate {
    pub mergeable: bool,
    pub merge_state_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrFile {
    pub path: String,
}

/// GitHub Port: every repository operation Ralph needs, behind one trait.
/// No production implementation ships in this repository.
#[async_trait]
pub trait GitHubPort: Send + Sync {
    async fn issue_view(&self, repo: &str, issue_number: i64) -> Result<IssueView, GitHubApiError>;
    async fn list_issue_comments(&self, repo: &str, issue_number: i64) -> Result<Vec<Comment>, GitHubApiError>;
    async fn create_comment(&self, repo: &str, issue_number: i64, body: &str) -> Result<Comment, GitHubApiError>;
    async fn update_comment(&self, repo: &str, comment_id: &str, body: &str) -> Result<(), GitHubApiError>;
    async fn add_label(&self, repo: &str, issue_number: i64, label: &str) -> Result<(), GitHubApiError>;
    async fn remove_label(&self, repo: &str, issue_number: i64, label: &str) -> Result<(), GitHubApiError>;
    async fn get_branch_protection(&self, repo: &str, branch: &str) -> Result<BranchProtection, GitHubApiError>;
    async fn put_branch_protection(&self, repo: &str, branch: &str, protection: &BranchProtection) -> Result<(), GitHubApiError>;
    async fn get_commit_check_runs(&self, repo: &str, sha: &str) -> Result<Vec<CheckRun>, GitHubApiError>;
    async fn get_commit_statuses(&self, repo: &str, sha: &str) -> Result<Vec<CheckRun>, GitHubApiError>;
    async fn get_git_ref(&self, repo: &str, reference: &str) -> Result<String, GitHubApiError>;
    async fn create_git_ref(&self, repo: &str, reference: &str, sha: &str) -> Result<(), GitHubApiError>;
    async fn pr_search_by_issue_link(&self, repo: &str, issue_number: i64) -> Result<Vec<PrView>, GitHubApiError>;
    async fn pr_view(&self, repo: &str, pr_number: i64) -> Result<PrView, GitHubApiError>;
    async fn pr_merge_candidate(&self, repo: &str, pr_number: i64) -> Result<PrMergeCandidate, GitHubApiError>;
    async fn pr_files(&self, repo: &str, pr_number: i64) -> Result<Vec<PrFile>, GitHubApiError>;
    async fn pr_merge(&self, repo: &str, pr_number: i64) -> Result<(), GitHubApiError>;
    async fn pr_update_branch(&self, repo: &str, pr_number: i64) -> Result<(), GitHubApiError>;
    async fn delete_ref(&self, repo: &str, reference: &str) -> Result<(), GitHubApiError>;
}

// ---------------------------------------------------------------------------
// Throttle Port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    Ok,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleDecision {
    pub state: ThrottleState,
    pub resume_at_ts: Option<i64>,
    pub snapshot: serde_json::Value,
}

#[async_trait]
pub trait ThrottlePort: Send + Sync {
    async fn get_throttle_decision(&self, now_ms: i64, profile: &str) -> anyhow::Result<ThrottleDecision>;
}

// ---------------------------------------------------------------------------
// Notify Port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NotifyPort: Send + Sync {
    async fn notify_escalation(&self, task: &Task, reason: &str) -> anyhow::Result<()>;
    async fn notify_error(&self, task: &Task, message: &str) -> anyhow::Result<()>;
    async fn notify_task_complete(&self, task: &Task, pr_url: Option<&str>) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// State Store
// ---------------------------------------------------------------------------

/// The State Store: token totals accumulated per task across its runs.
/// `ralph-db` persists runs, checkpoints, and comment-marker state
/// directly; this narrower port covers only the one piece — cumulative
/// token usage — that has no backing table of its own in this
/// repository's migrations, so implementations are free to keep it in
/// memory.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_token_total(&self, task_id: uuid::Uuid) -> anyhow::Result<u64>;
    async fn add_token_usage(&self, task_id: uuid::Uuid, input_tokens: u64, output_tokens: u64) -> anyhow::Result<()>;
}
