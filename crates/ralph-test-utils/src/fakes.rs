//! Fake implementations of Ralph's external Ports (spec §6), in-memory and
//! configurable, so Worker control flow is testable without GitHub, a
//! queue backend, or a real agent-session runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use ralph_core::ports::{
    BranchProtection, CheckRun, Comment, GitHubApiError, GitHubPort, IssueView, NotifyPort, PrFile, PrMergeCandidate,
    PrView, QueuePort, SessionPort, SessionResult, StateStore, TaskPatch, ThrottleDecision, ThrottlePort, ThrottleState,
};
use ralph_db::models::{Task, TaskStatus};

fn not_found(what: &str) -> GitHubApiError {
    GitHubApiError { status: 404, code: None, response_text: format!("{what} not found"), request_id: None, resume_at_ts: None }
}

/// An in-memory stand-in for the GitHub Port. Tests seed state through the
/// `with_*`/`set_*` methods and assert against the recorded call log.
pub struct FakeGitHubPort {
    issues: Mutex<HashMap<(String, i64), IssueView>>,
    comments: Mutex<HashMap<(String, i64), Vec<Comment>>>,
    branch_protections: Mutex<HashMap<(String, String), BranchProtection>>,
    check_runs: Mutex<HashMap<(String, String), Vec<CheckRun>>>,
    pr_views: Mutex<HashMap<(String, i64), PrView>>,
    pr_search_results: Mutex<HashMap<(String, i64), Vec<PrView>>>,
    pr_files: Mutex<HashMap<(String, i64), Vec<PrFile>>>,
    merge_should_fail: Mutex<Option<String>>,
    pub merge_calls: Mutex<Vec<(String, i64)>>,
    pub update_branch_calls: Mutex<Vec<(String, i64)>>,
    pub deleted_refs: Mutex<Vec<(String, String)>>,
    pub added_labels: Mutex<Vec<(String, i64, String)>>,
}

impl Default for FakeGitHubPort {
    fn default() -> Self {
        Self {
            issues: Mutex::new(HashMap::new()),
            comments: Mutex::new(HashMap::new()),
            branch_protections: Mutex::new(HashMap::new()),
            check_runs: Mutex::new(HashMap::new()),
            pr_views: Mutex::new(HashMap::new()),
            pr_search_results: Mutex::new(HashMap::new()),
            pr_files: Mutex::new(HashMap::new()),
            merge_should_fail: Mutex::new(None),
            merge_calls: Mutex::new(Vec::new()),
            update_branch_calls: Mutex::new(Vec::new()),
            deleted_refs: Mutex::new(Vec::new()),
            added_labels: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGitHubPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_issue(&self, repo: &str, issue_number: i64, issue: IssueView) {
        self.issues.lock().unwrap().insert((repo.to_string(), issue_number), issue);
    }

    pub fn set_pr_view(&self, repo: &str, pr: PrView) {
        self.pr_views.lock().unwrap().insert((repo.to_string(), pr.number), pr);
    }

    pub fn set_branch_protection(&self, repo: &str, branch: &str, required: Vec<String>) {
        self.branch_protections
            .lock()
            .unwrap()
            .insert((repo.to_string(), branch.to_string()), BranchProtection { required_status_checks: required });
    }

    pub fn set_check_runs(&self, repo: &str, sha: &str, checks: Vec<CheckRun>) {
        self.check_runs.lock().unwrap().insert((repo.to_string(), sha.to_string()), checks);
    }

    pub fn set_pr_search_results(&self, repo: &str, issue_number: i64, results: Vec<PrView>) {
        self.pr_search_results.lock().unwrap().insert((repo.to_string(), issue_number), results);
    }

    pub fn set_pr_files(&self, repo: &str, pr_number: i64, files: Vec<PrFile>) {
        self.pr_files.lock().unwrap().insert((repo.to_string(), pr_number), files);
    }

    pub fn fail_merge(&self, response_text: &str) {
        *self.merge_should_fail.lock().unwrap() = Some(response_text.to_string());
    }
}

#[async_trait]
impl GitHubPort for FakeGitHubPort {
    async fn issue_view(&self, repo: &str, issue_number: i64) -> Result<IssueView, GitHubApiError> {
        self.issues
            .lock()
            .unwrap()
            .get(&(repo.to_string(), issue_number))
            .cloned()
            .ok_or_else(|| not_found("issue"))
    }

    async fn list_issue_comments(&self, repo: &str, issue_number: i64) -> Result<Vec<Comment>, GitHubApiError> {
        Ok(self.comments.lock().unwrap().get(&(repo.to_string(), issue_number)).cloned().unwrap_or_default())
    }

    async fn create_comment(&self, repo: &str, issue_number: i64, body: &str) -> Result<Comment, GitHubApiError> {
        let comment = Comment { id: uuid::Uuid::new_v4().to_string(), body: body.to_string(), created_at: Utc::now(), updated_at: Utc::now() };
        self.comments
            .lock()
            .unwrap()
            .entry((repo.to_string(), issue_number))
            .or_default()
            .push(comment.clone());
        Ok(comment)
    }

    async fn update_comment(&self, _repo: &str, _comment_id: &str, _body: &str) -> Result<(), GitHubApiError> {
        Ok(())
    }

    async fn add_label(&self, repo: &str, issue_number: i64, label: &str) -> Result<(), GitHubApiError> {
        self.added_labels.lock().unwrap().push((repo.to_string(), issue_number, label.to_string()));
        Ok(())
    }

    async fn remove_label(&self, _repo: &str, _issue_number: i64, _label: &str) -> Result<(), GitHubApiError> {
        Ok(())
    }

    async fn get_branch_protection(&self, repo: &str, branch: &str) -> Result<BranchProtection, GitHubApiError> {
        Ok(self
            .branch_protections
            .lock()
            .unwrap()
            .get(&(repo.to_string(), branch.to_string()))
            .cloned()
            .unwrap_or(BranchProtection { required_status_checks: vec![] }))
    }

    async fn put_branch_protection(&self, repo: &str, branch: &str, protection: &BranchProtection) -> Result<(), GitHubApiError> {
        self.branch_protections.lock().unwrap().insert((repo.to_string(), branch.to_string()), protection.clone());
        Ok(())
    }

    async fn get_commit_check_runs(&self, repo: &str, sha: &str) -> Result<Vec<CheckRun>, GitHubApiError> {
        Ok(self.check_runs.lock().unwrap().get(&(repo.to_string(), sha.to_string())).cloned().unwrap_or_default())
    }

    async fn get_commit_statuses(&self, repo: &str, sha: &str) -> Result<Vec<CheckRun>, GitHubApiError> {
        self.get_commit_check_runs(repo, sha).await
    }

    async fn get_git_ref(&self, _repo: &str, _reference: &str) -> Result<String, GitHubApiError> {
        Ok("0".repeat(40))
    }

    async fn create_git_ref(&self, _repo: &str, _reference: &str, _sha: &str) -> Result<(), GitHubApiError> {
        Ok(())
    }

    async fn pr_search_by_issue_link(&self, repo: &str, issue_number: i64) -> Result<Vec<PrView>, GitHubApiError> {
        Ok(self.pr_search_results.lock().unwrap().get(&(repo.to_string(), issue_number)).cloned().unwrap_or_default())
    }

    async fn pr_view(&self, repo: &str, pr_number: i64) -> Result<PrView, GitHubApiError> {
        self.pr_views.lock().unwrap().get(&(repo.to_string(), pr_number)).cloned().ok_or_else(|| not_found("pr"))
    }

    async fn pr_merge_candidate(&self, repo: &str, pr_number: i64) -> Result<PrMergeCandidate, GitHubApiError> {
        let view = self.pr_view(repo, pr_number).await?;
        Ok(PrMergeCandidate { mergeable: view.merge_state_status == "CLEAN", merge_state_status: view.merge_state_status })
    }

    async fn pr_files(&self, repo: &str, pr_number: i64) -> Result<Vec<PrFile>, GitHubApiError> {
        Ok(self.pr_files.lock().unwrap().get(&(repo.to_string(), pr_number)).cloned().unwrap_or_default())
    }

    async fn pr_merge(&self, repo: &str, pr_number: i64) -> Result<(), GitHubApiError> {
        self.merge_calls.lock().unwrap().push((repo.to_string(), pr_number));
        if let Some(text) = self.merge_should_fail.lock().unwrap().clone() {
            return Err(GitHubApiError { status: 405, code: None, response_text: text, request_id: None, resume_at_ts: None });
        }
        Ok(())
    }

    async fn pr_update_branch(&self, repo: &str, pr_number: i64) -> Result<(), GitHubApiError> {
        self.update_branch_calls.lock().unwrap().push((repo.to_string(), pr_number));
        Ok(())
    }

    async fn delete_ref(&self, repo: &str, reference: &str) -> Result<(), GitHubApiError> {
        self.deleted_refs.lock().unwrap().push((repo.to_string(), reference.to_string()));
        Ok(())
    }
}

/// A fake Session Port returning a preconfigured [`SessionResult`] for
/// every call, recording the prompts it was invoked with.
pub struct FakeSessionPort {
    result: Mutex<SessionResult>,
    pub run_agent_calls: Mutex<Vec<String>>,
    pub continue_calls: Mutex<Vec<String>>,
}

impl FakeSessionPort {
    pub fn succeeding(pr_url: Option<&str>) -> Self {
        Self {
            result: Mutex::new(SessionResult {
                success: true,
                output: "done".to_string(),
                session_id: Some("session-1".to_string()),
                pr_url: pr_url.map(|s| s.to_string()),
                error_code: None,
                watchdog_timeout: None,
                stall_timeout: None,
                guardrail_timeout: None,
                loop_trip: None,
                events: vec![],
                metrics: HashMap::new(),
            }),
            run_agent_calls: Mutex::new(Vec::new()),
            continue_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_result(&self, result: SessionResult) {
        *self.result.lock().unwrap() = result;
    }
}

#[async_trait]
impl SessionPort for FakeSessionPort {
    async fn run_agent(&self, _task: &Task, _profile: &str, prompt: &str, _working_dir: &str) -> anyhow::Result<SessionResult> {
        self.run_agent_calls.lock().unwrap().push(prompt.to_string());
        Ok(self.result.lock().unwrap().clone())
    }

    async fn continue_session(&self, _session_id: &str, prompt: &str, _working_dir: &str) -> anyhow::Result<SessionResult> {
        self.continue_calls.lock().unwrap().push(prompt.to_string());
        Ok(self.result.lock().unwrap().clone())
    }

    async fn continue_command(&self, _session_id: &str, command: &str, _working_dir: &str) -> anyhow::Result<SessionResult> {
        self.continue_calls.lock().unwrap().push(command.to_string());
        Ok(self.result.lock().unwrap().clone())
    }

    fn xdg_cache_home(&self, task: &Task) -> String {
        format!("/tmp/ralph-test-cache/{}", task.task_key)
    }
}

/// A Throttle Port that always reports `Ok`, unless configured otherwise.
pub struct FakeThrottlePort {
    decision: Mutex<ThrottleDecision>,
}

impl Default for FakeThrottlePort {
    fn default() -> Self {
        Self { decision: Mutex::new(ThrottleDecision { state: ThrottleState::Ok, resume_at_ts: None, snapshot: serde_json::json!({}) }) }
    }
}

impl FakeThrottlePort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_decision(&self, decision: ThrottleDecision) {
        *self.decision.lock().unwrap() = decision;
    }
}

#[async_trait]
impl ThrottlePort for FakeThrottlePort {
    async fn get_throttle_decision(&self, _now_ms: i64, _profile: &str) -> anyhow::Result<ThrottleDecision> {
        Ok(self.decision.lock().unwrap().clone())
    }
}

/// A Notify Port that records every call instead of sending anything.
#[derive(Default)]
pub struct FakeNotifyPort {
    pub escalations: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
    pub completions: Mutex<Vec<Option<String>>>,
}

impl FakeNotifyPort {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotifyPort for FakeNotifyPort {
    async fn notify_escalation(&self, _task: &Task, reason: &str) -> anyhow::Result<()> {
        self.escalations.lock().unwrap().push(reason.to_string());
        Ok(())
    }

    async fn notify_error(&self, _task: &Task, message: &str) -> anyhow::Result<()> {
        self.errors.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn notify_task_complete(&self, _task: &Task, pr_url: Option<&str>) -> anyhow::Result<()> {
        self.completions.lock().unwrap().push(pr_url.map(|s| s.to_string()));
        Ok(())
    }
}

/// A Queue Port that accepts every transition — used when a test drives
/// the Worker directly against `ralph-db` and does not need the queue's
/// own optimistic-lock semantics exercised separately.
#[derive(Default)]
pub struct FakeQueuePort;

#[async_trait]
impl QueuePort for FakeQueuePort {
    async fn update_task_status(&self, _task: &Task, _status: TaskStatus, _patch: TaskPatch) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// An in-memory State Store for token accounting.
#[derive(Default)]
pub struct FakeStateStore {
    totals: Mutex<HashMap<uuid::Uuid, (u64, u64)>>,
}

impl FakeStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for FakeStateStore {
    async fn get_token_total(&self, task_id: uuid::Uuid) -> anyhow::Result<u64> {
        let totals = self.totals.lock().unwrap();
        Ok(totals.get(&task_id).map(|(i, o)| i + o).unwrap_or(0))
    }

    async fn add_token_usage(&self, task_id: uuid::Uuid, input_tokens: u64, output_tokens: u64) -> anyhow::Result<()> {
        let mut totals = self.totals.lock().unwrap();
        let entry = totals.entry(task_id).or_insert((0, 0));
        entry.0 += input_tokens;
        entry.1 += output_tokens;
        Ok(())
    }
}

