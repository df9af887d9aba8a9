//! End-to-end Worker tests against a real Postgres instance and fake
//! Ports: the state graph, the happy merge path, and the blocked/
//! throttled/escalated branches a repo owner actually hits.

use chrono::Utc;
use uuid::Uuid;

use ralph_core::config::RalphConfig;
use ralph_core::ports::{CheckConclusion, CheckRun, IssueView, PrView};
use ralph_core::state::{dispatch, queries, TaskStateMachine};
use ralph_core::worker::{Worker, WorkerOutcome};
use ralph_db::models::{BlockedSource, TaskStatus};
use ralph_db::queries::tasks;
use ralph_test_utils::fakes::{FakeGitHubPort, FakeNotifyPort, FakeSessionPort, FakeStateStore, FakeThrottlePort};
use ralph_test_utils::{create_test_db, drop_test_db};

const REPO: &str = "acme/widgets";

async fn enqueue(pool: &sqlx::PgPool, issue_number: i64) -> ralph_db::models::Task {
    tasks::insert_task_idempotent(
        pool,
        tasks::NewTask {
            repo: REPO,
            issue_number,
            task_key: "default",
            task_display_name: "Fix the thing",
            repo_slot: 0,
        },
    )
    .await
    .expect("insert task")
}

/// Drive a freshly-queued task to `starting`, matching what a scheduler
/// does before ever calling the Worker.
async fn assign(pool: &sqlx::PgPool, task_id: Uuid) {
    dispatch::assign_task(pool, task_id, "test-worker").await.expect("assign task");
}

fn open_issue() -> IssueView {
    IssueView { number: 1, state: "OPEN".to_string(), labels: vec![], title: "Widgets are broken".to_string() }
}

fn clean_pr(number: i64) -> PrView {
    PrView {
        url: format!("https://github.com/{REPO}/pull/{number}"),
        number,
        head_sha: "deadbeef".to_string(),
        base_branch: "main".to_string(),
        head_branch: format!("ralph/issue-{number}"),
        draft: false,
        merge_state_status: "CLEAN".to_string(),
        labels: vec![],
    }
}

struct Harness {
    pool: sqlx::PgPool,
    db_name: String,
    config: RalphConfig,
    github: FakeGitHubPort,
    session: FakeSessionPort,
    throttle: FakeThrottlePort,
    notify: FakeNotifyPort,
    state_store: FakeStateStore,
}

impl Harness {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        let mut config = RalphConfig::defaults("unused", "aa".repeat(32));
        config.allowlist.push(REPO.to_string());
        Self {
            pool,
            db_name,
            config,
            github: FakeGitHubPort::new(),
            session: FakeSessionPort::succeeding(None),
            throttle: FakeThrottlePort::new(),
            notify: FakeNotifyPort::new(),
            state_store: FakeStateStore::new(),
        }
    }

    fn worker(&self) -> Worker<'_> {
        Worker {
            pool: &self.pool,
            config: &self.config,
            github: &self.github,
            session: &self.session,
            throttle: &self.throttle,
            notify: &self.notify,
            state_store: &self.state_store,
            worker_id: "test-worker".to_string(),
        }
    }

    async fn close(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

#[tokio::test]
async fn process_happy_path_merges_the_pr() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 1).await;
    assign(&h.pool, task.id).await;

    h.github.set_issue(REPO, 1, open_issue());
    h.session.set_result(ralph_core::ports::SessionResult {
        success: true,
        output: "opened a PR".to_string(),
        session_id: Some("session-1".to_string()),
        pr_url: Some(format!("https://github.com/{REPO}/pull/9")),
        error_code: None,
        watchdog_timeout: None,
        stall_timeout: None,
        guardrail_timeout: None,
        loop_trip: None,
        events: vec![],
        metrics: Default::default(),
    });
    h.github.set_pr_view(REPO, clean_pr(9));

    let outcome = h.worker().process(task.id).await.expect("process should not error");
    assert_eq!(outcome, WorkerOutcome::Success { pr_url: Some(format!("https://github.com/{REPO}/pull/9")) });

    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Done);
    assert!(reloaded.completed_at.is_some());
    assert_eq!(*h.github.merge_calls.lock().unwrap(), vec![(REPO.to_string(), 9)]);
    assert_eq!(h.notify.completions.lock().unwrap().len(), 1);

    h.close().await;
}

#[tokio::test]
async fn process_blocks_when_repo_not_allowlisted() {
    let h = Harness::new().await;
    // Deliberately skip pushing REPO onto the allowlist for this task.
    let other_repo = "acme/not-allowed";
    let task = tasks::insert_task_idempotent(
        &h.pool,
        tasks::NewTask { repo: other_repo, issue_number: 1, task_key: "default", task_display_name: "x", repo_slot: 0 },
    )
    .await
    .unwrap();
    assign(&h.pool, task.id).await;

    let outcome = h.worker().process(task.id).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Blocked { source: BlockedSource::Allowlist, reason: "repo not in allowlist".to_string() });

    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Blocked);
    assert_eq!(reloaded.blocked_source, Some(BlockedSource::Allowlist));

    h.close().await;
}

#[tokio::test]
async fn process_closes_out_when_issue_already_closed() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 2).await;
    assign(&h.pool, task.id).await;
    h.github.set_issue(REPO, 2, IssueView { number: 2, state: "CLOSED".to_string(), labels: vec![], title: "stale".to_string() });

    let outcome = h.worker().process(task.id).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Success { pr_url: None });

    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Done);
    // No session was ever invoked for a task that turned out to be done already.
    assert!(h.session.run_agent_calls.lock().unwrap().is_empty());

    h.close().await;
}

#[tokio::test]
async fn process_throttles_while_required_checks_are_pending() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 3).await;
    assign(&h.pool, task.id).await;

    h.github.set_issue(REPO, 3, open_issue());
    h.session.set_result(ralph_core::ports::SessionResult {
        success: true,
        output: "opened a PR".to_string(),
        session_id: Some("session-3".to_string()),
        pr_url: Some(format!("https://github.com/{REPO}/pull/11")),
        error_code: None,
        watchdog_timeout: None,
        stall_timeout: None,
        guardrail_timeout: None,
        loop_trip: None,
        events: vec![],
        metrics: Default::default(),
    });
    let mut pending_pr = clean_pr(11);
    pending_pr.merge_state_status = "PENDING".to_string();
    h.github.set_pr_view(REPO, pending_pr);
    h.github.set_branch_protection(REPO, "main", vec!["build".to_string()]);
    h.github.set_check_runs(REPO, "deadbeef", vec![CheckRun { name: "build".to_string(), conclusion: CheckConclusion::Pending, logs_url: None }]);

    let outcome = h.worker().process(task.id).await.unwrap();
    assert_eq!(outcome, WorkerOutcome::Throttled);

    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Throttled);
    assert!(reloaded.resume_at.is_some());

    h.close().await;
}

#[tokio::test]
async fn process_escalates_when_ci_fails_out_of_retries() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 4).await;
    assign(&h.pool, task.id).await;

    h.github.set_issue(REPO, 4, open_issue());
    h.session.set_result(ralph_core::ports::SessionResult {
        success: true,
        output: "opened a PR".to_string(),
        session_id: Some("session-4".to_string()),
        pr_url: Some(format!("https://github.com/{REPO}/pull/12")),
        error_code: None,
        watchdog_timeout: None,
        stall_timeout: None,
        guardrail_timeout: None,
        loop_trip: None,
        events: vec![],
        metrics: Default::default(),
    });
    let mut failing_pr = clean_pr(12);
    failing_pr.merge_state_status = "BLOCKED".to_string();
    h.github.set_pr_view(REPO, failing_pr);
    h.github.set_branch_protection(REPO, "main", vec!["build".to_string()]);
    h.github.set_check_runs(REPO, "deadbeef", vec![CheckRun { name: "build".to_string(), conclusion: CheckConclusion::Failure, logs_url: None }]);

    let mut config = h.config.clone();
    config.ci_triage_max_attempts = 0;
    let worker = Worker {
        pool: &h.pool,
        config: &config,
        github: &h.github,
        session: &h.session,
        throttle: &h.throttle,
        notify: &h.notify,
        state_store: &h.state_store,
        worker_id: "test-worker".to_string(),
    };

    let outcome = worker.process(task.id).await.unwrap();
    assert!(matches!(outcome, WorkerOutcome::Escalated { .. }));

    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Escalated);
    assert_eq!(h.notify.escalations.lock().unwrap().len(), 1);

    h.close().await;
}

#[tokio::test]
async fn resume_with_no_session_id_fails_without_touching_other_tasks() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 5).await;
    assign(&h.pool, task.id).await;
    dispatch::start_task(&h.pool, task.id).await.unwrap();

    let outcome = h.worker().resume(task.id, "keep going").await.unwrap();
    assert!(matches!(outcome, WorkerOutcome::Failed { .. }));

    h.close().await;
}

#[tokio::test]
async fn state_machine_enforces_the_transition_graph() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 6).await;

    // queued -> starting -> in_progress is legal...
    dispatch::assign_task(&h.pool, task.id, "w1").await.unwrap();
    dispatch::start_task(&h.pool, task.id).await.unwrap();

    // ...but done is only reachable from in_progress, and a stale `from`
    // fails the optimistic-lock compare-and-set.
    let err = TaskStateMachine::transition(&h.pool, task.id, TaskStatus::Starting, TaskStatus::InProgress).await.unwrap_err();
    assert!(err.to_string().contains("optimistic lock failed"));

    dispatch::complete_task(&h.pool, task.id).await.unwrap();
    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Done);

    h.close().await;
}

#[tokio::test]
async fn operator_retry_only_resets_escalated_tasks() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 7).await;

    // Still queued: retry must refuse.
    assert!(dispatch::operator_retry(&h.pool, task.id).await.is_err());

    dispatch::assign_task(&h.pool, task.id, "w1").await.unwrap();
    dispatch::start_task(&h.pool, task.id).await.unwrap();
    dispatch::escalate_task(&h.pool, task.id, TaskStatus::InProgress).await.unwrap();

    dispatch::operator_retry(&h.pool, task.id).await.unwrap();
    let reloaded = tasks::get_task(&h.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Queued);
    assert!(reloaded.blocked_source.is_none());

    h.close().await;
}

#[tokio::test]
async fn status_counts_reflect_every_task_in_the_repo() {
    let h = Harness::new().await;
    let a = enqueue(&h.pool, 8).await;
    let b = enqueue(&h.pool, 9).await;
    dispatch::assign_task(&h.pool, a.id, "w1").await.unwrap();

    let counts = queries::status_counts_for_repo(&h.pool, REPO).await.unwrap();
    assert_eq!(counts.get(&TaskStatus::Starting).copied().unwrap_or(0), 1);
    assert_eq!(counts.get(&TaskStatus::Queued).copied().unwrap_or(0), 1);
    assert_eq!(counts.values().sum::<usize>(), 2);
    let _ = b;

    h.close().await;
}

#[tokio::test]
async fn get_due_for_resume_only_returns_throttled_tasks_past_their_resume_time() {
    let h = Harness::new().await;
    let task = enqueue(&h.pool, 10).await;
    dispatch::assign_task(&h.pool, task.id, "w1").await.unwrap();
    dispatch::start_task(&h.pool, task.id).await.unwrap();
    dispatch::throttle_task(&h.pool, task.id).await.unwrap();
    tasks::set_throttled(&h.pool, task.id, Utc::now() - chrono::Duration::seconds(5)).await.unwrap();

    let due = queries::get_due_for_resume(&h.pool, Utc::now()).await.unwrap();
    assert!(due.iter().any(|t| t.id == task.id));

    let none_yet = queries::get_due_for_resume(&h.pool, Utc::now() - chrono::Duration::minutes(10)).await.unwrap();
    assert!(!none_yet.iter().any(|t| t.id == task.id));

    h.close().await;
}

#[tokio::test]
async fn enqueue_is_idempotent_on_repo_issue_task_key() {
    let h = Harness::new().await;
    let first = enqueue(&h.pool, 11).await;
    let second = enqueue(&h.pool, 11).await;
    assert_eq!(first.id, second.id);

    h.close().await;
}
