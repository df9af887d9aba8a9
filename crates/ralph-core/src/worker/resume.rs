//! Resume flow (spec §4.1 "Resume flow"): identical to `process` from
//! step 5 onward, using the existing session ID and a restart-safe
//! resume message. If resuming the session fails for a non-supervisor
//! reason, the task resets to `queued` with cleared session so it is
//! replanned fresh rather than retried in place. Preflight (allowlist,
//! closed-issue skip, worktree health, throttle) is shared with
//! `process`, per spec §4.1's "Resume flow: identical to process" for the
//! preflight phase.

use ralph_db::models::{AttemptKind, BlockedSource, Checkpoint, RunOutcome};

use crate::checkpoint::CheckpointLedger;
use crate::ledger;
use crate::pr;
use crate::throttle;

use super::{preflight::{self, PreflightOutcome}, Worker, WorkerOutcome};

pub async fn run(worker: &Worker<'_>, task_id: uuid::Uuid, resume_message: &str) -> anyhow::Result<WorkerOutcome> {
    let task = worker.load_task(task_id).await?;

    if let PreflightOutcome::Blocked { source, reason } = preflight::check_allowlist(worker.config, &task.repo) {
        worker.mark_blocked(task_id, source, &reason).await?;
        return Ok(WorkerOutcome::Blocked { source, reason });
    }

    let issue = match worker.github.issue_view(&task.repo, task.issue_number).await {
        Ok(issue) => issue,
        Err(err) => return Ok(WorkerOutcome::Failed { reason: format!("failed to load issue: {err}") }),
    };

    if let PreflightOutcome::DoneAlready { reason } = preflight::check_issue_open(&issue) {
        tracing::info!(%task_id, %reason, "resumed task done without further work, issue already closed");
        ralph_db::queries::tasks::mark_done(worker.pool, task_id).await?;
        return Ok(WorkerOutcome::Success { pr_url: None });
    }

    let Some(session_id) = task.session_id.clone() else {
        tracing::warn!(%task_id, "resume called with no session_id recorded, resetting to queued");
        ralph_db::queries::tasks::reset_orphaned_tasks(worker.pool).await?;
        return Ok(WorkerOutcome::Failed { reason: "no session to resume, reset to queued".to_string() });
    };

    let worktree_healthy = match &task.worktree_path {
        Some(path) => {
            let p = std::path::PathBuf::from(path);
            tokio::task::spawn_blocking(move || p.exists() && p.join(".git").exists())
                .await
                .unwrap_or(false)
        }
        None => false,
    };

    if preflight::reset_if_worktree_unhealthy(worker.pool, &task, worktree_healthy).await? {
        return Ok(WorkerOutcome::Failed { reason: "recorded worktree missing or unhealthy, reset to queued".to_string() });
    }

    let working_dir = task
        .worktree_path
        .clone()
        .unwrap_or_else(|| format!("/tmp/ralph/{}", task.task_key));

    let profile = throttle::select_profile(&worker.config.default_agent_profile, task.agent_profile.as_deref()).to_string();

    if let Some(outcome) = super::process::check_throttle_gate(worker, task_id, &profile).await? {
        return Ok(outcome);
    }

    let run_id = ledger::open(
        worker.pool,
        task_id,
        &task.repo,
        task.issue_number,
        AttemptKind::Resume,
        task.checkpoint_seq,
    )
    .await?;

    let ledger_api = CheckpointLedger::new(worker.pool);

    let result = match worker.session.continue_session(&session_id, resume_message, &working_dir).await {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(%task_id, %err, "resume of session failed for a non-supervisor reason, resetting to queued");
            ralph_db::queries::tasks::reset_orphaned_tasks(worker.pool).await?;
            ledger::seal(
                worker.pool,
                task_id,
                run_id,
                task.checkpoint_seq,
                RunOutcome::Failed,
                None,
                None,
                Some("resume-session-error"),
            )
            .await?;
            return Ok(WorkerOutcome::Failed { reason: format!("resume failed: {err}") });
        }
    };

    if let Some(outcome) = super::process::check_throttle_gate(worker, task_id, &profile).await? {
        return Ok(outcome);
    }

    if let Some(outcome) =
        super::process::handle_trip_if_any(worker, task_id, run_id, task.checkpoint_seq, &result).await?
    {
        return Ok(outcome);
    }

    ledger_api
        .record(task_id, task.checkpoint_seq, Checkpoint::ImplementationStepComplete)
        .await?;
    ledger_api.wait_while_paused(task_id, Checkpoint::ImplementationStepComplete).await?;

    let candidates = pr::discover_candidates(
        worker.pool,
        worker.github,
        task_id,
        &task.repo,
        task.issue_number,
        result.pr_url.as_deref(),
    )
    .await?;

    let Some(canonical) = pr::resolve_canonical(&candidates) else {
        return Ok(WorkerOutcome::Blocked {
            source: BlockedSource::RuntimeError,
            reason: "resumed session produced no PR candidate".to_string(),
        });
    };

    ledger_api.record(task_id, task.checkpoint_seq + 1, Checkpoint::PrReady).await?;
    ledger_api.wait_while_paused(task_id, Checkpoint::PrReady).await?;

    super::merge::enter(worker, task_id, run_id, task.checkpoint_seq + 1, canonical).await
}
