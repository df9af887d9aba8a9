//! Merge Gate entry (spec §4.1 step 9, §4.8, §4.9): one gate iteration per
//! Worker invocation. A task that is still waiting on checks or a CI fix
//! comes back through `throttled` with a resume delay rather than
//! blocking this call; only a terminal merge, refusal, or escalation ends
//! the flow.

use ralph_db::models::{BlockedSource, Checkpoint, CompletionKind, EscalationCause, PrCandidate, RunOutcome};
use ralph_db::queries::tasks;

use crate::checkpoint::CheckpointLedger;
use crate::comment_state::{self, MarkerPayload, CI_DEBUG_MARKER, MERGE_CONFLICT_MARKER};
use crate::escalation::{self, EscalationContext};
use crate::ledger;
use crate::merge_conflict;
use crate::merge_gate::{self, merge as merge_mod, poll, triage};
use crate::pr;

use super::{Worker, WorkerOutcome};

/// Drive one merge-gate iteration for the PR behind `canonical`, after a
/// build session has produced it. Returns the Worker's terminal outcome
/// for this invocation.
pub async fn enter(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    canonical: &PrCandidate,
) -> anyhow::Result<WorkerOutcome> {
    let task = worker.load_task(task_id).await?;

    let pr_view = match pr::resolve_canonical_view(worker.github, &task.repo, std::slice::from_ref(canonical)).await? {
        Some(view) => view,
        None => {
            worker.mark_blocked(task_id, BlockedSource::MergeTarget, "canonical PR no longer resolves on GitHub").await?;
            return Ok(WorkerOutcome::Blocked {
                source: BlockedSource::MergeTarget,
                reason: "canonical PR no longer resolves".to_string(),
            });
        }
    };

    let required = if !worker.config.required_checks_override.is_empty() {
        worker.config.required_checks_override.clone()
    } else {
        match worker.github.get_branch_protection(&task.repo, &pr_view.base_branch).await {
            Ok(protection) => protection.required_status_checks,
            Err(err) => {
                tracing::warn!(task_id = %task_id, %err, "failed to read branch protection, polling with no required checks");
                vec![]
            }
        }
    };

    let checks = worker
        .github
        .get_commit_check_runs(&task.repo, &pr_view.head_sha)
        .await
        .unwrap_or_default();

    let summary = poll::summarize(&required, &checks);
    let signature = poll::rollup_signature(&required, &checks);

    match summary {
        poll::RollupSummary::Pending => {
            keep_polling(worker, task_id, &signature).await?;
            Ok(WorkerOutcome::Throttled)
        }
        poll::RollupSummary::Failure => run_triage(worker, task_id, run_id, checkpoint_seq, &task, &pr_view, &checks, &signature).await,
        poll::RollupSummary::Success => {
            finalize_merge(worker, task_id, run_id, checkpoint_seq, &task, &pr_view).await
        }
    }
}

/// Record the pending rollup signature on the CI-debug marker comment (so
/// a repeated-signature check survives process restarts) and throttle the
/// task for the next poll interval.
async fn keep_polling(worker: &Worker<'_>, task_id: uuid::Uuid, signature: &str) -> anyhow::Result<()> {
    let existing = load_marker(worker, task_id, CI_DEBUG_MARKER).await?;
    let attempts = existing.as_ref().map(|m| m.attempts).unwrap_or(0);
    let unchanged = existing.as_ref().and_then(|m| m.last_signature.as_deref()) == Some(signature);
    let interval = poll::next_interval(
        std::time::Duration::from_secs(poll::BASE_POLL_INTERVAL.as_secs() * 2u64.pow(attempts.max(0) as u32)),
        unchanged,
    );
    let resume_at = chrono::Utc::now() + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(30));
    tasks::set_throttled(worker.pool, task_id, resume_at).await?;
    Ok(())
}

async fn run_triage(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    task: &ralph_db::models::Task,
    pr_view: &crate::ports::PrView,
    checks: &[crate::ports::CheckRun],
    signature: &str,
) -> anyhow::Result<WorkerOutcome> {
    let marker = load_marker(worker, task_id, CI_DEBUG_MARKER).await?;
    let attempt = marker.as_ref().map(|m| m.attempts as u32).unwrap_or(0);
    let prior_signature = marker.as_ref().and_then(|m| m.last_signature.clone());

    let failing_checks: Vec<triage::FailingCheck> = checks
        .iter()
        .filter(|c| matches!(c.conclusion, crate::ports::CheckConclusion::Failure))
        .map(|c| triage::FailingCheck { name: c.name.clone(), raw_state: format!("{:?}", c.conclusion), log_excerpt: None })
        .collect();

    let input = triage::TriageInput {
        timed_out: false,
        failing_checks,
        detected_commands: vec![],
        attempt,
        max_attempts: worker.config.ci_triage_max_attempts,
        has_session: task.session_id.is_some(),
        signature: signature.to_string(),
        prior_signature,
    };

    let verdict = triage::decide(&input);
    save_marker(worker, task_id, CI_DEBUG_MARKER, attempt + 1, signature, &verdict.classification).await?;

    match verdict.action {
        triage::TriageAction::Escalate => {
            escalation::escalate(
                worker.pool,
                worker.github,
                worker.notify,
                &EscalationContext {
                    task_id,
                    repo: task.repo.clone(),
                    issue_number: task.issue_number,
                    cause: EscalationCause::CiTriageExhausted,
                    reason: verdict.reason.clone(),
                    run_id: Some(run_id),
                },
            )
            .await?;
            ledger::seal(worker.pool, task_id, run_id, checkpoint_seq, RunOutcome::Escalated, None, None, Some(&verdict.reason)).await?;
            Ok(WorkerOutcome::Escalated { reason: verdict.reason })
        }
        triage::TriageAction::Quarantine => {
            let backoff = triage::quarantine_backoff_secs(attempt);
            merge_gate::apply_quarantine(worker.pool, task_id, backoff).await?;
            Ok(WorkerOutcome::Throttled)
        }
        triage::TriageAction::Resume | triage::TriageAction::Spawn => {
            let prompt = format!(
                "CI is failing on {}. Diagnose the failing checks and push a fix to the same branch.",
                pr_view.url
            );
            let working_dir = task.worktree_path.clone().unwrap_or_else(|| format!("/tmp/ralph/{}", task.task_key));
            let result = if let Some(session_id) = &task.session_id {
                worker.session.continue_command(session_id, &prompt, &working_dir).await?
            } else {
                worker.session.run_agent(task, &worker.config.default_agent_profile, &prompt, &working_dir).await?
            };

            if let Some(outcome) = super::process::handle_trip_if_any(worker, task_id, run_id, checkpoint_seq, &result).await? {
                return Ok(outcome);
            }
            tasks::set_throttled(worker.pool, task_id, chrono::Utc::now() + chrono::Duration::seconds(poll::BASE_POLL_INTERVAL.as_secs() as i64)).await?;
            Ok(WorkerOutcome::Throttled)
        }
    }
}

async fn finalize_merge(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    task: &ralph_db::models::Task,
    pr_view: &crate::ports::PrView,
) -> anyhow::Result<WorkerOutcome> {
    // No distinct "repo default branch" is tracked on the task record, so
    // the integration branch is taken to equal the PR's own base branch —
    // this guard only ever fires via the explicit override label in that
    // configuration.
    if let Some(reason) = merge_mod::check_base_branch_policy(pr_view, &pr_view.base_branch, &pr_view.base_branch, "ralph-force-merge") {
        worker.mark_blocked(task_id, BlockedSource::MergeTarget, &reason).await?;
        return Ok(WorkerOutcome::Blocked { source: BlockedSource::MergeTarget, reason });
    }

    let files = worker.github.pr_files(&task.repo, pr_view.number).await.unwrap_or_default();
    let issue_is_ci_flavored = pr_view.labels.iter().any(|l| l.eq_ignore_ascii_case("ci"));
    if let Some(reason) = merge_mod::check_ci_only_guard(&files, issue_is_ci_flavored) {
        worker.mark_blocked(task_id, BlockedSource::CiOnly, &reason).await?;
        return Ok(WorkerOutcome::Blocked { source: BlockedSource::CiOnly, reason });
    }

    let has_auto_update_label = pr_view.labels.iter().any(|l| l == merge_mod::AUTO_UPDATE_LABEL);
    match merge_mod::pre_merge_guard(pr_view, has_auto_update_label) {
        merge_mod::MergeDecision::Merge => complete_merge(worker, task_id, run_id, checkpoint_seq, task, pr_view).await,
        merge_mod::MergeDecision::ResumePolling => {
            tasks::set_throttled(worker.pool, task_id, chrono::Utc::now() + chrono::Duration::seconds(poll::BASE_POLL_INTERVAL.as_secs() as i64)).await?;
            Ok(WorkerOutcome::Throttled)
        }
        merge_mod::MergeDecision::AttemptAutoUpdate => {
            let claimed = merge_mod::try_claim_auto_update_rate_limit(worker.pool, &task.repo, pr_view.number, &worker.worker_id).await?;
            if !claimed {
                worker.mark_blocked(task_id, BlockedSource::AutoUpdate, "auto-update rate limit already claimed for this PR").await?;
                return Ok(WorkerOutcome::Blocked { source: BlockedSource::AutoUpdate, reason: "auto-update already attempted recently".to_string() });
            }
            worker.github.pr_update_branch(&task.repo, pr_view.number).await?;
            tasks::set_throttled(worker.pool, task_id, chrono::Utc::now() + chrono::Duration::seconds(poll::BASE_POLL_INTERVAL.as_secs() as i64)).await?;
            Ok(WorkerOutcome::Throttled)
        }
        merge_mod::MergeDecision::Refused { reason } => {
            worker.mark_blocked(task_id, BlockedSource::AutoUpdate, &reason).await?;
            Ok(WorkerOutcome::Blocked { source: BlockedSource::AutoUpdate, reason })
        }
        merge_mod::MergeDecision::RouteToMergeConflict => {
            route_to_merge_conflict(worker, task_id, run_id, checkpoint_seq, task, pr_view).await
        }
    }
}

async fn complete_merge(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    task: &ralph_db::models::Task,
    pr_view: &crate::ports::PrView,
) -> anyhow::Result<WorkerOutcome> {
    match merge_mod::merge(worker.github, &task.repo, pr_view.number).await {
        Ok(()) => {}
        Err(err) if merge_mod::is_retryable_merge_error(&err) => {
            worker.github.pr_update_branch(&task.repo, pr_view.number).await.ok();
            tasks::set_throttled(worker.pool, task_id, chrono::Utc::now() + chrono::Duration::seconds(poll::BASE_POLL_INTERVAL.as_secs() as i64)).await?;
            return Ok(WorkerOutcome::Throttled);
        }
        Err(err) => {
            return Ok(WorkerOutcome::Failed { reason: format!("merge call failed: {err}") });
        }
    }

    let ledger_api = CheckpointLedger::new(worker.pool);
    ledger_api.record(task_id, checkpoint_seq, Checkpoint::MergeStepComplete).await?;

    if merge_mod::should_delete_head_branch(pr_view, &pr_view.base_branch, &pr_view.head_sha, &pr_view.head_sha, false) {
        let reference = format!("heads/{}", pr_view.head_branch);
        worker.github.delete_ref(&task.repo, &reference).await.ok();
    }

    // Post-merge survey: a short best-effort comment noting completion.
    // No production survey-command transport ships in this repository
    // (spec's out-of-scope runtime), so this records the checkpoint and
    // notifies rather than shelling out.
    worker.notify.notify_task_complete(task, Some(&pr_view.url)).await.ok();
    ledger_api.record(task_id, checkpoint_seq + 1, Checkpoint::SurveyComplete).await?;

    tasks::mark_done(worker.pool, task_id).await?;
    super::preflight::teardown_worktree(worker.config, task).await;
    ledger::seal(
        worker.pool,
        task_id,
        run_id,
        checkpoint_seq + 1,
        RunOutcome::Success,
        Some(&pr_view.url),
        Some(CompletionKind::Verified),
        None,
    )
    .await?;

    Ok(WorkerOutcome::Success { pr_url: Some(pr_view.url.clone()) })
}

async fn route_to_merge_conflict(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    task: &ralph_db::models::Task,
    pr_view: &crate::ports::PrView,
) -> anyhow::Result<WorkerOutcome> {
    let acquired = merge_conflict::acquire_recovery_lease(worker.pool, &task.repo, pr_view.number, &worker.worker_id).await?;
    if !acquired {
        worker.mark_blocked(task_id, BlockedSource::MergeConflict, "another worker holds the merge-conflict recovery lease").await?;
        return Ok(WorkerOutcome::Blocked {
            source: BlockedSource::MergeConflict,
            reason: "merge-conflict recovery lease held elsewhere".to_string(),
        });
    }

    // No Git execution port ships in this repository, so the conflicted
    // path list cannot be enumerated here, and the PR view carries a base
    // branch name rather than a base SHA; the signature is still
    // meaningful over (base_branch, head_sha) for no-progress detection
    // across attempts.
    let state = merge_conflict::ConflictState {
        base_sha: pr_view.base_branch.clone(),
        head_sha: pr_view.head_sha.clone(),
        conflict_paths: vec![],
    };
    let signature = merge_conflict::conflict_signature(&state);

    let marker = load_marker(worker, task_id, MERGE_CONFLICT_MARKER).await?;
    let attempt = marker.as_ref().map(|m| m.attempts as u32).unwrap_or(0);
    let prior_signature = marker.as_ref().and_then(|m| m.last_signature.clone());

    let step = merge_conflict::next_step(&signature, prior_signature.as_deref(), attempt, merge_conflict::DEFAULT_MAX_ATTEMPTS);

    let outcome = match step {
        merge_conflict::RecoveryStep::NoProgress => {
            let reason = "merge-conflict recovery made no progress across attempts".to_string();
            escalation::escalate(
                worker.pool,
                worker.github,
                worker.notify,
                &EscalationContext {
                    task_id,
                    repo: task.repo.clone(),
                    issue_number: task.issue_number,
                    cause: EscalationCause::MergeConflictNoProgress,
                    reason: reason.clone(),
                    run_id: Some(run_id),
                },
            )
            .await?;
            ledger::seal(worker.pool, task_id, run_id, checkpoint_seq, RunOutcome::Escalated, None, None, Some(&reason)).await?;
            WorkerOutcome::Escalated { reason }
        }
        merge_conflict::RecoveryStep::Escalate { reason } => {
            escalation::escalate(
                worker.pool,
                worker.github,
                worker.notify,
                &EscalationContext {
                    task_id,
                    repo: task.repo.clone(),
                    issue_number: task.issue_number,
                    cause: EscalationCause::MergeConflictNoProgress,
                    reason: reason.clone(),
                    run_id: Some(run_id),
                },
            )
            .await?;
            ledger::seal(worker.pool, task_id, run_id, checkpoint_seq, RunOutcome::Escalated, None, None, Some(&reason)).await?;
            WorkerOutcome::Escalated { reason }
        }
        merge_conflict::RecoveryStep::Attempt => {
            save_marker(worker, task_id, MERGE_CONFLICT_MARKER, attempt + 1, &signature, "recovery attempt in progress").await?;
            let prompt = format!("Resolve the merge conflict on {} against its base branch.", pr_view.url);
            let working_dir = task.worktree_path.clone().unwrap_or_else(|| format!("/tmp/ralph/{}", task.task_key));
            let result = if let Some(session_id) = &task.session_id {
                worker.session.continue_command(session_id, &prompt, &working_dir).await?
            } else {
                worker.session.run_agent(task, &worker.config.default_agent_profile, &prompt, &working_dir).await?
            };
            if let Some(trip_outcome) = super::process::handle_trip_if_any(worker, task_id, run_id, checkpoint_seq, &result).await? {
                merge_conflict::release_recovery_lease(worker.pool, &task.repo, pr_view.number, &worker.worker_id).await.ok();
                return Ok(trip_outcome);
            }
            tasks::set_throttled(worker.pool, task_id, chrono::Utc::now() + chrono::Duration::seconds(poll::BASE_POLL_INTERVAL.as_secs() as i64)).await?;
            WorkerOutcome::Throttled
        }
    };

    merge_conflict::release_recovery_lease(worker.pool, &task.repo, pr_view.number, &worker.worker_id).await.ok();
    Ok(outcome)
}

async fn load_marker(worker: &Worker<'_>, task_id: uuid::Uuid, kind: &str) -> anyhow::Result<Option<MarkerPayload>> {
    let task = worker.load_task(task_id).await?;
    let comments = worker.github.list_issue_comments(&task.repo, task.issue_number).await.unwrap_or_default();
    Ok(comments.iter().rev().find_map(|c| comment_state::parse(kind, &c.body)))
}

async fn save_marker(worker: &Worker<'_>, task_id: uuid::Uuid, kind: &str, attempts: i32, signature: &str, summary: &str) -> anyhow::Result<()> {
    let task = worker.load_task(task_id).await?;
    let payload = MarkerPayload { attempts, last_signature: Some(signature.to_string()), history: vec![] };
    let body = comment_state::render(kind, &payload, summary);
    if let Err(err) = worker.github.create_comment(&task.repo, task.issue_number, &body).await {
        tracing::warn!(task_id = %task_id, %err, "failed to persist comment-marker state");
    }
    Ok(())
}
