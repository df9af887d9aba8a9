//! Fresh-processing flow (spec §4.1 "Process flow (fresh)"): queued-PR
//! reconciliation, planner invocation, routing, the build session, PR
//! extraction, and entry into the merge gate.

use ralph_db::models::{AttemptKind, BlockedSource, Checkpoint, EscalationCause, RunOutcome, Task};

use crate::checkpoint::CheckpointLedger;
use crate::escalation::{self, EscalationContext};
use crate::ledger;
use crate::ports::SessionResult;
use crate::pr;
use crate::supervisor::{self, SupervisorVerdict};
use crate::throttle;

use super::{preflight::{self, PreflightOutcome}, Worker, WorkerOutcome};

/// Run the fresh `process` entry point for `task_id`.
pub async fn run(worker: &Worker<'_>, task_id: uuid::Uuid) -> anyhow::Result<WorkerOutcome> {
    let task = worker.load_task(task_id).await?;

    if let PreflightOutcome::Blocked { source, reason } = preflight::check_allowlist(worker.config, &task.repo) {
        worker.mark_blocked(task_id, source, &reason).await?;
        return Ok(WorkerOutcome::Blocked { source, reason });
    }

    let issue = match worker.github.issue_view(&task.repo, task.issue_number).await {
        Ok(issue) => issue,
        Err(err) => {
            return Ok(WorkerOutcome::Failed { reason: format!("failed to load issue: {err}") });
        }
    };

    if let PreflightOutcome::DoneAlready { reason } = preflight::check_issue_open(&issue) {
        tracing::info!(%task_id, %reason, "task done without a build, issue already closed");
        ralph_db::queries::tasks::mark_done(worker.pool, task_id).await?;
        return Ok(WorkerOutcome::Success { pr_url: None });
    }

    let repo_dirty = preflight::repo_root_is_dirty(worker.config, &task.repo).await;
    if let PreflightOutcome::Blocked { source, reason } = preflight::check_dirty_repo(&task, repo_dirty) {
        worker.mark_blocked(task_id, source, &reason).await?;
        return Ok(WorkerOutcome::Blocked { source, reason });
    }

    preflight::ensure_baseline_labels(
        worker.github,
        &task.repo,
        task.issue_number,
        &issue,
        &worker.config.baseline_labels,
    )
    .await?;

    worker.mark_in_progress(task_id).await?;

    let working_dir = preflight::resolve_worktree(worker.config, &task).await;
    ralph_db::queries::tasks::set_worktree(worker.pool, task_id, &working_dir, task.repo_slot).await?;

    let run_id = ledger::open(
        worker.pool,
        task_id,
        &task.repo,
        task.issue_number,
        AttemptKind::Process,
        task.checkpoint_seq,
    )
    .await?;

    let ledger_api = CheckpointLedger::new(worker.pool);
    let profile = throttle::select_profile(&worker.config.default_agent_profile, task.agent_profile.as_deref()).to_string();

    // Step 1: queued-PR reconciliation. An already-queued PR in the
    // merge-conflict or failing-CI state short-circuits straight into
    // the merge gate, which already carries the CI-triage (§4.8.2) and
    // merge-conflict-lane (§4.9) routing.
    if let Some(outcome) = reconcile_existing_pr(worker, task_id, run_id, task.checkpoint_seq, &task).await? {
        return Ok(outcome);
    }

    if let Some(outcome) = check_throttle_gate(worker, task_id, &profile).await? {
        return Ok(outcome);
    }

    // Planner invocation. The planner itself is just another agent
    // session: its prompt is the issue context, and its output is parsed
    // for a routing decision below.
    let planner_prompt = format!(
        "Plan issue {}#{}: {}",
        task.repo, task.issue_number, issue.title
    );

    let plan_result = worker
        .session
        .run_agent(&task, &profile, &planner_prompt, &working_dir)
        .await?;

    if let Some(outcome) = check_throttle_gate(worker, task_id, &profile).await? {
        return Ok(outcome);
    }

    if let Some(outcome) = handle_trip_if_any(worker, task_id, run_id, task.checkpoint_seq, &plan_result).await? {
        return Ok(outcome);
    }

    if !plan_result.success {
        escalation::escalate(
            worker.pool,
            worker.github,
            worker.notify,
            &EscalationContext {
                task_id,
                repo: task.repo.clone(),
                issue_number: task.issue_number,
                cause: EscalationCause::RuntimeError,
                reason: "planner session did not succeed".to_string(),
                run_id: Some(run_id),
            },
        )
        .await?;
        return Ok(WorkerOutcome::Escalated { reason: "planner session failed".to_string() });
    }

    ledger_api.record(task_id, task.checkpoint_seq, Checkpoint::Planned).await?;
    ledger_api.wait_while_paused(task_id, Checkpoint::Planned).await?;

    // Steps 3-4: parse the routing decision. Escalate (with the specific
    // cause the planner signalled) rather than always proceeding to
    // build.
    match parse_routing_decision(&plan_result.output) {
        RoutingDecision::Escalate { cause, reason } => {
            escalation::escalate(
                worker.pool,
                worker.github,
                worker.notify,
                &EscalationContext {
                    task_id,
                    repo: task.repo.clone(),
                    issue_number: task.issue_number,
                    cause,
                    reason: reason.clone(),
                    run_id: Some(run_id),
                },
            )
            .await?;
            ledger::seal(
                worker.pool,
                task_id,
                run_id,
                task.checkpoint_seq,
                RunOutcome::Escalated,
                None,
                None,
                Some(&reason),
            )
            .await?;
            return Ok(WorkerOutcome::Escalated { reason });
        }
        RoutingDecision::Build => {}
    }

    ledger_api.record(task_id, task.checkpoint_seq + 1, Checkpoint::Routed).await?;
    ledger_api.wait_while_paused(task_id, Checkpoint::Routed).await?;

    let session_id = plan_result.session_id.clone().unwrap_or_default();
    let build_prompt = "proceed with implementation targeting the base branch".to_string();
    let build_result = worker.session.continue_session(&session_id, &build_prompt, &working_dir).await?;

    if let Some(outcome) = check_throttle_gate(worker, task_id, &profile).await? {
        return Ok(outcome);
    }

    if let Some(outcome) = handle_trip_if_any(worker, task_id, run_id, task.checkpoint_seq + 1, &build_result).await? {
        return Ok(outcome);
    }

    ledger_api
        .record(task_id, task.checkpoint_seq + 2, Checkpoint::ImplementationStepComplete)
        .await?;
    ledger_api.wait_while_paused(task_id, Checkpoint::ImplementationStepComplete).await?;

    // PR extraction / recovery.
    let candidates = pr::discover_candidates(
        worker.pool,
        worker.github,
        task_id,
        &task.repo,
        task.issue_number,
        build_result.pr_url.as_deref(),
    )
    .await?;

    let Some(canonical) = pr::resolve_canonical(&candidates) else {
        let holder = worker.worker_id.clone();
        let acquired = pr::acquire_pr_create_lease(worker.pool, &task.repo, task.issue_number, &holder).await?;
        if !acquired {
            worker.mark_blocked(task_id, BlockedSource::PrCreateLeaseConflict, "another worker holds the PR-create lease").await?;
            return Ok(WorkerOutcome::Blocked {
                source: BlockedSource::PrCreateLeaseConflict,
                reason: "PR-create lease held elsewhere".to_string(),
            });
        }
        // In a production transport, this is where the GitHub Port would
        // push HEAD and call `gh pr create`. No such transport ships
        // here (spec §1's out-of-scope list), so absent a session-
        // reported PR URL this path escalates rather than fabricating
        // one.
        pr::release_pr_create_lease(worker.pool, &task.repo, task.issue_number, &holder).await?;
        escalation::escalate(
            worker.pool,
            worker.github,
            worker.notify,
            &EscalationContext {
                task_id,
                repo: task.repo.clone(),
                issue_number: task.issue_number,
                cause: EscalationCause::RuntimeError,
                reason: "no PR candidate found after build session".to_string(),
                run_id: Some(run_id),
            },
        )
        .await?;
        return Ok(WorkerOutcome::Escalated { reason: "no PR produced".to_string() });
    };

    ledger_api.record(task_id, task.checkpoint_seq + 3, Checkpoint::PrReady).await?;
    ledger_api.wait_while_paused(task_id, Checkpoint::PrReady).await?;

    super::merge::enter(worker, task_id, run_id, task.checkpoint_seq + 3, canonical).await
}

/// Step 1: if a PR candidate is already queued for this task and its
/// live view already shows a merge conflict or failing CI, short-circuit
/// straight into the merge gate instead of invoking the planner fresh.
async fn reconcile_existing_pr(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    task: &Task,
) -> anyhow::Result<Option<WorkerOutcome>> {
    let candidates = ralph_db::queries::pr_candidates::list_candidates(worker.pool, task_id).await?;
    let Some(canonical) = pr::resolve_canonical(&candidates) else { return Ok(None) };

    let Some(view) = pr::resolve_canonical_view(worker.github, &task.repo, &candidates).await? else {
        return Ok(None);
    };

    let status = view.merge_state_status.to_ascii_uppercase();
    if status == "DIRTY" || status == "BLOCKED" {
        tracing::info!(%task_id, status = %view.merge_state_status, "existing queued PR already in conflict/CI-failing state, reconciling directly");
        let outcome = super::merge::enter(worker, task_id, run_id, checkpoint_seq, canonical).await?;
        return Ok(Some(outcome));
    }

    Ok(None)
}

/// Consult the Throttle Port and, on a hard decision, transition the task
/// to `throttled` and return the short-circuit outcome (spec §4.3; §4.1
/// step 6). Called before and after every session call.
pub(super) async fn check_throttle_gate(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    profile: &str,
) -> anyhow::Result<Option<WorkerOutcome>> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let decision = worker.throttle.get_throttle_decision(now_ms, profile).await?;
    match throttle::apply_throttle_decision(worker.pool, task_id, &decision).await? {
        throttle::GateOutcome::Proceed => Ok(None),
        throttle::GateOutcome::Rest { .. } => Ok(Some(WorkerOutcome::Throttled)),
    }
}

/// Routing decision parsed from the planner's own output (spec §4.1 steps
/// 3-4).
#[derive(Debug, Clone, PartialEq, Eq)]
enum RoutingDecision {
    Build,
    Escalate { cause: EscalationCause, reason: String },
}

/// Grammar: a `ROUTE:` line anywhere in the planner's output, optionally
/// followed by a `REASON:` line. Anything without a `ROUTE:` line
/// defaults to `Build`, matching a planner that just starts implementing
/// without an explicit routing verdict.
fn parse_routing_decision(output: &str) -> RoutingDecision {
    let Some(route_line) = output.lines().find(|l| l.trim_start().to_ascii_lowercase().starts_with("route:")) else {
        return RoutingDecision::Build;
    };

    let value = route_line.splitn(2, ':').nth(1).unwrap_or("").trim().to_ascii_lowercase();
    let reason = |default: &str| extract_routing_reason(output).unwrap_or_else(|| default.to_string());

    match value.as_str() {
        "build" => RoutingDecision::Build,
        "product-gap" | "product_gap" => RoutingDecision::Escalate {
            cause: EscalationCause::ProductGap,
            reason: reason("planner routed to escalate: product gap"),
        },
        "ambiguous" | "ambiguous-requirements" | "ambiguous_requirements" => RoutingDecision::Escalate {
            cause: EscalationCause::AmbiguousRequirements,
            reason: reason("planner routed to escalate: ambiguous requirements"),
        },
        _ => RoutingDecision::Escalate {
            cause: EscalationCause::PlannerEscalation,
            reason: reason("planner requested escalation"),
        },
    }
}

fn extract_routing_reason(output: &str) -> Option<String> {
    output
        .lines()
        .find(|l| l.trim_start().to_ascii_lowercase().starts_with("reason:"))
        .map(|l| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Inspect a session result for a supervisor trip, dispatch the
/// corresponding supervisor, and if it escalated, seal the run and
/// return the terminal outcome. Returns `None` when there was no trip
/// (or the trip only requeued, which this flow treats the same as a
/// non-fatal pause for the caller's simplicity).
pub(super) async fn handle_trip_if_any(
    worker: &Worker<'_>,
    task_id: uuid::Uuid,
    run_id: uuid::Uuid,
    checkpoint_seq: i64,
    result: &SessionResult,
) -> anyhow::Result<Option<WorkerOutcome>> {
    let verdict = if let Some(trip) = &result.watchdog_timeout {
        Some(supervisor::watchdog::handle_trip(worker.pool, task_id, trip).await?)
    } else if let Some(trip) = &result.stall_timeout {
        Some(supervisor::stall::handle_trip(worker.pool, task_id, trip).await?)
    } else if let Some(trip) = &result.guardrail_timeout {
        Some(supervisor::guardrail::handle_trip(worker.pool, task_id, trip).await?)
    } else if let Some(trip) = &result.loop_trip {
        Some(supervisor::loop_detector::handle_trip(trip))
    } else {
        None
    };

    let Some(verdict) = verdict else { return Ok(None) };

    match verdict {
        SupervisorVerdict::Requeue { source, reason } => {
            worker.mark_blocked(task_id, source, &reason).await?;
            Ok(Some(WorkerOutcome::Blocked { source, reason }))
        }
        SupervisorVerdict::Escalate { cause, reason } => {
            let task = worker.load_task(task_id).await?;
            let cause = supervisor::escalation_cause(&cause);
            escalation::escalate(
                worker.pool,
                worker.github,
                worker.notify,
                &EscalationContext {
                    task_id,
                    repo: task.repo,
                    issue_number: task.issue_number,
                    cause,
                    reason: reason.clone(),
                    run_id: Some(run_id),
                },
            )
            .await?;
            ledger::seal(
                worker.pool,
                task_id,
                run_id,
                checkpoint_seq,
                RunOutcome::Escalated,
                None,
                None,
                Some(&reason),
            )
            .await?;
            Ok(Some(WorkerOutcome::Escalated { reason }))
        }
    }
}
