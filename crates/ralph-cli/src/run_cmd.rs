//! `ralph run`: drive a single task through one Worker invocation using the
//! demonstration Port adapters. A real deployment replaces
//! `crate::adapters`'s stand-ins with production GitHub/session/queue
//! implementations and calls the same `Worker` entry points from its own
//! scheduler loop (spec §5, out of scope for this repository).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use ralph_core::config::RalphConfig;
use ralph_core::worker::{Worker, WorkerOutcome};

use crate::adapters::{StubGitHubPort, StubNotifyPort, StubSessionPort, StubStateStore, StubThrottlePort};

pub async fn run_worker_once(pool: &PgPool, config: &RalphConfig, task_id: &str, resume_message: Option<&str>) -> Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;

    let github = StubGitHubPort;
    let session = StubSessionPort;
    let throttle = StubThrottlePort;
    let notify = StubNotifyPort;
    let state_store = StubStateStore::default();

    let worker = Worker {
        pool,
        config,
        github: &github,
        session: &session,
        throttle: &throttle,
        notify: &notify,
        state_store: &state_store,
        worker_id: format!("ralph-cli-{}", Uuid::new_v4()),
    };

    let outcome = match resume_message {
        Some(msg) => worker.resume(id, msg).await?,
        None => worker.process(id).await?,
    };

    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &WorkerOutcome) {
    match outcome {
        WorkerOutcome::Success { pr_url } => {
            println!("done: {}", pr_url.as_deref().unwrap_or("(no PR url)"));
        }
        WorkerOutcome::Throttled => println!("throttled: will resume later"),
        WorkerOutcome::Blocked { source, reason } => println!("blocked ({source:?}): {reason}"),
        WorkerOutcome::Escalated { reason } => println!("escalated: {reason}"),
        WorkerOutcome::Failed { reason } => println!("failed: {reason}"),
    }
}
