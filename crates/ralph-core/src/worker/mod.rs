//! Worker State Machine (spec §4.1): the top-level flow tying every
//! subsystem together. Entry points `process(task)` (fresh) and
//! `resume(task, resume_message)` (existing session) both funnel through
//! preflight, a build loop driven by the Session Port, PR resolution, the
//! merge gate, and the escalation/ledger paths.

pub mod merge;
pub mod preflight;
pub mod process;
pub mod resume;

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::{BlockedSource, RunOutcome};
use ralph_db::queries::tasks;

use crate::config::RalphConfig;
use crate::ports::{GitHubPort, NotifyPort, SessionPort, StateStore, ThrottlePort};

/// The terminal shape every Worker invocation settles into. Mirrors
/// [`RunOutcome`] but as the Worker's own return value rather than the
/// run-ledger's persisted field, so callers don't need a `PgPool` in
/// hand just to read back what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success { pr_url: Option<String> },
    Throttled,
    Blocked { source: BlockedSource, reason: String },
    Escalated { reason: String },
    Failed { reason: String },
}

impl WorkerOutcome {
    pub fn run_outcome(&self) -> RunOutcome {
        match self {
            Self::Success { .. } => RunOutcome::Success,
            Self::Throttled => RunOutcome::Throttled,
            Self::Escalated { .. } => RunOutcome::Escalated,
            Self::Blocked { .. } | Self::Failed { .. } => RunOutcome::Failed,
        }
    }
}

/// A Worker instance: one task at a time, holding handles to every
/// external collaborator it needs (spec §6's ports) plus the operational
/// config.
pub struct Worker<'a> {
    pub pool: &'a PgPool,
    pub config: &'a RalphConfig,
    pub github: &'a dyn GitHubPort,
    pub session: &'a dyn SessionPort,
    pub throttle: &'a dyn ThrottlePort,
    pub notify: &'a dyn NotifyPort,
    pub state_store: &'a dyn StateStore,
    pub worker_id: String,
}

impl<'a> Worker<'a> {
    /// Fresh processing of a task: `process(task)`.
    pub async fn process(&self, task_id: Uuid) -> anyhow::Result<WorkerOutcome> {
        process::run(self, task_id).await
    }

    /// Resume an existing session for a task: `resume(task, resume_message)`.
    pub async fn resume(&self, task_id: Uuid, resume_message: &str) -> anyhow::Result<WorkerOutcome> {
        resume::run(self, task_id, resume_message).await
    }

    /// Load the task row, failing loudly if it no longer exists — the
    /// Worker should never be invoked on a task the queue doesn't know
    /// about.
    async fn load_task(&self, task_id: Uuid) -> anyhow::Result<ralph_db::models::Task> {
        tasks::get_task(self.pool, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))
    }

    /// Start the `in_progress` phase after preflight passes, per spec's
    /// coarse state machine `starting -> in_progress`.
    async fn mark_in_progress(&self, task_id: Uuid) -> anyhow::Result<()> {
        crate::state::dispatch::start_task(self.pool, task_id).await
    }

    async fn mark_blocked(&self, task_id: Uuid, source: BlockedSource, reason: &str) -> anyhow::Result<()> {
        let now = chrono::Utc::now();
        tasks::set_blocked(self.pool, task_id, source, reason, None, now).await
    }
}
