use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Coarse status of a task, per the Worker State Machine's observable
/// states: `queued -> starting -> in_progress <-> throttled -> {done,
/// escalated, blocked}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Starting,
    InProgress,
    Throttled,
    Blocked,
    Escalated,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::InProgress => "in_progress",
            Self::Throttled => "throttled",
            Self::Blocked => "blocked",
            Self::Escalated => "escalated",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "starting" => Ok(Self::Starting),
            "in_progress" => Ok(Self::InProgress),
            "throttled" => Ok(Self::Throttled),
            "blocked" => Ok(Self::Blocked),
            "escalated" => Ok(Self::Escalated),
            "done" => Ok(Self::Done),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Named checkpoints in the order the Worker is expected to reach them.
/// `implementation_step_complete` may recur any number of times between
/// `routed` and `pr_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    Planned,
    Routed,
    ImplementationStepComplete,
    PrReady,
    MergeStepComplete,
    SurveyComplete,
    Recorded,
}

impl Checkpoint {
    /// Ordinal position in the canonical ordering, used only for display
    /// and diagnostics — `implementation_step_complete` recurs, so this is
    /// not used to validate transitions.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Planned => 0,
            Self::Routed => 1,
            Self::ImplementationStepComplete => 2,
            Self::PrReady => 3,
            Self::MergeStepComplete => 4,
            Self::SurveyComplete => 5,
            Self::Recorded => 6,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Routed => "routed",
            Self::ImplementationStepComplete => "implementation_step_complete",
            Self::PrReady => "pr_ready",
            Self::MergeStepComplete => "merge_step_complete",
            Self::SurveyComplete => "survey_complete",
            Self::Recorded => "recorded",
        };
        f.write_str(s)
    }
}

impl FromStr for Checkpoint {
    type Err = CheckpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "routed" => Ok(Self::Routed),
            "implementation_step_complete" => Ok(Self::ImplementationStepComplete),
            "pr_ready" => Ok(Self::PrReady),
            "merge_step_complete" => Ok(Self::MergeStepComplete),
            "survey_complete" => Ok(Self::SurveyComplete),
            "recorded" => Ok(Self::Recorded),
            other => Err(CheckpointParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointParseError(pub String);

impl fmt::Display for CheckpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointParseError {}

// ---------------------------------------------------------------------------

/// The blocked-source taxonomy (spec §7): why a task is currently in the
/// `blocked` status, or why it escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BlockedSource {
    Allowlist,
    DirtyRepo,
    CiFailure,
    CiOnly,
    MergeConflict,
    MergeTarget,
    AutoUpdate,
    Stall,
    Guardrail,
    Deps,
    RuntimeError,
    ApiRateLimit,
    PrCreateLeaseConflict,
}

impl fmt::Display for BlockedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allowlist => "allowlist",
            Self::DirtyRepo => "dirty-repo",
            Self::CiFailure => "ci-failure",
            Self::CiOnly => "ci-only",
            Self::MergeConflict => "merge-conflict",
            Self::MergeTarget => "merge-target",
            Self::AutoUpdate => "auto-update",
            Self::Stall => "stall",
            Self::Guardrail => "guardrail",
            Self::Deps => "deps",
            Self::RuntimeError => "runtime-error",
            Self::ApiRateLimit => "api-rate-limit",
            Self::PrCreateLeaseConflict => "pr-create-lease-conflict",
        };
        f.write_str(s)
    }
}

impl FromStr for BlockedSource {
    type Err = BlockedSourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowlist" => Ok(Self::Allowlist),
            "dirty-repo" => Ok(Self::DirtyRepo),
            "ci-failure" => Ok(Self::CiFailure),
            "ci-only" => Ok(Self::CiOnly),
            "merge-conflict" => Ok(Self::MergeConflict),
            "merge-target" => Ok(Self::MergeTarget),
            "auto-update" => Ok(Self::AutoUpdate),
            "stall" => Ok(Self::Stall),
            "guardrail" => Ok(Self::Guardrail),
            "deps" => Ok(Self::Deps),
            "runtime-error" => Ok(Self::RuntimeError),
            "api-rate-limit" => Ok(Self::ApiRateLimit),
            "pr-create-lease-conflict" => Ok(Self::PrCreateLeaseConflict),
            other => Err(BlockedSourceParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockedSourceParseError(pub String);

impl fmt::Display for BlockedSourceParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid blocked source: {:?}", self.0)
    }
}

impl std::error::Error for BlockedSourceParseError {}

// ---------------------------------------------------------------------------

/// Terminal reasons a task can escalate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationCause {
    WatchdogRepeat,
    StallMaxRestarts,
    GuardrailRepeat,
    LoopDetected,
    MergeRefused,
    MergeConflictNoProgress,
    CiTriageExhausted,
    RuntimeError,
    /// Planner routed to escalate without signalling a more specific
    /// reason (spec §4.1 steps 3-4).
    PlannerEscalation,
    /// Planner judged the issue unbuildable as scoped, e.g. asks for
    /// something the product doesn't support.
    ProductGap,
    /// Planner judged the issue text too underspecified to build from.
    AmbiguousRequirements,
}

impl fmt::Display for EscalationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WatchdogRepeat => "watchdog-repeat",
            Self::StallMaxRestarts => "stall-max-restarts",
            Self::GuardrailRepeat => "guardrail-repeat",
            Self::LoopDetected => "loop-detected",
            Self::MergeRefused => "merge-refused",
            Self::MergeConflictNoProgress => "merge-conflict-no-progress",
            Self::CiTriageExhausted => "ci-triage-exhausted",
            Self::RuntimeError => "runtime-error",
            Self::PlannerEscalation => "planner-escalation",
            Self::ProductGap => "product-gap",
            Self::AmbiguousRequirements => "ambiguous-requirements",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// `attemptKind` on a [`RunRecord`]: whether the Worker entered via
/// `process` (fresh work) or `resume` (continuing a session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Process,
    Resume,
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Resume => "resume",
        })
    }
}

/// Outcome of a sealed [`RunRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Throttled,
    Escalated,
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Throttled => "throttled",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
        })
    }
}

/// How a successful run completed: by opening a PR, or by the post-merge
/// survey verifying completion with no PR needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Pr,
    Verified,
}

impl fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pr => "pr",
            Self::Verified => "verified",
        })
    }
}

/// Source of a [`PrCandidate`]: a row this process previously recorded, or
/// a result of a live GitHub search fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PrCandidateSource {
    Db,
    GhSearch,
}

impl fmt::Display for PrCandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Db => "db",
            Self::GhSearch => "gh-search",
        })
    }
}

/// Lease scope discriminator shared by the PR-create lease and the
/// merge-conflict recovery lease over the same idempotency table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LeaseScope {
    PrCreate,
    MergeConflict,
}

impl fmt::Display for LeaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PrCreate => "pr-create",
            Self::MergeConflict => "merge-conflict",
        })
    }
}

/// Which comment-state record a `comment_states` row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommentStateKind {
    CiDebug,
    MergeConflict,
}

impl fmt::Display for CommentStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CiDebug => "ci_debug",
            Self::MergeConflict => "merge_conflict",
        })
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task row: the full Data Model entity from spec §3, one row per
/// `(repo, issue_number, task_key)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub repo: String,
    pub issue_number: i64,
    pub task_key: String,
    pub task_display_name: String,
    pub status: TaskStatus,

    pub session_id: Option<String>,
    pub worker_id: Option<String>,
    pub repo_slot: i32,

    pub worktree_path: Option<String>,
    pub agent_profile: Option<String>,

    pub last_checkpoint: Option<Checkpoint>,
    pub checkpoint_seq: i64,
    pub pause_requested: bool,
    pub paused_at_checkpoint: Option<Checkpoint>,

    pub blocked_source: Option<BlockedSource>,
    pub blocked_reason: Option<String>,
    pub blocked_details: Option<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub blocked_checked_at: Option<DateTime<Utc>>,

    pub watchdog_retries: i32,
    pub stall_retries: i32,
    pub guardrail_retries: i32,

    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub throttled_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// `repo#issue` for logging and comment headers.
    pub fn issue_ref(&self) -> String {
        format!("{}#{}", self.repo, self.issue_number)
    }
}

/// An append-only dashboard/checkpoint event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A run record: one per `process`/`resume` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: Uuid,
    pub repo: String,
    pub issue_number: i64,
    pub task_id: Uuid,
    pub attempt_kind: AttemptKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub pr_url: Option<String>,
    pub completion_kind: Option<CompletionKind>,
    pub reason_code: Option<String>,
}

/// A candidate open PR associated with a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PrCandidate {
    pub id: Uuid,
    pub task_id: Uuid,
    pub url: String,
    pub source: PrCandidateSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A generic compare-and-set lease row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lease {
    pub lease_key: String,
    pub scope: LeaseScope,
    pub holder: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Durable comment-state row (attempt history, last signature, lease).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommentStateRow {
    pub task_id: Uuid,
    pub kind: CommentStateKind,
    pub attempts: i32,
    pub last_signature: Option<String>,
    pub history: serde_json::Value,
    pub triage_state: serde_json::Value,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::Starting,
            TaskStatus::InProgress,
            TaskStatus::Throttled,
            TaskStatus::Blocked,
            TaskStatus::Escalated,
            TaskStatus::Done,
        ] {
            let parsed: TaskStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn checkpoint_roundtrip() {
        for c in [
            Checkpoint::Planned,
            Checkpoint::Routed,
            Checkpoint::ImplementationStepComplete,
            Checkpoint::PrReady,
            Checkpoint::MergeStepComplete,
            Checkpoint::SurveyComplete,
            Checkpoint::Recorded,
        ] {
            let parsed: Checkpoint = c.to_string().parse().unwrap();
            assert_eq!(parsed, c);
        }
    }

    #[test]
    fn checkpoint_ordinal_is_monotonic() {
        let ordered = [
            Checkpoint::Planned,
            Checkpoint::Routed,
            Checkpoint::ImplementationStepComplete,
            Checkpoint::PrReady,
            Checkpoint::MergeStepComplete,
            Checkpoint::SurveyComplete,
            Checkpoint::Recorded,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].ordinal() < pair[1].ordinal());
        }
    }

    #[test]
    fn blocked_source_roundtrip() {
        for s in [
            BlockedSource::Allowlist,
            BlockedSource::DirtyRepo,
            BlockedSource::CiFailure,
            BlockedSource::CiOnly,
            BlockedSource::MergeConflict,
            BlockedSource::MergeTarget,
            BlockedSource::AutoUpdate,
            BlockedSource::Stall,
            BlockedSource::Guardrail,
            BlockedSource::Deps,
            BlockedSource::RuntimeError,
            BlockedSource::ApiRateLimit,
            BlockedSource::PrCreateLeaseConflict,
        ] {
            let parsed: BlockedSource = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn issue_ref_format() {
        let t = Task {
            id: Uuid::nil(),
            repo: "acme/foo".into(),
            issue_number: 42,
            task_key: "default".into(),
            task_display_name: "Fix the thing".into(),
            status: TaskStatus::Queued,
            session_id: None,
            worker_id: None,
            repo_slot: 0,
            worktree_path: None,
            agent_profile: None,
            last_checkpoint: None,
            checkpoint_seq: 0,
            pause_requested: false,
            paused_at_checkpoint: None,
            blocked_source: None,
            blocked_reason: None,
            blocked_details: None,
            blocked_at: None,
            blocked_checked_at: None,
            watchdog_retries: 0,
            stall_retries: 0,
            guardrail_retries: 0,
            assigned_at: None,
            completed_at: None,
            throttled_at: None,
            resume_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(t.issue_ref(), "acme/foo#42");
    }
}
