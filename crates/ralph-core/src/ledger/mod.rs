//! Run Ledger & Token Accounting (spec §4.10): a run record opened at
//! Worker entry and sealed at exit, dashboard events emitted along the
//! way, and best-effort token-total refresh once the run is sealed.

use sqlx::PgPool;
use uuid::Uuid;

use ralph_db::models::{AttemptKind, CompletionKind, RunOutcome};
use ralph_db::queries::{run_records, worker_events};

use crate::ports::StateStore;

/// Dashboard event type strings emitted across a run's lifetime. Kept as
/// named constants rather than an enum since the `worker_events` table is
/// a free-text event log shared by every subsystem, not just the ledger.
pub mod events {
    pub const BECAME_BUSY: &str = "worker.became_busy";
    pub const BECAME_IDLE: &str = "worker.became_idle";
    pub const LOG_WORKER: &str = "log.worker";
    pub const LOG_OPENCODE_EVENT: &str = "log.opencode.event";
    pub const LOG_OPENCODE_TEXT: &str = "log.opencode.text";
}

/// Open a run record for a fresh `process`/`resume` invocation and emit
/// `worker.became_busy`.
pub async fn open(
    pool: &PgPool,
    task_id: Uuid,
    repo: &str,
    issue_number: i64,
    attempt_kind: AttemptKind,
    checkpoint_seq: i64,
) -> anyhow::Result<Uuid> {
    let run = run_records::open_run(pool, repo, issue_number, task_id, attempt_kind).await?;

    worker_events::insert_event_idempotent(
        pool,
        task_id,
        checkpoint_seq,
        events::BECAME_BUSY,
        serde_json::json!({ "run_id": run.id, "attempt_kind": attempt_kind.to_string() }),
    )
    .await?;

    Ok(run.id)
}

/// Seal the run with its terminal outcome and emit `worker.became_idle`.
pub async fn seal(
    pool: &PgPool,
    task_id: Uuid,
    run_id: Uuid,
    checkpoint_seq: i64,
    outcome: RunOutcome,
    pr_url: Option<&str>,
    completion_kind: Option<CompletionKind>,
    reason_code: Option<&str>,
) -> anyhow::Result<()> {
    run_records::seal_run(pool, run_id, outcome, pr_url, completion_kind, reason_code).await?;

    worker_events::insert_event_idempotent(
        pool,
        task_id,
        checkpoint_seq,
        events::BECAME_IDLE,
        serde_json::json!({ "run_id": run_id, "outcome": outcome.to_string() }),
    )
    .await?;

    Ok(())
}

/// Refresh token totals from the State Store after sealing. Best-effort:
/// a failure here never fails the run itself, only gets logged.
pub async fn refresh_token_totals(state_store: &dyn StateStore, task_id: Uuid) -> Option<u64> {
    match state_store.get_token_total(task_id).await {
        Ok(total) => Some(total),
        Err(err) => {
            tracing::warn!(%task_id, %err, "failed to refresh token totals after sealing run");
            None
        }
    }
}

/// A short footer appended to the run log once a run completes, per
/// spec's "append a short token-usage footer to the run-log when
/// complete".
pub fn token_usage_footer(total_tokens: u64, input_tokens: u64, output_tokens: u64) -> String {
    format!(
        "---\ntokens: {total_tokens} total ({input_tokens} in / {output_tokens} out)\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_mentions_totals() {
        let footer = token_usage_footer(300, 200, 100);
        assert!(footer.contains("300 total"));
        assert!(footer.contains("200 in"));
        assert!(footer.contains("100 out"));
    }
}
