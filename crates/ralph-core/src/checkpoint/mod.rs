//! Checkpoint Ledger & Pause Protocol (spec §4.2).
//!
//! Checkpoint emission increments `checkpoint_seq`, sets `last_checkpoint`,
//! and publishes a `worker.checkpoint.reached` event keyed by
//! `(task_id, checkpoint_seq, checkpoint)` for exactly-once delivery.
//! Checkpoints are advisory: duplicate publication is suppressed by the
//! event dedupe key, never by skipping the ledger write.

use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use ralph_db::models::Checkpoint;
use ralph_db::queries::{tasks, worker_events};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint write lost the optimistic-lock race for task {0}")]
    Conflict(Uuid),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Emits checkpoints and publishes the matching dashboard event.
pub struct CheckpointLedger<'a> {
    pool: &'a PgPool,
}

impl<'a> CheckpointLedger<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Record that a task reached `checkpoint`. `expected_seq` is the
    /// caller's last-known `checkpoint_seq` — a mismatch means another
    /// worker advanced the task concurrently, which should never happen
    /// under the single-Worker-advancement invariant, so it is surfaced as
    /// an error rather than silently retried.
    pub async fn record(
        &self,
        task_id: Uuid,
        expected_seq: i64,
        checkpoint: Checkpoint,
    ) -> Result<(), CheckpointError> {
        let rows = tasks::record_checkpoint(self.pool, task_id, expected_seq, checkpoint).await?;
        if rows == 0 {
            return Err(CheckpointError::Conflict(task_id));
        }

        let new_seq = expected_seq + 1;
        worker_events::insert_event_idempotent(
            self.pool,
            task_id,
            new_seq,
            "worker.checkpoint.reached",
            serde_json::json!({ "checkpoint": checkpoint.to_string(), "seq": new_seq }),
        )
        .await?;

        tracing::info!(%task_id, %checkpoint, seq = new_seq, "checkpoint reached");
        Ok(())
    }

    /// Poll until `pause_requested` clears, honoring `pause_requested`
    /// suspension at the given checkpoint. Uses exponential backoff from
    /// 250ms up to 2s with jitter, per spec §4.2.
    pub async fn wait_while_paused(&self, task_id: Uuid, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let mut delay = Duration::from_millis(250);
        let max_delay = Duration::from_secs(2);

        loop {
            let task = ralph_db::queries::tasks::get_task(self.pool, task_id)
                .await?
                .ok_or_else(|| CheckpointError::Db(anyhow::anyhow!("task {task_id} not found")))?;

            if !task.pause_requested {
                tasks::set_paused_at_checkpoint(self.pool, task_id, None).await?;
                return Ok(());
            }

            tasks::set_paused_at_checkpoint(self.pool, task_id, Some(checkpoint)).await?;
            worker_events::insert_event_idempotent(
                self.pool,
                task_id,
                task.checkpoint_seq,
                "worker.pause.reached",
                serde_json::json!({ "checkpoint": checkpoint.to_string() }),
            )
            .await?;

            tokio::time::sleep(jittered(delay)).await;
            delay = std::cmp::min(delay * 2, max_delay);
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::rng().random_range(0..=50u64);
    base + Duration::from_millis(jitter_ms)
}
