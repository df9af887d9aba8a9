//! Database query functions for the `worker_events` table — the append-only
//! dashboard/checkpoint log.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::WorkerEvent;

/// Insert an event, ignoring duplicates on `(task_id, seq, event_type)` —
/// this is what gives checkpoint publication its exactly-once semantics
/// when a retry re-delivers the same `worker.checkpoint.reached` emission.
pub async fn insert_event_idempotent(
    pool: &PgPool,
    task_id: Uuid,
    seq: i64,
    event_type: &str,
    payload: Value,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO worker_events (task_id, seq, event_type, payload)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (task_id, seq, event_type) DO NOTHING
        "#,
    )
    .bind(task_id)
    .bind(seq)
    .bind(event_type)
    .bind(payload)
    .execute(pool)
    .await
    .context("failed to insert worker event")?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<WorkerEvent>> {
    sqlx::query_as::<_, WorkerEvent>(
        "SELECT * FROM worker_events WHERE task_id = $1 ORDER BY seq, recorded_at",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list worker events")
}
