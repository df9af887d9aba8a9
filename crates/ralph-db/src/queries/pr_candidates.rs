//! Database query functions for the `pr_candidates` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PrCandidate, PrCandidateSource};

/// Record a candidate PR, idempotent on `(task_id, url)`.
pub async fn record_candidate(
    pool: &PgPool,
    task_id: Uuid,
    url: &str,
    source: PrCandidateSource,
) -> Result<PrCandidate> {
    sqlx::query_as::<_, PrCandidate>(
        r#"
        INSERT INTO pr_candidates (task_id, url, source)
        VALUES ($1, $2, $3)
        ON CONFLICT (task_id, url) DO UPDATE SET updated_at = now()
        RETURNING *
        "#,
    )
    .bind(task_id)
    .bind(url)
    .bind(source)
    .fetch_one(pool)
    .await
    .context("failed to record PR candidate")
}

/// All known candidates for a task, ordered per the canonical-selection
/// tie-break rule: `created_at`, then `updated_at`, then `url`.
pub async fn list_candidates(pool: &PgPool, task_id: Uuid) -> Result<Vec<PrCandidate>> {
    sqlx::query_as::<_, PrCandidate>(
        "SELECT * FROM pr_candidates WHERE task_id = $1 ORDER BY created_at, updated_at, url",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list PR candidates")
}

pub async fn delete_candidate(pool: &PgPool, task_id: Uuid, url: &str) -> Result<()> {
    sqlx::query("DELETE FROM pr_candidates WHERE task_id = $1 AND url = $2")
        .bind(task_id)
        .bind(url)
        .execute(pool)
        .await
        .context("failed to delete PR candidate")?;
    Ok(())
}
