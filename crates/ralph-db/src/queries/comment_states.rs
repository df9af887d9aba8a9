//! Database query functions for the `comment_states` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CommentStateKind, CommentStateRow};

pub async fn get_or_create(
    pool: &PgPool,
    task_id: Uuid,
    kind: CommentStateKind,
) -> Result<CommentStateRow> {
    sqlx::query_as::<_, CommentStateRow>(
        r#"
        INSERT INTO comment_states (task_id, kind)
        VALUES ($1, $2)
        ON CONFLICT (task_id, kind) DO UPDATE SET task_id = EXCLUDED.task_id
        RETURNING *
        "#,
    )
    .bind(task_id)
    .bind(kind)
    .fetch_one(pool)
    .await
    .context("failed to get or create comment state")
}

/// Record a new attempt: bumps `attempts`, replaces `last_signature`,
/// appends to `history`.
pub async fn record_attempt(
    pool: &PgPool,
    task_id: Uuid,
    kind: CommentStateKind,
    signature: &str,
    history_entry: Value,
) -> Result<CommentStateRow> {
    sqlx::query_as::<_, CommentStateRow>(
        r#"
        UPDATE comment_states
        SET attempts = attempts + 1,
            last_signature = $3,
            history = history || jsonb_build_array($4::jsonb),
            updated_at = now()
        WHERE task_id = $1 AND kind = $2
        RETURNING *
        "#,
    )
    .bind(task_id)
    .bind(kind)
    .bind(signature)
    .bind(history_entry)
    .fetch_one(pool)
    .await
    .context("failed to record comment-state attempt")
}

pub async fn set_triage_state(
    pool: &PgPool,
    task_id: Uuid,
    kind: CommentStateKind,
    triage_state: Value,
) -> Result<()> {
    sqlx::query(
        "UPDATE comment_states SET triage_state = $3, updated_at = now() WHERE task_id = $1 AND kind = $2",
    )
    .bind(task_id)
    .bind(kind)
    .bind(triage_state)
    .execute(pool)
    .await
    .context("failed to set triage state")?;
    Ok(())
}

/// Claim the comment-marker lease embedded in a comment-state row —
/// succeeds only if no holder is set or the held lease has expired.
pub async fn claim_lease(
    pool: &PgPool,
    task_id: Uuid,
    kind: CommentStateKind,
    holder: &str,
    ttl_secs: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE comment_states
        SET lease_holder = $3, lease_expires_at = now() + make_interval(secs => $4), updated_at = now()
        WHERE task_id = $1 AND kind = $2
          AND (lease_holder IS NULL OR lease_expires_at < now())
        "#,
    )
    .bind(task_id)
    .bind(kind)
    .bind(holder)
    .bind(ttl_secs as f64)
    .execute(pool)
    .await
    .context("failed to claim comment-marker lease")?;
    Ok(result.rows_affected() > 0)
}

pub async fn release_lease(
    pool: &PgPool,
    task_id: Uuid,
    kind: CommentStateKind,
    holder: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE comment_states
        SET lease_holder = NULL, lease_expires_at = NULL, updated_at = now()
        WHERE task_id = $1 AND kind = $2 AND lease_holder = $3
        "#,
    )
    .bind(task_id)
    .bind(kind)
    .bind(holder)
    .execute(pool)
    .await
    .context("failed to release comment-marker lease")?;
    Ok(())
}
