//! Database query functions for the `idempotency_leases` table — the
//! compare-and-set primitive backing both the PR-create lease and the
//! merge-conflict recovery lease.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::{Lease, LeaseScope};

/// Attempt to claim a lease. Succeeds (returns `Some`) if no live lease
/// exists for `(lease_key, scope)`, or the existing one is stale
/// (`expires_at < now`) and gets reclaimed atomically.
pub async fn try_claim(
    pool: &PgPool,
    lease_key: &str,
    scope: LeaseScope,
    holder: &str,
    payload: Value,
    ttl_secs: i64,
) -> Result<Option<Lease>> {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(ttl_secs);

    let inserted = sqlx::query_as::<_, Lease>(
        r#"
        INSERT INTO idempotency_leases (lease_key, scope, holder, payload, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (lease_key, scope) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(lease_key)
    .bind(scope)
    .bind(holder)
    .bind(&payload)
    .bind(now)
    .bind(expires_at)
    .fetch_optional(pool)
    .await
    .context("failed to insert lease")?;

    if let Some(lease) = inserted {
        return Ok(Some(lease));
    }

    // Existing row present — try to reclaim it if stale.
    let reclaimed = sqlx::query_as::<_, Lease>(
        r#"
        UPDATE idempotency_leases
        SET holder = $3, payload = $4, created_at = $5, expires_at = $6
        WHERE lease_key = $1 AND scope = $2 AND expires_at < $5
        RETURNING *
        "#,
    )
    .bind(lease_key)
    .bind(scope)
    .bind(holder)
    .bind(&payload)
    .bind(now)
    .bind(expires_at)
    .fetch_optional(pool)
    .await
    .context("failed to reclaim stale lease")?;

    Ok(reclaimed)
}

pub async fn get(pool: &PgPool, lease_key: &str, scope: LeaseScope) -> Result<Option<Lease>> {
    sqlx::query_as::<_, Lease>(
        "SELECT * FROM idempotency_leases WHERE lease_key = $1 AND scope = $2",
    )
    .bind(lease_key)
    .bind(scope)
    .fetch_optional(pool)
    .await
    .context("failed to fetch lease")
}

/// Release a lease — only the current holder may do this.
pub async fn release(pool: &PgPool, lease_key: &str, scope: LeaseScope, holder: &str) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM idempotency_leases WHERE lease_key = $1 AND scope = $2 AND holder = $3",
    )
    .bind(lease_key)
    .bind(scope)
    .bind(holder)
    .execute(pool)
    .await
    .context("failed to release lease")?;
    Ok(result.rows_affected() > 0)
}

/// Extend a held lease's TTL (renewal while a long-running holder is still
/// making progress).
pub async fn renew(
    pool: &PgPool,
    lease_key: &str,
    scope: LeaseScope,
    holder: &str,
    ttl_secs: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE idempotency_leases
        SET expires_at = now() + make_interval(secs => $4)
        WHERE lease_key = $1 AND scope = $2 AND holder = $3
        "#,
    )
    .bind(lease_key)
    .bind(scope)
    .bind(holder)
    .bind(ttl_secs as f64)
    .execute(pool)
    .await
    .context("failed to renew lease")?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_stale_compares_expiry() {
        let now = Utc::now();
        let lease = Lease {
            lease_key: "k".into(),
            scope: LeaseScope::PrCreate,
            holder: "w1".into(),
            payload: Value::Null,
            created_at: now - chrono::Duration::minutes(30),
            expires_at: now - chrono::Duration::minutes(10),
        };
        assert!(lease.is_stale(now));
    }

    #[test]
    fn is_not_stale_before_expiry() {
        let now = Utc::now();
        let lease = Lease {
            lease_key: "k".into(),
            scope: LeaseScope::PrCreate,
            holder: "w1".into(),
            payload: Value::Null,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(10),
        };
        assert!(!lease.is_stale(now));
    }
}
