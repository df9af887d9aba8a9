//! `ralph status`: per-repo task counts by status.

use anyhow::Result;
use sqlx::PgPool;

use ralph_core::state::queries;
use ralph_db::models::TaskStatus;

const ALL_STATUSES: [TaskStatus; 7] = [
    TaskStatus::Queued,
    TaskStatus::Starting,
    TaskStatus::InProgress,
    TaskStatus::Throttled,
    TaskStatus::Blocked,
    TaskStatus::Escalated,
    TaskStatus::Done,
];

pub async fn run_status(pool: &PgPool, repo: &str) -> Result<()> {
    let counts = queries::status_counts_for_repo(pool, repo).await?;

    println!("Status for {repo}:");
    for status in ALL_STATUSES {
        let count = counts.get(&status).copied().unwrap_or(0);
        println!("  {status:<12} {count}");
    }

    Ok(())
}
