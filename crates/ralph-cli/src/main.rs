mod adapters;
mod config;
mod run_cmd;
mod serve_cmd;
mod status_cmd;
mod task_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ralph_db::pool;

use config::RalphCliConfig;

#[derive(Parser)]
#[command(name = "ralph", about = "Autonomous GitHub-issue-to-merge coding agent orchestrator")]
struct Cli {
    /// Database URL (overrides RALPH_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a ralph config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/ralph")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the ralph database (requires config file or env vars)
    DbInit,
    /// Show per-repo task status counts
    Status {
        /// Repository in owner/name form
        repo: String,
    },
    /// Task queue management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Retry an escalated task: reset it to queued for a fresh attempt
    Retry {
        /// Task ID (UUID) to retry
        task_id: String,
    },
    /// Drive one task through a single Worker invocation, using
    /// demonstration GitHub/session/throttle/notify adapters
    Run {
        /// Task ID (UUID) to process
        task_id: String,
        /// Resume an existing session instead of starting fresh, with this message
        #[arg(long)]
        resume: Option<String>,
    },
    /// Serve a read-only status API
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8080
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Enqueue a new task for a repo issue
    Enqueue {
        /// Repository in owner/name form
        repo: String,
        /// GitHub issue number
        issue_number: i64,
        /// Idempotency key distinguishing concurrent tasks on the same issue
        #[arg(long, default_value = "default")]
        task_key: String,
        /// Human-readable name shown in status views
        #[arg(long)]
        display_name: Option<String>,
        /// Repo concurrency slot this task occupies
        #[arg(long, default_value_t = 0)]
        repo_slot: i32,
    },
}

/// Execute the `ralph init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
        worker: config::WorkerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `ralph db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `ralph db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = RalphCliConfig::resolve(cli_db_url)?;

    println!("Initializing ralph database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("ralph db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Status { repo } => {
            let resolved = RalphCliConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, &repo).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = RalphCliConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TaskCommands::Enqueue { repo, issue_number, task_key, display_name, repo_slot } => {
                    let display_name = display_name.unwrap_or_else(|| format!("{repo}#{issue_number}"));
                    task_cmd::run_enqueue(
                        &db_pool,
                        task_cmd::EnqueueArgs { repo, issue_number, task_key, task_display_name: display_name, repo_slot },
                    )
                    .await
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Retry { task_id } => {
            let resolved = RalphCliConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = task_cmd::run_retry(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Run { task_id, resume } => {
            let resolved = RalphCliConfig::resolve(cli.database_url.as_deref())?;
            let ralph_config = resolved.to_ralph_config();
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmd::run_worker_once(&db_pool, &ralph_config, &task_id, resume.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { addr } => {
            let resolved = RalphCliConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let socket_addr = addr.parse().with_context(|| format!("invalid address: {addr}"))?;
            serve_cmd::run_serve(db_pool, socket_addr).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Serializes tests that mutate process-wide environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
