mod config;
mod janitor_cmd;
mod queues_cmd;
mod status_cmd;
mod submit_cmd;

use clap::{Parser, Subcommand};

use strata_core::registry::JobRegistry;
use strata_db::pool;

use config::StrataConfig;

#[derive(Parser)]
#[command(name = "strata", about = "Multi-stage job orchestration engine")]
struct Cli {
    /// Database URL (overrides STRATA_DATABASE_URL env var and config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a strata config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/strata")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the strata database and run migrations
    DbInit,
    /// Submit a job
    Submit {
        /// Job type to submit
        job_type: String,
        /// Inline JSON parameters
        #[arg(long)]
        params: Option<String>,
        /// Path to a JSON parameters file
        #[arg(long)]
        params_file: Option<String>,
    },
    /// Show job status (omit job_id to list recent jobs)
    Status {
        /// Job ID to show status for
        job_id: Option<String>,
    },
    /// Show the task table for a job
    Tasks {
        /// Parent job ID
        job_id: String,
    },
    /// Run a one-shot janitor pass (or show run history)
    Janitor {
        /// Show recent janitor runs instead of running a pass
        #[arg(long)]
        history: bool,
        /// Hours of history to show
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Show broker queue depths
    Queues,
}

/// Execute the `strata init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `strata db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `strata db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = StrataConfig::resolve(cli_db_url)?;

    println!("Initializing strata database...");

    // 1. Create the database if it does not exist.
    let created = pool::ensure_database(&resolved.db_config).await?;
    if created {
        println!("Database created.");
    }

    // 2. Connect to the target database.
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    // 3. Run migrations.
    pool::run_migrations(&db_pool).await?;

    // 4. Print success with table counts.
    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    // 5. Clean shutdown.
    db_pool.close().await;

    println!("strata db-init complete.");
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
        Commands::Submit {
            job_type,
            params,
            params_file,
        } => {
            let resolved = StrataConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            // Job classes are linked in by embedding deployments; the
            // stock binary validates against an empty registry.
            let registry = JobRegistry::new();
            let result = submit_cmd::run_submit(
                &db_pool,
                &registry,
                &job_type,
                params.as_deref(),
                params_file.as_deref(),
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { job_id } => {
            let resolved = StrataConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, job_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Tasks { job_id } => {
            let resolved = StrataConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_tasks(&db_pool, &job_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Janitor { history, hours } => {
            let resolved = StrataConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = if history {
                janitor_cmd::run_history(&db_pool, hours).await
            } else {
                janitor_cmd::run_janitor(&db_pool).await
            };
            db_pool.close().await;
            result?;
        }
        Commands::Queues => {
            let resolved = StrataConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = queues_cmd::run_queues(&db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
