//! CLI for applying schema migrations outside the worker process.
//!
//! The worker also migrates on boot; this binary exists for operating the
//! schema independently (CI, one-off environments).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use selfservice_core::Config;
use sqlx::PgPool;

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Schema migration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Run,

    /// Show applied migration versions
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pool = connect().await?;

    match cli.command {
        Commands::Run => {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            println!("migrations applied");
        }
        Commands::Status => {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                "SELECT version, description FROM _sqlx_migrations ORDER BY version",
            )
            .fetch_all(&pool)
            .await
            .context("Failed to read migration history")?;

            if rows.is_empty() {
                println!("no migrations applied");
            }
            for (version, description) in rows {
                println!("{version} {description}");
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<PgPool> {
    let config = Config::from_env()?;
    PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")
}
