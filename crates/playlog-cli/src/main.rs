use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playlog_etl::{EtlConfig, EtlRunSummary};
use playlog_storage::analytics;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "playlog")]
#[command(about = "Load song catalog and listening logs into a star-schema warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load both source trees, then reconcile staging (default)
    Etl {
        #[arg(long)]
        song_data: Option<PathBuf>,
        #[arg(long)]
        log_data: Option<PathBuf>,
        /// Run against an in-memory warehouse instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply schema migrations
    Migrate {
        /// Drop every warehouse table first
        #[arg(long)]
        reset: bool,
    },
    /// Most popular song and artist plus activity by level for one year
    Report {
        #[arg(long)]
        year: i32,
    },
    /// Row counts and sample rows of every warehouse table
    Inspect {
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Etl {
            song_data: None,
            log_data: None,
            dry_run: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    let cli = Cli::parse();
    let mut config = EtlConfig::from_env();

    match cli.command.unwrap_or_default() {
        Commands::Etl {
            song_data,
            log_data,
            dry_run,
        } => {
            if let Some(dir) = song_data {
                config.song_data_dir = dir;
            }
            if let Some(dir) = log_data {
                config.log_data_dir = dir;
            }
            let summary = if dry_run {
                playlog_etl::run_dry(config).await?
            } else {
                playlog_etl::run_etl(config).await?
            };
            print_summary(&summary);
        }
        Commands::Migrate { reset } => {
            let pool = playlog_storage::connect(&config.database_url)
                .await
                .context("connecting to the warehouse")?;
            if reset {
                playlog_storage::reset_schema(&pool)
                    .await
                    .context("resetting warehouse schema")?;
            } else {
                playlog_storage::migrate(&pool)
                    .await
                    .context("applying schema migrations")?;
            }
            info!(reset, "schema ready");
            println!("migrations applied");
        }
        Commands::Report { year } => {
            let pool = playlog_storage::connect(&config.database_url)
                .await
                .context("connecting to the warehouse")?;
            let report = analytics::year_report(&pool, year)
                .await
                .with_context(|| format!("building report for {year}"))?;
            println!("{}", analytics::year_report_markdown(&report));
        }
        Commands::Inspect { limit } => {
            let pool = playlog_storage::connect(&config.database_url)
                .await
                .context("connecting to the warehouse")?;
            for sample in analytics::inspect_tables(&pool, limit).await? {
                println!("{} ({} rows)", sample.table, sample.row_count);
                for row in &sample.rows {
                    println!("  {}", serde_json::to_string(row)?);
                }
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &EtlRunSummary) {
    println!(
        "etl complete: run_id={} song_files={} log_files={} events={} unresolved={} songplays={}",
        summary.run_id,
        summary.song_units,
        summary.log_units,
        summary.next_song_events,
        summary.unresolved_events,
        summary.committed_song_plays
    );
    if let Some(path) = &summary.report_path {
        println!("report: {path}");
    }
}
