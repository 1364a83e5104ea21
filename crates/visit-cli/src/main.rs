use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use visit_storage::{connect, PgVisitStore, VisitStore};
use visit_sync::{run_guarded, EtlPipeline, RunStatus, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "visit-etl")]
#[command(about = "Load ad-tracking visits from CSV url exports into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once (the default)
    Run(RunArgs),
    /// Create the visits table if it does not exist
    Migrate,
    /// Run the pipeline on a cron schedule until interrupted
    Schedule {
        /// Six-field cron expression (sec min hour day month weekday)
        #[arg(long)]
        cron: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Directory holding the source files (overrides DATA_DIRECTORY)
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Source file extension (overrides SOURCE_EXTENSION)
    #[arg(long)]
    extension: Option<String>,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
    /// Exit non-zero when the run does not complete
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            if let Some(dir) = args.data_dir {
                config.data_dir = dir;
            }
            if let Some(ext) = args.extension {
                config.extension = ext;
            }

            let status = run_guarded(config).await;
            match &status {
                RunStatus::Completed(summary) if args.json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(summary).context("serializing run summary")?
                    );
                }
                RunStatus::Completed(summary) => {
                    println!(
                        "run complete: run_id={} files={} extracted={} already_present={} inserted={}",
                        summary.run_id,
                        summary.source_files,
                        summary.extracted_records,
                        summary.already_present,
                        summary.inserted
                    );
                }
                RunStatus::Unavailable | RunStatus::Failed => {}
            }

            if args.strict && !status.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let Some(pool) = connect(&config.database).await? else {
                warn!("no database handle available; table not created");
                return Ok(ExitCode::SUCCESS);
            };
            PgVisitStore::new(pool).ensure_table().await?;
            info!("table ready");
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.schedule_cron.clone());
            let Some(pool) = connect(&config.database).await? else {
                warn!("no database handle available; scheduler not started");
                return Ok(ExitCode::SUCCESS);
            };

            let mut sched = EtlPipeline::from_config(&config)
                .build_scheduler(PgVisitStore::new(pool.clone()), &cron)
                .await?;
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
            pool.close().await;
        }
    }

    Ok(ExitCode::SUCCESS)
}
