use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kef_adapters::{CsvHttpSheetReader, FetchContext};
use kef_storage::{HttpClientConfig, HttpFetcher};
use kef_sync::{build_service, ImportConfig, PgResponseStore, RetryOutcome};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kef-cli")]
#[command(about = "KEF assessment importer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one import cycle.
    Sync,
    /// Serve the JSON control API.
    Serve,
    /// Create the Postgres responses table.
    Migrate,
    /// Fetch the sheet once and print its size and first rows.
    CheckSheet {
        #[arg(long)]
        url: Option<String>,
    },
    #[command(subcommand)]
    Failures(FailureCommands),
    /// Override the last-processed row.
    SetCursor { row: u32 },
    Status,
}

#[derive(Debug, Subcommand)]
enum FailureCommands {
    List,
    Retry { row: u32 },
    RetryAll,
    Purge { row: u32 },
    PurgeAll,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "kef=info,warn".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ImportConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = kef_sync::run_import_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} imported={} failed={} skipped={} cursor={}->{}",
                report.run_id,
                report.fetched,
                report.imported,
                report.failed,
                report.skipped,
                report.previous_cursor,
                report.new_cursor
            );
        }
        Commands::Serve => kef_web::serve_from_env().await?,
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to migrate");
            };
            PgResponseStore::connect(url)
                .await
                .context("connecting response database")?
                .migrate()
                .await?;
            println!("responses table ready");
        }
        Commands::CheckSheet { url } => {
            let Some(url) = url.or_else(|| config.sheet_url.clone()) else {
                bail!("pass --url or set KEF_SHEET_URL");
            };
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            let reader = CsvHttpSheetReader::new(http, &url);
            let probe = reader.probe(&FetchContext::new()).await?;
            println!("{}", serde_json::to_string_pretty(&probe)?);
        }
        Commands::Failures(cmd) => {
            let service = build_service(&config).await?;
            match cmd {
                FailureCommands::List => {
                    for failure in service.list_failures().await? {
                        println!(
                            "row={} retries={} last_failed_at={} reason={}",
                            failure.row_number,
                            failure.retry_count,
                            failure.last_failed_at.to_rfc3339(),
                            failure.reason
                        );
                    }
                }
                FailureCommands::Retry { row } => match service.retry_failure(row).await? {
                    RetryOutcome::Resolved { outcome, .. } => {
                        println!("row {row} imported ({outcome:?})")
                    }
                    RetryOutcome::StillFailing { failure } => {
                        println!("row {row} still failing: {}", failure.reason)
                    }
                },
                FailureCommands::RetryAll => {
                    let summary = service.retry_all_failures().await?;
                    println!(
                        "retried={} resolved={} still_failing={}",
                        summary.attempted, summary.resolved, summary.still_failing
                    );
                }
                FailureCommands::Purge { row } => {
                    service.purge_failure(row).await?;
                    println!("row {row} purged");
                }
                FailureCommands::PurgeAll => {
                    let removed = service.purge_all_failures().await?;
                    println!("purged {removed} failed rows");
                }
            }
        }
        Commands::SetCursor { row } => {
            let cursor = build_service(&config).await?.set_cursor(row).await?;
            println!("cursor set to {cursor}");
        }
        Commands::Status => {
            let service = build_service(&config).await?;
            let status = serde_json::json!({
                "cursor": service.cursor().await?,
                "pending_failures": service.list_failures().await?.len(),
                "poll_interval_secs": config.poll_interval_secs,
                "scheduler_enabled": config.scheduler_enabled,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
