use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use cpw_storage::SnapshotExporter;
use cpw_sync::{RefreshOutcome, SourceRegistry, SyncConfig};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cpw-cli")]
#[command(about = "Catalog price watch: poll upstream game catalogs and serve the latest snapshot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP api with the background refresh scheduler.
    Serve,
    /// Run one refresh cycle and print a summary.
    Refresh,
    /// Run one refresh cycle and write the snapshot as JSON.
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the resolved source chain.
    Sources,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

fn summary_line(outcome: &RefreshOutcome) -> String {
    match outcome {
        RefreshOutcome::Committed {
            source_id,
            total,
            new_records,
            price_changes,
            complete,
        } => format!(
            "refresh committed: source={source_id} total={total} new={new_records} price_changes={price_changes} complete={complete}"
        ),
        RefreshOutcome::Exhausted => "refresh exhausted: every source came back empty".to_string(),
        RefreshOutcome::AlreadyInFlight => "refresh skipped: another cycle is running".to_string(),
        RefreshOutcome::Failed { message } => format!("refresh failed: {message}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cpw_web::serve_from_env().await?,
        Commands::Refresh => {
            let (_, outcome) = cpw_sync::run_refresh_once_from_env().await?;
            println!("{}", summary_line(&outcome));
        }
        Commands::Export { out } => {
            let (runtime, outcome) = cpw_sync::run_refresh_once_from_env().await?;
            println!("{}", summary_line(&outcome));
            let Some(entry) = runtime.current_entry().await else {
                bail!("nothing to export: refresh produced no snapshot");
            };
            let exported = SnapshotExporter::new(out)
                .export(runtime.coordinator.key(), &entry)
                .await?;
            println!(
                "snapshot written: path={} bytes={} sha256={} deduplicated={}",
                exported.absolute_path.display(),
                exported.byte_size,
                exported.content_hash,
                exported.deduplicated
            );
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            for (position, source) in registry
                .resolve(config.source_override.as_deref())?
                .iter()
                .enumerate()
            {
                println!(
                    "{}. {} ({:?}) {} {}",
                    position + 1,
                    source.source_id,
                    source.kind,
                    source.display_name,
                    source.base_url.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
