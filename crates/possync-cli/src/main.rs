use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "possync")]
#[command(about = "Incremental Square point-of-sale sales sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync pass
    Sync,
    /// Create the database schema and exit
    Migrate,
    /// Run the cron scheduler until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = possync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} window=[{}, {}) locations={} orders={} inserted={} duplicates={}",
                summary.run_id,
                summary.window_start,
                summary.window_end,
                summary.locations,
                summary.orders_seen,
                summary.records_inserted,
                summary.duplicates_skipped
            );
        }
        Commands::Migrate => {
            possync_sync::migrate_from_env().await?;
            println!("schema ready");
        }
        Commands::Schedule => {
            possync_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
