use anyhow::Result;
use clap::{Parser, Subcommand};
use pricewatch_storage::{HistoryStore, DEFAULT_MAX_RECORDS};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Store price watcher: record prices, notify on changes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check every watched item once and write the notification file if anything changed.
    Check {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show the last recorded price of an item.
    Last {
        /// Item name as it appears in the history log.
        name: String,
        /// Match on item id instead of name alone.
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,pricewatch=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Check { json: false }) {
        Commands::Check { json } => {
            let summary = pricewatch_sync::run_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            println!(
                "check complete: run_id={} items={} fetched={} failed={} changed={} notification={:?}",
                summary.run_id,
                summary.tracked_items,
                summary.fetched,
                summary.failed,
                summary.notifications,
                summary.notification,
            );
            for (kind, count) in &summary.change_counts {
                println!("  {}: {}", kind.as_str(), count);
            }
        }
        Commands::Last { name, id } => {
            let store = HistoryStore::new(pricewatch_sync::history_path_from_env(), DEFAULT_MAX_RECORDS);
            let record = match id {
                Some(id) => store.find_most_recent_for(&id, &name).await?,
                None => store.find_most_recent(&name).await?,
            };
            match record {
                Some(record) => println!(
                    "{} [{}]: {}",
                    record.item_name, record.timestamp, record.price_state
                ),
                None => println!("no readable record for {name}"),
            }
        }
    }

    Ok(())
}
