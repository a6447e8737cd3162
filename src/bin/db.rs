use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use market_indexer::database::Database;
use market_indexer::models::EventRecord;

#[derive(Parser, Debug)]
#[command(name = "db")]
#[command(about = "Inspection tool for the market event database")]
struct DbArgs {
    #[arg(short, long, default_value = "market_events.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: DbCommands,
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    Stats,

    Checkpoints,

    Recent {
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    Queue {
        project: String,
        chain: String,

        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    Collections,
}

fn format_event(event: &EventRecord) -> String {
    format!(
        "Block {} | log {} | {} | contract {} | topic0 {} | tx {}",
        event.block_number,
        event.log_index,
        event.category,
        event.contract_address,
        event.topic0,
        event.transaction_hash
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = DbArgs::parse();

    info!("Opening database: {:?}", args.database);
    let database = Database::new(&args.database)?;

    match args.command {
        DbCommands::Stats => {
            let checkpoints = database.checkpoints()?;

            println!("=== Database Statistics ===");
            println!("Total events: {}", database.event_count()?);
            println!("Total collections: {}", database.collection_count()?);
            println!("Checkpoints: {}", checkpoints.len());
        }

        DbCommands::Checkpoints => {
            let checkpoints = database.checkpoints()?;
            println!("=== Ingestion Checkpoints ===");
            if checkpoints.is_empty() {
                println!("No checkpoints recorded.");
            } else {
                for checkpoint in &checkpoints {
                    println!(
                        "Chain {} | {} | block {} | at {}",
                        checkpoint.chain_id,
                        checkpoint.category,
                        checkpoint.last_block,
                        checkpoint.last_time
                    );
                }
            }
        }

        DbCommands::Recent { count } => {
            let events = database.recent_events(count)?;
            println!("=== Recent {} Events ===", count);
            if events.is_empty() {
                println!("No events found.");
            } else {
                for (i, event) in events.iter().enumerate() {
                    println!("{}. {}", i + 1, format_event(event));
                }
            }
        }

        DbCommands::Queue {
            project,
            chain,
            count,
        } => {
            let len = database.refresh_queue_len(&project, &chain)?;
            let entries = database.recent_refresh_entries(&project, &chain, count)?;

            println!("=== Refresh Queue ({}, {}) ===", project, chain);
            println!("Pending entries: {}", len);
            for (i, entry) in entries.iter().enumerate() {
                println!("{}. {}", i + 1, entry);
            }
        }

        DbCommands::Collections => {
            let imported = database.imported_collection_addresses()?;
            println!("=== Collections ===");
            println!("Total: {}", database.collection_count()?);
            println!("Imported: {}", imported.len());
            for (i, address) in imported.iter().enumerate() {
                println!("{}. {}", i + 1, address);
            }
        }
    }

    Ok(())
}
