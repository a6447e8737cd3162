use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use market_indexer::models::IndexCategory;
use market_indexer::{Config, Indexer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Marketplace event ingestion daemon", long_about = None)]
struct Args {
    #[arg(long, default_value = "ethereum")]
    chain_name: String,

    #[arg(long, default_value = "1")]
    chain_id: u64,

    #[arg(short, long, default_value = "http://localhost:8545")]
    rpc_url: String,

    #[arg(short, long, default_value = "market_events.db")]
    database: String,

    /// Marketplace contract addresses to watch; may be repeated.
    #[arg(short, long = "contract-address")]
    contract_addresses: Vec<String>,

    /// Event categories to index, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "entity-transfer")]
    categories: Vec<IndexCategory>,

    #[arg(short, long, default_value = "0")]
    start_block: u64,

    #[arg(long, default_value = "300")]
    batch_size: u64,

    #[arg(long, default_value = "15")]
    poll_interval: u64,

    #[arg(long, default_value = "5")]
    retry_ceiling: u64,

    #[arg(long, default_value = "30")]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = Config::new(
        args.chain_name,
        args.chain_id,
        args.rpc_url,
        args.database,
        args.contract_addresses,
        args.categories,
        args.start_block,
    );
    config.batch_size = args.batch_size;
    config.poll_interval_secs = args.poll_interval;
    config.retry_ceiling = args.retry_ceiling;
    config.request_timeout_secs = args.request_timeout;

    info!(
        "Starting market indexer for {} (chain id {})",
        config.chain_name, config.chain_id
    );

    let mut indexer = Indexer::new(config).await?;
    indexer.start()?;

    info!("Ingestion loops running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown requested, stopping ingestion loops");
    indexer.stop();

    if let Err(e) = indexer.join().await {
        error!("Indexer terminated with error: {}", e);
        return Err(anyhow::anyhow!("Indexer terminated with error: {}", e));
    }

    Ok(())
}
