pub mod alloy_client;
pub mod client_trait;
pub mod collection_filter;
pub mod config;
pub mod database;
pub mod error;
pub mod ethereum;
pub mod indexer;
pub mod models;
pub mod refresh_queue;
pub mod retry_pacer;

pub use client_trait::{ChainClient, ChainClientFactory, ClientRegistry};
pub use collection_filter::CollectionFilter;
pub use config::Config;
pub use database::Database;
pub use error::{IndexerError, IndexerResult};
pub use indexer::{EventProcessor, Indexer, IngestionLoop, RawEventRecorder};
pub use refresh_queue::RefreshQueue;
pub use retry_pacer::RetryPacer;
