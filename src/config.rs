use std::path::PathBuf;
use std::time::Duration;

use crate::models::IndexCategory;

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub database_path: String,
    pub contract_addresses: Vec<String>,
    pub categories: Vec<IndexCategory>,
    pub start_block: u64,

    pub batch_size: u64,
    pub poll_interval_secs: u64,
    pub retry_ceiling: u64,
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn new(
        chain_name: String,
        chain_id: u64,
        rpc_url: String,
        database_path: String,
        contract_addresses: Vec<String>,
        categories: Vec<IndexCategory>,
        start_block: u64,
    ) -> Self {
        Self {
            chain_name,
            chain_id,
            rpc_url,
            database_path,
            contract_addresses,
            categories,
            start_block,

            batch_size: 300,
            poll_interval_secs: 15,
            retry_ceiling: 5,
            request_timeout_secs: 30,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chain_name.is_empty() {
            return Err("Chain name cannot be empty".to_string());
        }

        if self.chain_id == 0 {
            return Err("Chain id cannot be zero".to_string());
        }

        if self.rpc_url.is_empty() {
            return Err("RPC URL cannot be empty".to_string());
        }

        if self.database_path.is_empty() {
            return Err("Database path cannot be empty".to_string());
        }

        for address in &self.contract_addresses {
            if !address.starts_with("0x") || address.len() != 42 {
                return Err(format!("Invalid contract address format: {}", address));
            }
        }

        if self.categories.is_empty() {
            return Err("At least one index category is required".to_string());
        }

        if self.batch_size == 0 {
            return Err("Batch size must be at least 1".to_string());
        }

        if self.retry_ceiling == 0 {
            return Err("Retry ceiling must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
