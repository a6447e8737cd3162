use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::H160;
use futures::future::BoxFuture;
use tracing::info;

use crate::error::{IndexerError, IndexerResult};
use crate::models::{BlockBody, ChainIdentity, LogEvent, LogFilterQuery};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform read-only access to one chain. Implementations are stateless with
/// respect to caller-provided parameters; the underlying connection handles
/// concurrent calls internally, so a single instance is shared by every loop
/// targeting the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_height(&self) -> IndexerResult<u64>;

    /// Unix timestamp of the given block. `NotFound` if the node does not
    /// have the block yet.
    async fn block_timestamp(&self, block_number: u64) -> IndexerResult<u64>;

    /// Historical logs matching the query, in the chain's natural order:
    /// ascending by block number, then by in-block position.
    async fn filter_logs(&self, query: &LogFilterQuery) -> IndexerResult<Vec<LogEvent>>;

    /// Read-only contract call at the given block (or latest).
    async fn call_contract(
        &self,
        target: H160,
        payload: &[u8],
        at_block: Option<u64>,
    ) -> IndexerResult<Vec<u8>>;

    async fn block_with_transactions(&self, block_number: u64) -> IndexerResult<BlockBody>;

    fn identity(&self) -> &ChainIdentity;
}

/// Builds a client for one wire-protocol family. New families register an
/// implementation with the registry instead of extending a central switch.
pub trait ChainClientFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        identity: &'a ChainIdentity,
    ) -> BoxFuture<'a, IndexerResult<Arc<dyn ChainClient>>>;
}

/// Construction-time dispatch table from chain id to wire family.
pub struct ClientRegistry {
    factories: HashMap<u64, Arc<dyn ChainClientFactory>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with both built-in families: ethers for the canonical EVM
    /// chains, alloy for the rollup chains.
    pub fn with_defaults() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        let mut registry = Self::new();

        let ethereum = Arc::new(crate::ethereum::EthereumClientFactory::new(request_timeout));
        for chain_id in [1u64, 5, 11155111, 137, 80001, 56, 97] {
            registry.register(chain_id, ethereum.clone());
        }

        let alloy = Arc::new(crate::alloy_client::AlloyClientFactory::new(request_timeout));
        for chain_id in [10u64, 8453, 84532, 42161, 421614] {
            registry.register(chain_id, alloy.clone());
        }

        registry
    }

    pub fn register(&mut self, chain_id: u64, factory: Arc<dyn ChainClientFactory>) {
        self.factories.insert(chain_id, factory);
    }

    pub fn supports(&self, chain_id: u64) -> bool {
        self.factories.contains_key(&chain_id)
    }

    /// Dispatches on the identity's chain id. An unrecognized id constructs
    /// nothing and fails with `UnsupportedChain`.
    pub async fn connect(&self, identity: &ChainIdentity) -> IndexerResult<Arc<dyn ChainClient>> {
        let factory = self
            .factories
            .get(&identity.chain_id)
            .ok_or(IndexerError::UnsupportedChain(identity.chain_id))?;

        let client = factory.connect(identity).await?;
        info!(
            "Connected chain client for {} (chain id {})",
            identity.name, identity.chain_id
        );
        Ok(client)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
