use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::timeout;
use tracing::{debug, warn};

use alloy::primitives::{Address, Bytes as AlloyBytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::eth::{
    Block, BlockNumberOrTag, BlockTransactions, BlockTransactionsKind, Filter, Log as AlloyLog,
};
use alloy::rpc::types::BlockId;
use alloy::transports::http::Http;

use ethers::types::{H160, H256, U256};

use crate::client_trait::{ChainClient, ChainClientFactory};
use crate::error::{IndexerError, IndexerResult};
use crate::models::{
    BlockBody, BlockRef, ChainIdentity, LogEvent, LogFilterQuery, TransactionSummary,
};

const RANGE_ERRORS: &[&str] = &[
    "query returned more than",
    "range is too large",
    "block range is too wide",
    "too many results",
    "response size exceeded",
];

/// Second wire-protocol family over `alloy`, used for the rollup chains.
pub struct AlloyChainClient {
    provider: RootProvider<Http<reqwest::Client>>,
    identity: ChainIdentity,
    request_timeout: Duration,
}

impl AlloyChainClient {
    pub fn new(identity: ChainIdentity, request_timeout: Duration) -> IndexerResult<Self> {
        let url = reqwest::Url::parse(&identity.rpc_url)
            .map_err(|e| IndexerError::Config(format!("Invalid RPC URL: {}", e)))?;
        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            provider,
            identity,
            request_timeout,
        })
    }

    async fn bounded<T, E, F>(&self, fut: F) -> IndexerResult<T>
    where
        F: Future<Output = Result<T, E>> + Send,
        E: std::fmt::Display,
    {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_transport_error(e)),
            Err(_) => Err(IndexerError::UpstreamUnavailable(format!(
                "Request to {} timed out after {:?}",
                self.identity.name, self.request_timeout
            ))),
        }
    }

    fn build_filter(query: &LogFilterQuery) -> Filter {
        let mut filter = Filter::new();

        filter = match query.from_block {
            BlockRef::Number(n) => filter.from_block(n),
            BlockRef::Latest => filter.from_block(BlockNumberOrTag::Latest),
        };
        filter = match query.to_block {
            BlockRef::Number(n) => filter.to_block(n),
            BlockRef::Latest => filter.to_block(BlockNumberOrTag::Latest),
        };

        if !query.addresses.is_empty() {
            let addresses: Vec<Address> = query.addresses.iter().map(to_address).collect();
            filter = filter.address(addresses);
        }

        for (slot, alternatives) in query.topics.iter().enumerate().take(4) {
            if !alternatives.is_empty() {
                let topics: Vec<B256> = alternatives.iter().map(to_b256).collect();
                filter.topics[slot] = topics.into();
            }
        }

        filter
    }

    fn convert_log(log: &AlloyLog) -> Option<LogEvent> {
        Some(LogEvent {
            address: from_address(log.address()),
            topics: log.topics().iter().map(|t| from_b256(*t)).collect(),
            data: log.data().data.to_vec(),
            block_number: log.block_number?,
            log_index: log.log_index?,
            transaction_hash: from_b256(log.transaction_hash?),
            block_hash: from_b256(log.block_hash?),
        })
    }

    async fn fetch_block(
        &self,
        block_number: u64,
        kind: BlockTransactionsKind,
    ) -> IndexerResult<Block> {
        let block = self
            .bounded(self.provider.get_block(BlockId::Number(block_number.into()), kind))
            .await?;

        block.ok_or_else(|| {
            IndexerError::NotFound(format!(
                "Block {} not available on {}",
                block_number, self.identity.name
            ))
        })
    }
}

fn to_address(address: &H160) -> Address {
    Address::from_slice(address.as_bytes())
}

fn from_address(address: Address) -> H160 {
    H160::from_slice(address.as_slice())
}

fn to_b256(hash: &H256) -> B256 {
    B256::from_slice(hash.as_bytes())
}

fn from_b256(hash: B256) -> H256 {
    H256::from_slice(hash.as_slice())
}

fn map_transport_error(error: impl std::fmt::Display) -> IndexerError {
    let message = error.to_string();
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("revert") {
        return IndexerError::ExecutionReverted(message);
    }
    if RANGE_ERRORS.iter().any(|marker| lowered.contains(marker)) {
        return IndexerError::RangeTooLarge(message);
    }
    IndexerError::UpstreamUnavailable(message)
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn current_height(&self) -> IndexerResult<u64> {
        let height = self.bounded(self.provider.get_block_number()).await?;
        Ok(height)
    }

    async fn block_timestamp(&self, block_number: u64) -> IndexerResult<u64> {
        let block = self
            .fetch_block(block_number, BlockTransactionsKind::Hashes)
            .await?;
        Ok(block.header.timestamp)
    }

    async fn filter_logs(&self, query: &LogFilterQuery) -> IndexerResult<Vec<LogEvent>> {
        query.validate()?;
        let filter = Self::build_filter(query);

        let logs: Vec<AlloyLog> = self.bounded(self.provider.get_logs(&filter)).await?;
        debug!(
            "Retrieved {} logs from {} for {:?}..{:?}",
            logs.len(),
            self.identity.name,
            query.from_block,
            query.to_block
        );

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match Self::convert_log(log) {
                Some(event) => events.push(event),
                None => warn!(
                    "Skipping log without block placement: {:?}",
                    log.transaction_hash
                ),
            }
        }

        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn call_contract(
        &self,
        target: H160,
        payload: &[u8],
        at_block: Option<u64>,
    ) -> IndexerResult<Vec<u8>> {
        let call = serde_json::json!({
            "to": to_address(&target),
            "data": format!("0x{}", hex::encode(payload)),
        });
        let block = match at_block {
            Some(n) => format!("0x{:x}", n),
            None => "latest".to_string(),
        };

        let bytes: AlloyBytes = self
            .bounded(self.provider.raw_request("eth_call".into(), (call, block)))
            .await?;
        Ok(bytes.to_vec())
    }

    async fn block_with_transactions(&self, block_number: u64) -> IndexerResult<BlockBody> {
        let block = self
            .fetch_block(block_number, BlockTransactionsKind::Full)
            .await?;

        let transactions = match &block.transactions {
            BlockTransactions::Full(txs) => txs
                .iter()
                .map(|tx| TransactionSummary {
                    hash: from_b256(tx.hash),
                    from: from_address(tx.from),
                    to: tx.to.map(from_address),
                    value: U256::from_big_endian(&tx.value.to_be_bytes::<32>()),
                })
                .collect(),
            _ => Vec::new(),
        };

        let number = block.header.number;

        Ok(BlockBody {
            number,
            hash: from_b256(block.header.hash),
            parent_hash: from_b256(block.header.parent_hash),
            timestamp: block.header.timestamp,
            transactions,
        })
    }

    fn identity(&self) -> &ChainIdentity {
        &self.identity
    }
}

pub struct AlloyClientFactory {
    request_timeout: Duration,
}

impl AlloyClientFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl ChainClientFactory for AlloyClientFactory {
    fn connect<'a>(
        &'a self,
        identity: &'a ChainIdentity,
    ) -> BoxFuture<'a, IndexerResult<Arc<dyn ChainClient>>> {
        Box::pin(async move {
            let client = AlloyChainClient::new(identity.clone(), self.request_timeout)?;
            Ok(Arc::new(client) as Arc<dyn ChainClient>)
        })
    }
}
