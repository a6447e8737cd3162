use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    BlockId, BlockNumber, Filter, TransactionRequest, ValueOrArray, H160,
};
use futures::future::BoxFuture;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client_trait::{ChainClient, ChainClientFactory};
use crate::error::{IndexerError, IndexerResult};
use crate::models::{
    BlockBody, BlockRef, ChainIdentity, LogEvent, LogFilterQuery, TransactionSummary,
};

/// Node responses indicating the requested log window must be shrunk by the
/// caller rather than retried as-is.
const RANGE_ERRORS: &[&str] = &[
    "query returned more than",
    "range is too large",
    "block range is too wide",
    "too many results",
    "response size exceeded",
];

/// JSON-RPC wire family over `ethers`, used for the canonical EVM chains.
pub struct EthereumChainClient {
    provider: Arc<Provider<Http>>,
    identity: ChainIdentity,
    request_timeout: Duration,
}

impl EthereumChainClient {
    pub fn new(identity: ChainIdentity, request_timeout: Duration) -> IndexerResult<Self> {
        let provider = Provider::<Http>::try_from(identity.rpc_url.as_str())
            .map_err(|e| IndexerError::Config(format!("Invalid RPC URL: {}", e)))?;

        Ok(Self {
            provider: Arc::new(provider),
            identity,
            request_timeout,
        })
    }

    /// Applies the per-request deadline and normalizes provider errors.
    async fn bounded<T, F>(&self, fut: F) -> IndexerResult<T>
    where
        F: Future<Output = Result<T, ProviderError>> + Send,
    {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_provider_error(&e)),
            Err(_) => Err(IndexerError::UpstreamUnavailable(format!(
                "Request to {} timed out after {:?}",
                self.identity.name, self.request_timeout
            ))),
        }
    }

    fn build_filter(query: &LogFilterQuery) -> Filter {
        let mut filter = Filter::new()
            .from_block(to_block_number(query.from_block))
            .to_block(to_block_number(query.to_block));

        if !query.addresses.is_empty() {
            filter = filter.address(ValueOrArray::Array(query.addresses.clone()));
        }

        for (slot, alternatives) in query.topics.iter().enumerate().take(4) {
            if !alternatives.is_empty() {
                filter.topics[slot] = Some(ValueOrArray::Array(
                    alternatives.iter().map(|t| Some(*t)).collect(),
                ));
            }
        }

        filter
    }
}

fn to_block_number(block: BlockRef) -> BlockNumber {
    match block {
        BlockRef::Number(n) => BlockNumber::Number(n.into()),
        BlockRef::Latest => BlockNumber::Latest,
    }
}

fn map_provider_error(error: &ProviderError) -> IndexerError {
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
impl ChainClient for EthereumChainClient {
    async fn current_height(&self) -> IndexerResult<u64> {
        let height = self.bounded(self.provider.get_block_number()).await?;
        Ok(height.as_u64())
    }

    async fn block_timestamp(&self, block_number: u64) -> IndexerResult<u64> {
        let block = self
            .bounded(
                self.provider
                    .get_block(BlockId::Number(BlockNumber::Number(block_number.into()))),
            )
            .await?
            .ok_or_else(|| {
                IndexerError::NotFound(format!(
                    "Block {} not available on {}",
                    block_number, self.identity.name
                ))
            })?;

        Ok(block.timestamp.as_u64())
    }

    async fn filter_logs(&self, query: &LogFilterQuery) -> IndexerResult<Vec<LogEvent>> {
        query.validate()?;
        let filter = Self::build_filter(query);

        let logs = self.bounded(self.provider.get_logs(&filter)).await?;
        debug!(
            "Retrieved {} logs from {} for {:?}..{:?}",
            logs.len(),
            self.identity.name,
            query.from_block,
            query.to_block
        );

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match LogEvent::from_log(log) {
                Some(event) => events.push(event),
                None => warn!("Skipping log without block placement: {:?}", log.transaction_hash),
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
        let tx: TypedTransaction = TransactionRequest::new()
            .to(target)
            .data(payload.to_vec())
            .into();
        let block = at_block.map(|n| BlockId::Number(BlockNumber::Number(n.into())));

        let bytes = self.bounded(self.provider.call(&tx, block)).await?;
        Ok(bytes.to_vec())
    }

    async fn block_with_transactions(&self, block_number: u64) -> IndexerResult<BlockBody> {
        let block = self
            .bounded(
                self.provider
                    .get_block_with_txs(BlockId::Number(BlockNumber::Number(block_number.into()))),
            )
            .await?
            .ok_or_else(|| {
                IndexerError::NotFound(format!(
                    "Block {} not available on {}",
                    block_number, self.identity.name
                ))
            })?;

        let transactions = block
            .transactions
            .iter()
            .map(|tx| TransactionSummary {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                value: tx.value,
            })
            .collect();

        Ok(BlockBody {
            number: block.number.unwrap_or_default().as_u64(),
            hash: block.hash.unwrap_or_default(),
            parent_hash: block.parent_hash,
            timestamp: block.timestamp.as_u64(),
            transactions,
        })
    }

    fn identity(&self) -> &ChainIdentity {
        &self.identity
    }
}

pub struct EthereumClientFactory {
    request_timeout: Duration,
}

impl EthereumClientFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl ChainClientFactory for EthereumClientFactory {
    fn connect<'a>(
        &'a self,
        identity: &'a ChainIdentity,
    ) -> BoxFuture<'a, IndexerResult<Arc<dyn ChainClient>>> {
        Box::pin(async move {
            let client = EthereumChainClient::new(identity.clone(), self.request_timeout)?;
            Ok(Arc::new(client) as Arc<dyn ChainClient>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    fn event(address: H160, topics: Vec<H256>, block: u64, index: u64) -> LogEvent {
        LogEvent {
            address,
            topics,
            data: Vec::new(),
            block_number: block,
            log_index: index,
            transaction_hash: H256::zero(),
            block_hash: H256::zero(),
        }
    }

    #[test]
    fn invalid_range_is_rejected_before_any_network_call() {
        let query = LogFilterQuery::new(100u64, 50u64);
        match query.validate() {
            Err(IndexerError::InvalidRange { from, to }) => {
                assert_eq!(from, 100);
                assert_eq!(to, 50);
            }
            other => panic!("Expected InvalidRange, got {:?}", other),
        }
    }

    #[test]
    fn topic_slot_matches_any_alternative() {
        let sale = H256::repeat_byte(0xaa);
        let listing = H256::repeat_byte(0xbb);
        let unrelated = H256::repeat_byte(0xcc);

        let query = LogFilterQuery::new(0u64, 100u64).topic(0, vec![sale, listing]);

        assert!(query.matches(&event(H160::repeat_byte(1), vec![sale], 1, 0)));
        assert!(query.matches(&event(H160::repeat_byte(2), vec![listing], 2, 0)));
        assert!(!query.matches(&event(H160::repeat_byte(3), vec![unrelated], 3, 0)));
    }

    #[test]
    fn address_list_and_slots_combine_as_and() {
        let topic0 = H256::repeat_byte(0x11);
        let topic1 = H256::repeat_byte(0x22);
        let market = H160::repeat_byte(0x33);

        let query = LogFilterQuery::new(0u64, 10u64)
            .address(market)
            .topic(0, vec![topic0])
            .topic(1, vec![topic1]);

        assert!(query.matches(&event(market, vec![topic0, topic1], 5, 1)));
        assert!(!query.matches(&event(H160::repeat_byte(0x44), vec![topic0, topic1], 5, 1)));
        assert!(!query.matches(&event(market, vec![topic0], 5, 1)));
        assert!(!query.matches(&event(market, vec![topic1, topic0], 5, 1)));
    }

    #[test]
    fn wire_filter_carries_addresses_and_topic_slots() {
        let topic = H256::repeat_byte(0x55);
        let query = LogFilterQuery::new(10u64, 20u64)
            .address(H160::repeat_byte(0x66))
            .topic(0, vec![topic]);

        let filter = EthereumChainClient::build_filter(&query);
        assert!(filter.address.is_some());
        assert!(filter.topics[0].is_some());
        assert!(filter.topics[1].is_none());
    }

    #[test]
    fn range_errors_are_distinguished_from_transport_errors() {
        let range = ProviderError::CustomError("query returned more than 10000 results".to_string());
        assert!(matches!(
            map_provider_error(&range),
            IndexerError::RangeTooLarge(_)
        ));

        let revert = ProviderError::CustomError("execution reverted: ERC721 nonexistent".to_string());
        assert!(matches!(
            map_provider_error(&revert),
            IndexerError::ExecutionReverted(_)
        ));

        let transport = ProviderError::CustomError("connection refused".to_string());
        assert!(matches!(
            map_provider_error(&transport),
            IndexerError::UpstreamUnavailable(_)
        ));
    }
}
