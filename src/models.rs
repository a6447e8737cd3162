use serde::{Deserialize, Serialize};
use ethers::types::{Log, H160, H256, U256};
use crate::error::{IndexerError, IndexerResult};

/// Immutable identity of one chain: selects and constructs a client,
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIdentity {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
}

impl ChainIdentity {
    pub fn new(name: impl Into<String>, chain_id: u64, rpc_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_id,
            rpc_url: rpc_url.into(),
        }
    }
}

/// Event categories tracked with independent ingestion checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexCategory {
    EntityTransfer,
    MultiMarketTrade,
    MultiMarketListing,
    MultiMarketSale,
    HubContractEvent,
    FloorPrice,
}

impl IndexCategory {
    pub const ALL: [IndexCategory; 6] = [
        IndexCategory::EntityTransfer,
        IndexCategory::MultiMarketTrade,
        IndexCategory::MultiMarketListing,
        IndexCategory::MultiMarketSale,
        IndexCategory::HubContractEvent,
        IndexCategory::FloorPrice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexCategory::EntityTransfer => "entity-transfer",
            IndexCategory::MultiMarketTrade => "multi-market-trade",
            IndexCategory::MultiMarketListing => "multi-market-listing",
            IndexCategory::MultiMarketSale => "multi-market-sale",
            IndexCategory::HubContractEvent => "hub-contract-event",
            IndexCategory::FloorPrice => "floor-price",
        }
    }
}

impl std::fmt::Display for IndexCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IndexCategory {
    type Err = IndexerError;

    fn from_str(s: &str) -> IndexerResult<Self> {
        match s {
            "entity-transfer" => Ok(IndexCategory::EntityTransfer),
            "multi-market-trade" => Ok(IndexCategory::MultiMarketTrade),
            "multi-market-listing" => Ok(IndexCategory::MultiMarketListing),
            "multi-market-sale" => Ok(IndexCategory::MultiMarketSale),
            "hub-contract-event" => Ok(IndexCategory::HubContractEvent),
            "floor-price" => Ok(IndexCategory::FloorPrice),
            other => Err(IndexerError::Config(format!(
                "Unknown index category: {}",
                other
            ))),
        }
    }
}

/// A block bound in a log query. Either a concrete number or the node's
/// current head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Latest,
}

impl From<u64> for BlockRef {
    fn from(n: u64) -> Self {
        BlockRef::Number(n)
    }
}

/// Standard log-filter shape: OR within a topic slot, AND across slots,
/// empty address list matches every address.
#[derive(Debug, Clone)]
pub struct LogFilterQuery {
    pub from_block: BlockRef,
    pub to_block: BlockRef,
    pub addresses: Vec<H160>,
    pub topics: Vec<Vec<H256>>,
}

impl LogFilterQuery {
    pub fn new(from_block: impl Into<BlockRef>, to_block: impl Into<BlockRef>) -> Self {
        Self {
            from_block: from_block.into(),
            to_block: to_block.into(),
            addresses: Vec::new(),
            topics: Vec::new(),
        }
    }

    pub fn address(mut self, address: H160) -> Self {
        self.addresses.push(address);
        self
    }

    pub fn addresses(mut self, addresses: Vec<H160>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Sets the alternatives for topic slot `slot` (0..=3). An empty slot is
    /// a wildcard.
    pub fn topic(mut self, slot: usize, alternatives: Vec<H256>) -> Self {
        while self.topics.len() <= slot {
            self.topics.push(Vec::new());
        }
        self.topics[slot] = alternatives;
        self
    }

    pub fn validate(&self) -> IndexerResult<()> {
        if let (BlockRef::Number(from), BlockRef::Number(to)) = (self.from_block, self.to_block) {
            if from > to {
                return Err(IndexerError::InvalidRange { from, to });
            }
        }
        if self.topics.len() > 4 {
            return Err(IndexerError::Config(format!(
                "Log filters support at most 4 topic slots, got {}",
                self.topics.len()
            )));
        }
        Ok(())
    }

    /// The matching predicate, independent of any wire client. A log matches
    /// iff its address is listed (or the list is empty) and every non-empty
    /// slot contains the log's topic at that position.
    pub fn matches(&self, event: &LogEvent) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&event.address) {
            return false;
        }
        for (slot, alternatives) in self.topics.iter().enumerate() {
            if alternatives.is_empty() {
                continue;
            }
            match event.topics.get(slot) {
                Some(topic) if alternatives.contains(topic) => {}
                _ => return false,
            }
        }
        true
    }
}

/// One emitted event record, normalized out of whatever wire shape the
/// client family returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub address: H160,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: H256,
    pub block_hash: H256,
}

impl LogEvent {
    /// Converts a wire log. Pending logs without block placement are not
    /// representable and yield None.
    pub fn from_log(log: &Log) -> Option<Self> {
        Some(Self {
            address: log.address,
            topics: log.topics.clone(),
            data: log.data.to_vec(),
            block_number: log.block_number?.as_u64(),
            log_index: log.log_index?.as_u64(),
            transaction_hash: log.transaction_hash?,
            block_hash: log.block_hash?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransactionSummary {
    pub hash: H256,
    pub from: H160,
    pub to: Option<H160>,
    pub value: U256,
}

/// Full block body with its transactions, as returned by
/// `ChainClient::block_with_transactions`.
#[derive(Debug, Clone)]
pub struct BlockBody {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub transactions: Vec<TransactionSummary>,
}

/// Durable ingestion checkpoint for one (chain, category) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub chain_id: u64,
    pub category: IndexCategory,
    pub last_block: u64,
    pub last_time: i64,
}

/// Payload of one metadata-refresh request, serialized into the durable
/// queue as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshEntry {
    pub chain_id: u64,
    pub collection_address: String,
    pub token_id: String,
}

/// Persisted raw-event row written by the default processor. Unique on
/// (chain_id, transaction_hash, log_index) so replayed batches are
/// idempotent.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub chain_id: u64,
    pub category: String,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: String,
    pub contract_address: String,
    pub topic0: String,
    pub payload: String,
    pub created_at: i64,
}

impl EventRecord {
    pub fn from_event(chain_id: u64, category: IndexCategory, event: &LogEvent) -> Self {
        Self {
            id: 0,
            chain_id,
            category: category.as_str().to_string(),
            block_number: event.block_number,
            log_index: event.log_index,
            transaction_hash: format!("{:#x}", event.transaction_hash),
            contract_address: format!("{:#x}", event.address),
            topic0: event
                .topics
                .first()
                .map(|t| format!("{:#x}", t))
                .unwrap_or_default(),
            payload: format!("0x{}", hex::encode(&event.data)),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}
