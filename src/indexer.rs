use std::cmp::min;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::H160;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::client_trait::{ChainClient, ClientRegistry};
use crate::collection_filter::CollectionFilter;
use crate::config::Config;
use crate::database::Database;
use crate::error::{IndexerError, IndexerResult};
use crate::models::{ChainIdentity, EventRecord, IndexCategory, LogEvent, LogFilterQuery};
use crate::retry_pacer::RetryPacer;

/// The seam where marketplace-specific decoding plugs into the ingestion
/// loop. A processor owns one category: it supplies the category's log query
/// for a block window and consumes the events the loop fetched.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn category(&self) -> IndexCategory;

    fn query(&self, from_block: u64, to_block: u64) -> LogFilterQuery;

    async fn process(&self, chain_id: u64, events: &[LogEvent]) -> IndexerResult<()>;
}

/// Default processor: persists the normalized events verbatim. Replayed
/// batches are deduplicated by the store's uniqueness constraint.
pub struct RawEventRecorder {
    database: Database,
    category: IndexCategory,
    addresses: Vec<H160>,
}

impl RawEventRecorder {
    pub fn new(database: Database, category: IndexCategory, addresses: Vec<H160>) -> Self {
        Self {
            database,
            category,
            addresses,
        }
    }
}

#[async_trait]
impl EventProcessor for RawEventRecorder {
    fn category(&self) -> IndexCategory {
        self.category
    }

    fn query(&self, from_block: u64, to_block: u64) -> LogFilterQuery {
        LogFilterQuery::new(from_block, to_block).addresses(self.addresses.clone())
    }

    async fn process(&self, chain_id: u64, events: &[LogEvent]) -> IndexerResult<()> {
        let records: Vec<EventRecord> = events
            .iter()
            .map(|event| EventRecord::from_event(chain_id, self.category, event))
            .collect();
        self.database.store_events_batch(&records)
    }
}

/// What one polling cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Processed the window `from..=to` and advanced the checkpoint.
    Advanced { from: u64, to: u64, events: usize },
    /// Checkpoint already at the chain head; nothing to fetch.
    Idle,
}

/// One polling loop for one (chain, category) pair. Each loop owns its own
/// pacer; the client, database, and collection filter are shared.
pub struct IngestionLoop {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    database: Database,
    collection_filter: Arc<CollectionFilter>,
    processor: Arc<dyn EventProcessor>,
    pacer: RetryPacer,
    start_block: u64,
    batch_size: u64,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl IngestionLoop {
    pub fn new(
        chain_id: u64,
        client: Arc<dyn ChainClient>,
        database: Database,
        collection_filter: Arc<CollectionFilter>,
        processor: Arc<dyn EventProcessor>,
        config: &Config,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain_id,
            client,
            database,
            collection_filter,
            processor,
            pacer: RetryPacer::new(config.retry_ceiling),
            start_block: config.start_block,
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
            stop,
        }
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// One polling cycle: resume from the checkpoint, fetch the next window
    /// of logs, drop events from already-imported collections, hand the rest
    /// to the processor, advance the checkpoint to the window end.
    pub async fn run_once(&mut self) -> IndexerResult<CycleOutcome> {
        let category = self.processor.category();
        let height = self.client.current_height().await?;

        let checkpoint = self.database.get_indexed_status(self.chain_id, category)?;
        let from = match checkpoint {
            Some(ref checkpoint) => checkpoint.last_block + 1,
            None => self.start_block,
        };

        if from > height {
            return Ok(CycleOutcome::Idle);
        }

        let to = min(from + self.batch_size - 1, height);
        let query = self.processor.query(from, to);
        let mut events = self.client.filter_logs(&query).await?;

        let fetched = events.len();
        events.retain(|event| {
            !self
                .collection_filter
                .contains(&format!("{:#x}", event.address))
        });
        if fetched > events.len() {
            debug!(
                "Skipped {} events from already-imported collections in {}..{}",
                fetched - events.len(),
                from,
                to
            );
        }

        self.processor.process(self.chain_id, &events).await?;

        let now = chrono::Utc::now().timestamp();
        self.database
            .advance_indexed_status(self.chain_id, category, to, now)?;

        Ok(CycleOutcome::Advanced {
            from,
            to,
            events: events.len(),
        })
    }

    /// Polls until stopped. Transient failures pace with the loop's own
    /// backoff; an oversized window is halved and retried immediately; a
    /// missing block waits one poll interval. Logic errors abort this loop
    /// and leave every other loop running.
    pub async fn run(mut self) -> IndexerResult<()> {
        let category = self.processor.category();
        info!(
            "Starting {} ingestion loop for chain {}",
            category, self.chain_id
        );

        while !self.stop.load(Ordering::Relaxed) {
            match self.run_once().await {
                Ok(CycleOutcome::Advanced { from, to, events }) => {
                    if events > 0 {
                        info!(
                            "Chain {} {}: processed {} events in blocks {}..{}",
                            self.chain_id, category, events, from, to
                        );
                    }
                    self.pacer.reset();
                }
                Ok(CycleOutcome::Idle) => {
                    self.pacer.reset();
                    sleep(self.poll_interval).await;
                }
                Err(IndexerError::RangeTooLarge(message)) => {
                    self.batch_size = (self.batch_size / 2).max(1);
                    warn!(
                        "Chain {} {}: log window too large, shrinking batch to {}: {}",
                        self.chain_id, category, self.batch_size, message
                    );
                }
                Err(IndexerError::NotFound(message)) => {
                    debug!(
                        "Chain {} {}: waiting for block availability: {}",
                        self.chain_id, category, message
                    );
                    sleep(self.poll_interval).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Chain {} {}: transient failure, backing off: {}",
                        self.chain_id, category, e
                    );
                    self.pacer.sleep().await;
                }
                Err(e) => {
                    error!(
                        "Chain {} {}: aborting ingestion loop: {}",
                        self.chain_id, category, e
                    );
                    return Err(e);
                }
            }
        }

        info!(
            "Stopped {} ingestion loop for chain {}",
            category, self.chain_id
        );
        Ok(())
    }
}

/// Bootstrap glue: validates config, opens the database, connects the chain
/// client through the registry, preloads the collection filter, and spawns
/// one ingestion loop per configured category.
pub struct Indexer {
    config: Config,
    database: Database,
    client: Arc<dyn ChainClient>,
    collection_filter: Arc<CollectionFilter>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<IndexerResult<()>>>,
}

impl Indexer {
    pub async fn new(config: Config) -> IndexerResult<Self> {
        config.validate().map_err(IndexerError::Config)?;

        let database = Database::new(config.database_path())?;

        let registry = ClientRegistry::with_request_timeout(config.request_timeout());
        let identity = ChainIdentity::new(
            config.chain_name.clone(),
            config.chain_id,
            config.rpc_url.clone(),
        );
        let client = registry.connect(&identity).await?;

        let collection_filter = Arc::new(CollectionFilter::new());
        let loaded = collection_filter.preload(&database)?;
        info!(
            "Indexer ready for chain {} ({} imported collections)",
            config.chain_name, loaded
        );

        Ok(Self {
            config,
            database,
            client,
            collection_filter,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }

    pub fn database(&self) -> Database {
        self.database.clone()
    }

    pub fn collection_filter(&self) -> Arc<CollectionFilter> {
        self.collection_filter.clone()
    }

    /// Spawns one ingestion loop per configured category, all recording raw
    /// events from the configured contracts.
    pub fn start(&mut self) -> IndexerResult<()> {
        if !self.handles.is_empty() {
            return Err(IndexerError::Config("Indexer already running".to_string()));
        }

        let addresses = parse_addresses(&self.config.contract_addresses)?;

        for category in &self.config.categories {
            let processor = Arc::new(RawEventRecorder::new(
                self.database.clone(),
                *category,
                addresses.clone(),
            ));
            let ingestion = IngestionLoop::new(
                self.config.chain_id,
                self.client.clone(),
                self.database.clone(),
                self.collection_filter.clone(),
                processor,
                &self.config,
                self.stop.clone(),
            );
            self.handles.push(tokio::spawn(ingestion.run()));
        }

        info!(
            "Spawned {} ingestion loops for chain {}",
            self.handles.len(),
            self.config.chain_name
        );
        Ok(())
    }

    /// Cooperative stop: loops observe the flag between iterations, so an
    /// in-flight network call finishes under its own timeout first.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Waits for every loop to finish, returning the first loop error.
    pub async fn join(&mut self) -> IndexerResult<()> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Ingestion loop terminated with error: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!("Ingestion loop task failed to join: {}", e);
                    if first_error.is_none() {
                        first_error = Some(IndexerError::Other(e.to_string()));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn parse_addresses(addresses: &[String]) -> IndexerResult<Vec<H160>> {
    addresses
        .iter()
        .map(|address| {
            address.parse::<H160>().map_err(|e| {
                IndexerError::Config(format!("Invalid contract address {}: {}", address, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockBody, Checkpoint};
    use ethers::types::{H160, H256};
    use tempfile::tempdir;

    struct ScriptedClient {
        identity: ChainIdentity,
        height: u64,
        events: Vec<LogEvent>,
        max_window: u64,
    }

    impl ScriptedClient {
        fn new(height: u64, events: Vec<LogEvent>) -> Self {
            Self {
                identity: ChainIdentity::new("testnet", 1, "http://localhost:8545"),
                height,
                events,
                max_window: u64::MAX,
            }
        }

        fn with_max_window(mut self, max_window: u64) -> Self {
            self.max_window = max_window;
            self
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedClient {
        async fn current_height(&self) -> IndexerResult<u64> {
            Ok(self.height)
        }

        async fn block_timestamp(&self, _block_number: u64) -> IndexerResult<u64> {
            Ok(0)
        }

        async fn filter_logs(&self, query: &LogFilterQuery) -> IndexerResult<Vec<LogEvent>> {
            query.validate()?;
            let (from, to) = match (query.from_block, query.to_block) {
                (crate::models::BlockRef::Number(from), crate::models::BlockRef::Number(to)) => {
                    (from, to)
                }
                _ => (0, self.height),
            };
            if to - from + 1 > self.max_window {
                return Err(IndexerError::RangeTooLarge(format!(
                    "window {}..{} exceeds {} blocks",
                    from, to, self.max_window
                )));
            }

            let mut events: Vec<LogEvent> = self
                .events
                .iter()
                .filter(|e| e.block_number >= from && e.block_number <= to && query.matches(e))
                .cloned()
                .collect();
            events.sort_by_key(|e| (e.block_number, e.log_index));
            Ok(events)
        }

        async fn call_contract(
            &self,
            _target: H160,
            _payload: &[u8],
            _at_block: Option<u64>,
        ) -> IndexerResult<Vec<u8>> {
            Err(IndexerError::Other("not scripted".to_string()))
        }

        async fn block_with_transactions(&self, block_number: u64) -> IndexerResult<BlockBody> {
            Err(IndexerError::NotFound(format!("block {}", block_number)))
        }

        fn identity(&self) -> &ChainIdentity {
            &self.identity
        }
    }

    fn log_event(address: H160, block_number: u64, log_index: u64) -> LogEvent {
        LogEvent {
            address,
            topics: vec![H256::repeat_byte(0x01)],
            data: vec![0xca, 0xfe],
            block_number,
            log_index,
            transaction_hash: H256::from_low_u64_be(block_number * 1000 + log_index),
            block_hash: H256::from_low_u64_be(block_number),
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::new(
            "testnet".to_string(),
            1,
            "http://localhost:8545".to_string(),
            dir.path().join("test.db").display().to_string(),
            vec!["0x1234567890123456789012345678901234567890".to_string()],
            vec![IndexCategory::EntityTransfer],
            100,
        );
        config.poll_interval_secs = 0;
        config
    }

    fn ingestion_loop(
        config: &Config,
        database: Database,
        client: Arc<dyn ChainClient>,
        collection_filter: Arc<CollectionFilter>,
        stop: Arc<AtomicBool>,
    ) -> IngestionLoop {
        let processor = Arc::new(RawEventRecorder::new(
            database.clone(),
            IndexCategory::EntityTransfer,
            Vec::new(),
        ));
        IngestionLoop::new(1, client, database, collection_filter, processor, config, stop)
    }

    #[tokio::test]
    async fn run_once_advances_checkpoint_and_stores_events() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let database = Database::new(dir.path().join("test.db")).unwrap();

        let collection = H160::repeat_byte(0x11);
        let client = Arc::new(ScriptedClient::new(
            120,
            vec![log_event(collection, 105, 0), log_event(collection, 110, 3)],
        ));

        let mut ingestion = ingestion_loop(
            &config,
            database.clone(),
            client,
            Arc::new(CollectionFilter::new()),
            Arc::new(AtomicBool::new(false)),
        );

        let outcome = ingestion.run_once().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Advanced {
                from: 100,
                to: 120,
                events: 2
            }
        );

        let checkpoint = database
            .get_indexed_status(1, IndexCategory::EntityTransfer)
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_block, 120);
        assert_eq!(database.event_count().unwrap(), 2);

        // Next cycle resumes past the checkpoint and finds nothing new.
        let outcome = ingestion.run_once().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn run_once_skips_already_imported_collections() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let database = Database::new(dir.path().join("test.db")).unwrap();

        let imported = H160::repeat_byte(0x22);
        let fresh = H160::repeat_byte(0x33);
        let client = Arc::new(ScriptedClient::new(
            110,
            vec![log_event(imported, 101, 0), log_event(fresh, 102, 0)],
        ));

        let collection_filter = Arc::new(CollectionFilter::new());
        collection_filter.add(&format!("{:#x}", imported));

        let mut ingestion = ingestion_loop(
            &config,
            database.clone(),
            client,
            collection_filter,
            Arc::new(AtomicBool::new(false)),
        );

        let outcome = ingestion.run_once().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Advanced {
                from: 100,
                to: 110,
                events: 1
            }
        );

        let events = database.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].contract_address, format!("{:#x}", fresh));
    }

    #[tokio::test]
    async fn idle_at_head_leaves_checkpoint_untouched() {
        let dir = tempdir().unwrap();
        let config = test_config(&dir);
        let database = Database::new(dir.path().join("test.db")).unwrap();
        database
            .advance_indexed_status(1, IndexCategory::EntityTransfer, 200, 7)
            .unwrap();

        let client = Arc::new(ScriptedClient::new(200, Vec::new()));
        let mut ingestion = ingestion_loop(
            &config,
            database.clone(),
            client,
            Arc::new(CollectionFilter::new()),
            Arc::new(AtomicBool::new(false)),
        );

        assert_eq!(ingestion.run_once().await.unwrap(), CycleOutcome::Idle);

        let checkpoint = database
            .get_indexed_status(1, IndexCategory::EntityTransfer)
            .unwrap()
            .unwrap();
        assert_eq!(
            checkpoint,
            Checkpoint {
                chain_id: 1,
                category: IndexCategory::EntityTransfer,
                last_block: 200,
                last_time: 7,
            }
        );
    }

    struct StopAfterProcess {
        inner: RawEventRecorder,
        stop: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EventProcessor for StopAfterProcess {
        fn category(&self) -> IndexCategory {
            self.inner.category()
        }

        fn query(&self, from_block: u64, to_block: u64) -> LogFilterQuery {
            self.inner.query(from_block, to_block)
        }

        async fn process(&self, chain_id: u64, events: &[LogEvent]) -> IndexerResult<()> {
            self.inner.process(chain_id, events).await?;
            self.stop.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn oversized_window_is_halved_until_the_node_accepts_it() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.batch_size = 8;
        let database = Database::new(dir.path().join("test.db")).unwrap();

        let collection = H160::repeat_byte(0x44);
        let client = Arc::new(
            ScriptedClient::new(200, vec![log_event(collection, 100, 0)]).with_max_window(2),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let processor = Arc::new(StopAfterProcess {
            inner: RawEventRecorder::new(
                database.clone(),
                IndexCategory::EntityTransfer,
                Vec::new(),
            ),
            stop: stop.clone(),
        });
        let ingestion = IngestionLoop::new(
            1,
            client,
            database.clone(),
            Arc::new(CollectionFilter::new()),
            processor,
            &config,
            stop,
        );

        ingestion.run().await.unwrap();

        // 8 -> 4 -> 2 before the node accepted the window 100..=101.
        let checkpoint = database
            .get_indexed_status(1, IndexCategory::EntityTransfer)
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_block, 101);
        assert_eq!(database.event_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn unsupported_chain_fails_bootstrap() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.chain_id = 424242;

        let err = Indexer::new(config).await.err().unwrap();
        match err {
            IndexerError::UnsupportedChain(id) => assert_eq!(id, 424242),
            other => panic!("Expected UnsupportedChain, got {:?}", other),
        }
    }
}
