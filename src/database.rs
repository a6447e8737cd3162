use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use r2d2_sqlite::SqliteConnectionManager;
use r2d2::Pool;
use tracing::{info, warn};
use std::path::Path;
use std::time::Duration;

use crate::error::{IndexerError, IndexerResult};
use crate::models::{Checkpoint, EventRecord, IndexCategory};

#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> IndexerResult<Self> {
        info!("Opening database at {:?}", path.as_ref());

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(16)
            .min_idle(Some(2))
            .max_lifetime(Some(Duration::from_secs(600)))
            .idle_timeout(Some(Duration::from_secs(120)))
            .build(manager)?;

        let conn = pool.get()?;
        Self::initialize_database(&conn)?;

        info!("Database initialization completed");
        Ok(Self { pool })
    }

    fn initialize_database(conn: &Connection) -> IndexerResult<()> {
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if journal_mode != "wal" {
            warn!("Failed to enable WAL mode, got: {}", journal_mode);
        }
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA temp_store = MEMORY", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS indexed_status (
                chain_id INTEGER NOT NULL,
                category TEXT NOT NULL,
                last_block INTEGER NOT NULL,
                last_time INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain_id, category)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS collections (
                address TEXT PRIMARY KEY,
                chain_id INTEGER NOT NULL,
                floor_price_status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS refresh_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                chain TEXT NOT NULL,
                entry TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_refresh_queue_key ON refresh_queue(project, chain)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS refresh_guards (
                guard_key TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS market_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id INTEGER NOT NULL,
                category TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                log_index INTEGER NOT NULL,
                transaction_hash TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                topic0 TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(chain_id, transaction_hash, log_index)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_market_events_block ON market_events(chain_id, block_number)",
            [],
        )?;

        Ok(())
    }

    pub fn get_indexed_status(
        &self,
        chain_id: u64,
        category: IndexCategory,
    ) -> IndexerResult<Option<Checkpoint>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT last_block, last_time FROM indexed_status
                 WHERE chain_id = ? AND category = ?",
                params![chain_id, category.as_str()],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(last_block, last_time)| Checkpoint {
            chain_id,
            category,
            last_block,
            last_time,
        }))
    }

    /// Upserts the checkpoint for one (chain, category) pair. A new block
    /// number strictly below the stored one is rejected; rewinds go through
    /// `override_indexed_status`. Runs in an immediate transaction so
    /// concurrent writers to the same row serialize.
    pub fn advance_indexed_status(
        &self,
        chain_id: u64,
        category: IndexCategory,
        new_block: u64,
        new_time: i64,
    ) -> IndexerResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Option<u64> = tx
            .query_row(
                "SELECT last_block FROM indexed_status WHERE chain_id = ? AND category = ?",
                params![chain_id, category.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(stored) = stored {
            if new_block < stored {
                return Err(IndexerError::RegressionRejected {
                    stored,
                    attempted: new_block,
                });
            }
        }

        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "INSERT INTO indexed_status (chain_id, category, last_block, last_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(chain_id, category) DO UPDATE SET
                 last_block = excluded.last_block,
                 last_time = excluded.last_time,
                 updated_at = excluded.updated_at",
            params![chain_id, category.as_str(), new_block, new_time, now, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Unconditionally moves the checkpoint, backward or forward. Reserved
    /// for reorg recovery.
    pub fn override_indexed_status(
        &self,
        chain_id: u64,
        category: IndexCategory,
        new_block: u64,
        new_time: i64,
    ) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO indexed_status (chain_id, category, last_block, last_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(chain_id, category) DO UPDATE SET
                 last_block = excluded.last_block,
                 last_time = excluded.last_time,
                 updated_at = excluded.updated_at",
            params![chain_id, category.as_str(), new_block, new_time, now, now],
        )?;
        warn!(
            "Checkpoint override for chain {} category {}: now at block {}",
            chain_id, category, new_block
        );
        Ok(())
    }

    pub fn checkpoints(&self) -> IndexerResult<Vec<Checkpoint>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT chain_id, category, last_block, last_time FROM indexed_status
             ORDER BY chain_id, category",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (chain_id, category, last_block, last_time) = row?;
            let category = category
                .parse::<IndexCategory>()
                .map_err(|e| IndexerError::Other(e.to_string()))?;
            checkpoints.push(Checkpoint {
                chain_id,
                category,
                last_block,
                last_time,
            });
        }
        Ok(checkpoints)
    }

    pub fn upsert_collection(
        &self,
        address: &str,
        chain_id: u64,
        floor_price_status: &str,
    ) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO collections (address, chain_id, floor_price_status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                 floor_price_status = excluded.floor_price_status,
                 updated_at = excluded.updated_at",
            params![address.to_ascii_lowercase(), chain_id, floor_price_status, now, now],
        )?;
        Ok(())
    }

    pub fn imported_collection_addresses(&self) -> IndexerResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT address FROM collections WHERE floor_price_status = 'imported'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }

    pub fn collection_count(&self) -> IndexerResult<u64> {
        let conn = self.pool.get()?;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))?;
        Ok(count)
    }

    /// True while an unexpired guard row exists. Expired rows are simply
    /// ignored; they are overwritten on the next guard set.
    pub fn refresh_guard_live(&self, guard_key: &str, now_ms: i64) -> IndexerResult<bool> {
        let conn = self.pool.get()?;
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM refresh_guards WHERE guard_key = ?",
                params![guard_key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(matches!(expires_at, Some(expiry) if expiry > now_ms))
    }

    pub fn set_refresh_guard(&self, guard_key: &str, expires_at_ms: i64) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO refresh_guards (guard_key, expires_at) VALUES (?, ?)
             ON CONFLICT(guard_key) DO UPDATE SET expires_at = excluded.expires_at",
            params![guard_key, expires_at_ms],
        )?;
        Ok(())
    }

    pub fn push_refresh_entry(
        &self,
        project: &str,
        chain: &str,
        entry: &str,
        enqueued_at_ms: i64,
    ) -> IndexerResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO refresh_queue (project, chain, entry, enqueued_at) VALUES (?, ?, ?, ?)",
            params![project, chain, entry, enqueued_at_ms],
        )?;
        Ok(())
    }

    pub fn refresh_queue_len(&self, project: &str, chain: &str) -> IndexerResult<u64> {
        let conn = self.pool.get()?;
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM refresh_queue WHERE project = ? AND chain = ?",
            params![project, chain],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn recent_refresh_entries(
        &self,
        project: &str,
        chain: &str,
        limit: usize,
    ) -> IndexerResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT entry FROM refresh_queue WHERE project = ? AND chain = ?
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![project, chain, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Batch insert of ingested events inside one transaction. Replayed rows
    /// hit the uniqueness constraint and are ignored.
    pub fn store_events_batch(&self, events: &[EventRecord]) -> IndexerResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO market_events
                 (chain_id, category, block_number, log_index, transaction_hash,
                  contract_address, topic0, payload, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.chain_id,
                    event.category,
                    event.block_number,
                    event.log_index,
                    event.transaction_hash,
                    event.contract_address,
                    event.topic0,
                    event.payload,
                    event.created_at,
                ])?;
            }
        }
        tx.commit()?;

        info!("Stored batch of {} events", events.len());
        Ok(())
    }

    pub fn event_count(&self) -> IndexerResult<u64> {
        let conn = self.pool.get()?;
        let count: u64 =
            conn.query_row("SELECT COUNT(*) FROM market_events", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn recent_events(&self, limit: usize) -> IndexerResult<Vec<EventRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, chain_id, category, block_number, log_index, transaction_hash,
                    contract_address, topic0, payload, created_at
             FROM market_events ORDER BY block_number DESC, log_index DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                chain_id: row.get(1)?,
                category: row.get(2)?,
                block_number: row.get(3)?,
                log_index: row.get(4)?,
                transaction_hash: row.get(5)?,
                contract_address: row.get(6)?,
                topic0: row.get(7)?,
                payload: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_database() -> (tempfile::TempDir, Database) {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn advance_rejects_regression_and_keeps_stored_value() {
        let (_dir, db) = open_database();
        let category = IndexCategory::EntityTransfer;

        assert!(db.get_indexed_status(1, category).unwrap().is_none());

        db.advance_indexed_status(1, category, 1000, 111).unwrap();
        let checkpoint = db.get_indexed_status(1, category).unwrap().unwrap();
        assert_eq!(checkpoint.last_block, 1000);
        assert_eq!(checkpoint.last_time, 111);

        let err = db.advance_indexed_status(1, category, 999, 222).unwrap_err();
        match err {
            IndexerError::RegressionRejected { stored, attempted } => {
                assert_eq!(stored, 1000);
                assert_eq!(attempted, 999);
            }
            other => panic!("Expected RegressionRejected, got {:?}", other),
        }

        let checkpoint = db.get_indexed_status(1, category).unwrap().unwrap();
        assert_eq!(checkpoint.last_block, 1000);
        assert_eq!(checkpoint.last_time, 111);
    }

    #[test]
    fn advance_accepts_equal_block_and_monotonic_growth() {
        let (_dir, db) = open_database();
        let category = IndexCategory::MultiMarketSale;

        db.advance_indexed_status(137, category, 500, 1).unwrap();
        db.advance_indexed_status(137, category, 500, 2).unwrap();
        db.advance_indexed_status(137, category, 730, 3).unwrap();

        let checkpoint = db.get_indexed_status(137, category).unwrap().unwrap();
        assert_eq!(checkpoint.last_block, 730);
        assert_eq!(checkpoint.last_time, 3);
    }

    #[test]
    fn checkpoints_are_independent_per_chain_and_category() {
        let (_dir, db) = open_database();

        db.advance_indexed_status(1, IndexCategory::EntityTransfer, 100, 1)
            .unwrap();
        db.advance_indexed_status(1, IndexCategory::FloorPrice, 200, 2)
            .unwrap();
        db.advance_indexed_status(137, IndexCategory::EntityTransfer, 300, 3)
            .unwrap();

        assert_eq!(
            db.get_indexed_status(1, IndexCategory::EntityTransfer)
                .unwrap()
                .unwrap()
                .last_block,
            100
        );
        assert_eq!(
            db.get_indexed_status(1, IndexCategory::FloorPrice)
                .unwrap()
                .unwrap()
                .last_block,
            200
        );
        assert_eq!(db.checkpoints().unwrap().len(), 3);
    }

    #[test]
    fn override_moves_checkpoint_backward() {
        let (_dir, db) = open_database();
        let category = IndexCategory::HubContractEvent;

        db.advance_indexed_status(1, category, 5000, 1).unwrap();
        db.override_indexed_status(1, category, 4200, 2).unwrap();

        let checkpoint = db.get_indexed_status(1, category).unwrap().unwrap();
        assert_eq!(checkpoint.last_block, 4200);

        db.advance_indexed_status(1, category, 4300, 3).unwrap();
        assert_eq!(
            db.get_indexed_status(1, category).unwrap().unwrap().last_block,
            4300
        );
    }

    #[test]
    fn imported_collections_query_filters_by_status() {
        let (_dir, db) = open_database();

        db.upsert_collection("0xAAAA000000000000000000000000000000000001", 1, "imported")
            .unwrap();
        db.upsert_collection("0xAAAA000000000000000000000000000000000002", 1, "pending")
            .unwrap();
        db.upsert_collection("0xAAAA000000000000000000000000000000000003", 1, "imported")
            .unwrap();

        let mut imported = db.imported_collection_addresses().unwrap();
        imported.sort();
        assert_eq!(
            imported,
            vec![
                "0xaaaa000000000000000000000000000000000001".to_string(),
                "0xaaaa000000000000000000000000000000000003".to_string(),
            ]
        );
        assert_eq!(db.collection_count().unwrap(), 3);
    }

    #[test]
    fn guard_expiry_is_checked_against_the_clock() {
        let (_dir, db) = open_database();

        db.set_refresh_guard("1:0xabc:42", 10_000).unwrap();
        assert!(db.refresh_guard_live("1:0xabc:42", 9_999).unwrap());
        assert!(!db.refresh_guard_live("1:0xabc:42", 10_000).unwrap());
        assert!(!db.refresh_guard_live("1:0xdef:42", 0).unwrap());
    }

    #[test]
    fn event_batch_insert_is_idempotent() {
        let (_dir, db) = open_database();

        let record = EventRecord {
            id: 0,
            chain_id: 1,
            category: "entity-transfer".to_string(),
            block_number: 10,
            log_index: 2,
            transaction_hash: "0x01".to_string(),
            contract_address: "0x02".to_string(),
            topic0: "0x03".to_string(),
            payload: "0x".to_string(),
            created_at: 0,
        };

        db.store_events_batch(&[record.clone()]).unwrap();
        db.store_events_batch(&[record]).unwrap();
        assert_eq!(db.event_count().unwrap(), 1);
    }
}
