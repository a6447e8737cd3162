use std::time::Duration;

use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{IndexerError, IndexerResult};
use crate::models::RefreshEntry;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

/// Debounced insertion side of the metadata-refresh queue. Requests for the
/// same (chain, collection, token) triple are suppressed while an unexpired
/// guard marker exists; a separate worker drains the queue. The guard check
/// and the queue append are deliberately not atomic: a rare racing duplicate
/// inside the window is accepted.
pub struct RefreshQueue {
    database: Database,
    debounce: Duration,
}

impl RefreshQueue {
    pub fn new(database: Database) -> Self {
        Self::with_debounce(database, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(database: Database, debounce: Duration) -> Self {
        Self { database, debounce }
    }

    /// Queues one refresh request. Returns `Ok(true)` when the entry was
    /// appended and `Ok(false)` when a live guard suppressed it; suppression
    /// is the intended debounce outcome, not a failure.
    pub fn enqueue(
        &self,
        project: &str,
        chain_name: &str,
        chain_id: u64,
        collection_address: &str,
        token_id: &str,
    ) -> IndexerResult<bool> {
        let collection_address = collection_address.trim().to_ascii_lowercase();
        let guard_key = format!("{}:{}:{}", chain_id, collection_address, token_id);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let guarded = self
            .database
            .refresh_guard_live(&guard_key, now_ms)
            .map_err(persistence)?;
        if guarded {
            debug!("Refresh for {} suppressed within debounce window", guard_key);
            return Ok(false);
        }

        let entry = RefreshEntry {
            chain_id,
            collection_address,
            token_id: token_id.to_string(),
        };
        let payload = serde_json::to_string(&entry)
            .map_err(|e| IndexerError::Other(format!("Failed to serialize refresh entry: {}", e)))?;

        // Queue before guard: a queue failure must never leave a guard
        // standing without its entry.
        self.database
            .push_refresh_entry(project, chain_name, &payload, now_ms)
            .map_err(persistence)?;

        let expires_at = now_ms + self.debounce.as_millis() as i64;
        if let Err(e) = self.database.set_refresh_guard(&guard_key, expires_at) {
            // The entry is already queued; a missing guard only means the
            // next request inside the window gets through as well.
            warn!("Refresh guard not set for {}: {}", guard_key, e);
        }

        Ok(true)
    }

    pub fn len(&self, project: &str, chain_name: &str) -> IndexerResult<u64> {
        self.database
            .refresh_queue_len(project, chain_name)
            .map_err(persistence)
    }

    pub fn is_empty(&self, project: &str, chain_name: &str) -> IndexerResult<bool> {
        Ok(self.len(project, chain_name)? == 0)
    }
}

fn persistence(error: IndexerError) -> IndexerError {
    match error {
        IndexerError::Database(_) | IndexerError::ConnectionPool(_) => {
            IndexerError::PersistenceUnavailable(error.to_string())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_with_debounce(debounce: Duration) -> (tempfile::TempDir, RefreshQueue) {
        let dir = tempdir().unwrap();
        let database = Database::new(dir.path().join("test.db")).unwrap();
        (dir, RefreshQueue::with_debounce(database, debounce))
    }

    #[test]
    fn second_request_within_the_window_adds_nothing() {
        let (_dir, queue) = queue_with_debounce(Duration::from_secs(10));

        assert!(queue.enqueue("opensea", "ethereum", 1, "0xABC0", "7").unwrap());
        assert!(!queue.enqueue("opensea", "ethereum", 1, "0xabc0", "7").unwrap());

        assert_eq!(queue.len("opensea", "ethereum").unwrap(), 1);
    }

    #[test]
    fn requests_across_windows_both_land() {
        let (_dir, queue) = queue_with_debounce(Duration::from_millis(40));

        assert!(queue.enqueue("opensea", "ethereum", 1, "0xABC0", "7").unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert!(queue.enqueue("opensea", "ethereum", 1, "0xABC0", "7").unwrap());

        assert_eq!(queue.len("opensea", "ethereum").unwrap(), 2);
    }

    #[test]
    fn distinct_tokens_are_not_suppressed() {
        let (_dir, queue) = queue_with_debounce(Duration::from_secs(10));

        assert!(queue.enqueue("opensea", "ethereum", 1, "0xABC0", "7").unwrap());
        assert!(queue.enqueue("opensea", "ethereum", 1, "0xABC0", "8").unwrap());
        assert!(queue.enqueue("opensea", "ethereum", 137, "0xABC0", "7").unwrap());

        assert_eq!(queue.len("opensea", "ethereum").unwrap(), 3);
    }

    #[test]
    fn queued_entries_round_trip_as_json() {
        let (_dir, queue) = queue_with_debounce(Duration::from_secs(10));
        queue.enqueue("opensea", "ethereum", 1, "0xAbC0", "7").unwrap();

        let entries = queue
            .database
            .recent_refresh_entries("opensea", "ethereum", 10)
            .unwrap();
        assert_eq!(entries.len(), 1);

        let entry: RefreshEntry = serde_json::from_str(&entries[0]).unwrap();
        assert_eq!(
            entry,
            RefreshEntry {
                chain_id: 1,
                collection_address: "0xabc0".to_string(),
                token_id: "7".to_string(),
            }
        );
    }
}
