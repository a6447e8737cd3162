use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::database::Database;
use crate::error::{IndexerError, IndexerResult};

/// Shared membership set of already-imported collection addresses. One
/// instance is constructed at startup and handed by `Arc` to every ingestion
/// loop and request handler. Reads run concurrently; a write excludes
/// everything for its duration.
///
/// All stored keys are lower-case and every operation folds its input the
/// same way, so letter case never affects lookups.
pub struct CollectionFilter {
    inner: RwLock<HashSet<String>>,
}

fn normalize(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl CollectionFilter {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashSet::new()),
        }
    }

    fn read_set(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_set(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// One-shot bulk population from collections whose floor-price import
    /// already completed. The source rows are fully materialized before the
    /// set is touched, so a failed query leaves the filter unchanged.
    pub fn preload(&self, database: &Database) -> IndexerResult<usize> {
        let addresses = database
            .imported_collection_addresses()
            .map_err(|e| IndexerError::SourceUnavailable(e.to_string()))?;

        let mut set = self.write_set();
        for address in &addresses {
            set.insert(normalize(address));
        }

        info!("Preloaded {} imported collections", addresses.len());
        Ok(addresses.len())
    }

    pub fn add(&self, address: &str) {
        self.write_set().insert(normalize(address));
    }

    pub fn remove(&self, address: &str) {
        self.write_set().remove(&normalize(address));
    }

    pub fn contains(&self, address: &str) -> bool {
        self.read_set().contains(&normalize(address))
    }

    pub fn len(&self) -> usize {
        self.read_set().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_set().is_empty()
    }
}

impl Default for CollectionFilter {
    fn default() -> Self {
        Self::new()
    }
}
