use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported chain id: {0}")]
    UnsupportedChain(u64),

    #[error("Upstream node unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid block range: from {from} > to {to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("Block range too large: {0}")]
    RangeTooLarge(String),

    #[error("Execution reverted: {0}")]
    ExecutionReverted(String),

    #[error("Checkpoint regression rejected: stored {stored}, attempted {attempted}")]
    RegressionRejected { stored: u64, attempted: u64 },

    #[error("Filter source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(#[from] r2d2::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl IndexerError {
    /// Transient failures a polling loop should pace and retry. Everything
    /// else needs the caller to change the request or is a logic bug.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::UpstreamUnavailable(_)
                | IndexerError::SourceUnavailable(_)
                | IndexerError::PersistenceUnavailable(_)
                | IndexerError::Database(_)
                | IndexerError::ConnectionPool(_)
        )
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
