use std::time::Duration;

use thiserror::Error;

// Failures talking to the key-value store. Always fatal for the operation in flight.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Key {key} holds the wrong kind of value")]
    WrongType { key: String },

    #[error("Malformed value {value:?} in {key}/{field}")]
    Malformed {
        key: String,
        field: String,
        value: String,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("WRONGTYPE") {
            return StoreError::WrongType {
                key: err.detail().unwrap_or_default().to_string(),
            };
        }
        StoreError::Unavailable(err.to_string())
    }
}

// The system-of-record could not answer.
#[derive(Error, Debug)]
#[error("System-of-record query failed: {0}")]
pub struct SourceError(pub String);

impl From<tokio_postgres::Error> for SourceError {
    fn from(err: tokio_postgres::Error) -> Self {
        SourceError(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for SourceError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        SourceError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    // A caller broke the contract, e.g. editing a value on an uncounted entity.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Rebuild did not complete: {0}")]
    Source(#[from] SourceError),

    #[error("Cache worker stopped")]
    WorkerStopped,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Value {value} outside {min}..={max}")]
    InvalidValue { value: i16, min: i16, max: i16 },

    #[error("Rate limiter failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Ledger failed: {0}")]
    Ledger(#[from] SourceError),
}
