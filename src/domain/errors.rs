use thiserror::Error;

/// Errors raised while decoding or aggregating the market data feed
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Unsupported timeframe: {label}")]
    UnsupportedTimeframe { label: String },

    #[error("Malformed tick payload: {reason}")]
    MalformedTick { reason: String },
}

/// Errors raised by the broker proxy client
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Broker unreachable: {reason}")]
    Unreachable { reason: String },
}

/// Errors related to persisted state that callers must uphold
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database pool not initialized")]
    PoolNotInitialized,

    #[error("Upsert failed for {table}: {reason}")]
    UpsertFailed { table: String, reason: String },
}
