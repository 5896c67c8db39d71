//! Error types for the ingestion pipeline.

use vantage_broker::BrokerError;

/// Errors that can occur in the ingestion pipeline.
///
/// Only `Serialization` and `BrokerUnavailable` ever reach producers; the
/// rest are handled inside the stream processors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {source}")]
    Serialization { source: serde_json::Error },

    /// The broker could not be reached or did not commit the operation.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker was reachable but rejected the operation.
    #[error("broker error: {0}")]
    Broker(String),

    /// A bulk insert failed. Part of the batch may already be applied.
    #[error("storage write failed for {table}: {message}")]
    StorageWrite {
        /// Target table.
        table: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// Database error outside the write path (pool setup, schema).
    #[error("database error: {0}")]
    Database(Box<sqlx::Error>),
}

impl From<BrokerError> for IngestError {
    fn from(err: BrokerError) -> Self {
        if err.is_unavailable() {
            Self::BrokerUnavailable(err.to_string())
        } else {
            Self::Broker(err.to_string())
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(Box::new(err))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}
