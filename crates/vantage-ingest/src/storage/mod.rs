//! Bulk persistence of record batches into the time-series store.

mod memory;
mod postgres;

pub use memory::MemoryWriter;
pub use postgres::{PgInsert, PostgresWriter};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::record::{AppLog, Event, Metric, Record, RecordKind, RequestLog};
use crate::IngestError;

/// Writes a batch of records of one kind to storage.
///
/// Each call submits the whole batch, one row per record, and waits for
/// it to finish. The first failure aborts the call with
/// [`IngestError::StorageWrite`]. Rows applied before the failure are not
/// rolled back, so a failed call may have partially landed and callers
/// must tolerate inserting the same records again.
#[async_trait]
pub trait BatchWriter<R: Record>: Send + Sync {
    async fn insert(&self, records: &[R]) -> Result<(), IngestError>;
}

/// A writer able to persist every record kind.
pub trait StorageWriter:
    BatchWriter<Event> + BatchWriter<AppLog> + BatchWriter<RequestLog> + BatchWriter<Metric> + 'static
{
}

impl<T> StorageWriter for T where
    T: BatchWriter<Event>
        + BatchWriter<AppLog>
        + BatchWriter<RequestLog>
        + BatchWriter<Metric>
        + 'static
{
}

/// Table holding records of `kind`.
pub const fn table_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Event => "events",
        RecordKind::AppLog => "app_logs",
        RecordKind::RequestLog => "request_logs",
        RecordKind::Metric => "metrics",
    }
}

/// Storage backend selected by configuration.
#[derive(Debug, Clone)]
pub enum Storage {
    Memory(Arc<MemoryWriter>),
    Postgres(Arc<PostgresWriter>),
}

impl Storage {
    /// Build the configured backend. Postgres tables are created if missing.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, IngestError> {
        match config {
            StorageConfig::Memory => {
                tracing::info!("Using in-memory storage");
                Ok(Self::Memory(Arc::new(MemoryWriter::new())))
            }
            StorageConfig::Postgres {
                url,
                max_connections,
            } => {
                let writer = PostgresWriter::connect(url, *max_connections).await?;
                writer.ensure_schema().await?;
                tracing::info!(max_connections = max_connections, "Using Postgres storage");
                Ok(Self::Postgres(Arc::new(writer)))
            }
        }
    }
}

#[async_trait]
impl<R: PgInsert> BatchWriter<R> for Storage {
    async fn insert(&self, records: &[R]) -> Result<(), IngestError> {
        match self {
            Self::Memory(writer) => writer.insert(records).await,
            Self::Postgres(writer) => writer.insert(records).await,
        }
    }
}
