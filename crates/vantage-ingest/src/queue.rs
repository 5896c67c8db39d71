//! Producer side of the durable queue.
//!
//! Each record kind has its own stream, named `{prefix}:{kind}`. Enqueue
//! returns only after the broker has committed the append, so a successful
//! call means the record will eventually reach storage.

use std::sync::Arc;
use std::time::Duration;

use vantage_broker::{EntryId, StreamBackend, StreamEntry};

use crate::record::{AppLog, Event, Metric, Record, RecordKind, RequestLog};
use crate::IngestError;

/// Durable, per-kind append-only queue over a [`StreamBackend`].
#[derive(Clone)]
pub struct DurableQueue {
    backend: Arc<dyn StreamBackend>,
    prefix: String,
}

impl DurableQueue {
    pub fn new(backend: Arc<dyn StreamBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Stream name for a record kind.
    pub fn stream_name(&self, kind: RecordKind) -> String {
        format!("{}:{}", self.prefix, kind)
    }

    /// Serialize `record` and append it to its kind's stream.
    ///
    /// # Errors
    ///
    /// `Serialization` if the record cannot be encoded, `BrokerUnavailable`
    /// if the broker could not commit the append.
    pub async fn enqueue<R: Record>(&self, record: &R) -> Result<EntryId, IngestError> {
        let payload = serde_json::to_vec(record)?;
        let stream = self.stream_name(R::KIND);

        let id = self
            .backend
            .append(&stream, &payload)
            .await
            .map_err(|e| {
                tracing::warn!(
                    kind = %R::KIND,
                    record_id = %record.id(),
                    error = %e,
                    "Enqueue failed"
                );
                // Anything short of a committed append is reported to the
                // producer as unavailability.
                IngestError::BrokerUnavailable(e.to_string())
            })?;

        tracing::trace!(kind = %R::KIND, entry_id = %id, "Record enqueued");
        Ok(id)
    }

    pub async fn enqueue_event(&self, event: &Event) -> Result<EntryId, IngestError> {
        self.enqueue(event).await
    }

    pub async fn enqueue_app_log(&self, log: &AppLog) -> Result<EntryId, IngestError> {
        self.enqueue(log).await
    }

    pub async fn enqueue_request_log(&self, log: &RequestLog) -> Result<EntryId, IngestError> {
        self.enqueue(log).await
    }

    pub async fn enqueue_metric(&self, metric: &Metric) -> Result<EntryId, IngestError> {
        self.enqueue(metric).await
    }

    /// Up to `max_count` entries from the head of `kind`'s stream.
    ///
    /// Entries stay in the stream until [`delete`](Self::delete) is called,
    /// so repeated reads return the same entries.
    pub async fn read_pending(
        &self,
        kind: RecordKind,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, IngestError> {
        let stream = self.stream_name(kind);
        Ok(self.backend.read_pending(&stream, max_count, block).await?)
    }

    /// Remove acknowledged entries. Ids already gone are ignored.
    pub async fn delete(&self, kind: RecordKind, ids: &[EntryId]) -> Result<usize, IngestError> {
        let stream = self.stream_name(kind);
        Ok(self.backend.delete(&stream, ids).await?)
    }

    /// Number of entries waiting in `kind`'s stream.
    pub async fn depth(&self, kind: RecordKind) -> Result<usize, IngestError> {
        let stream = self.stream_name(kind);
        Ok(self.backend.len(&stream).await?)
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
