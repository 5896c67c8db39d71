//! Per-kind stream consumer and batch processor.
//!
//! Each cycle reads up to `batch_size` entries from the head of one kind's
//! stream, decodes them, writes the decoded records to storage, publishes
//! them to live subscribers, and finally deletes every consumed entry.
//! Entries are only deleted after a successful write, which gives
//! at-least-once delivery: a crash or write failure anywhere before the
//! delete leaves the entries in the stream to be read again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vantage_broker::{EntryId, StreamEntry};

use crate::config::ProcessorConfig;
use crate::fanout::Publisher;
use crate::metrics::MetricsRegistry;
use crate::queue::DurableQueue;
use crate::record::Record;
use crate::storage::BatchWriter;
use crate::IngestError;

/// Exponential read backoff.
///
/// Starts at `floor`, doubles after every consecutive failure, never
/// exceeds `cap`, and returns to `floor` on [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait now. The following call returns double, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Result of a single read cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The read timed out with nothing pending.
    Idle,
    /// A batch was written and acknowledged.
    Processed {
        /// Records persisted.
        written: usize,
        /// Undecodable entries deleted without being persisted.
        dropped: usize,
    },
    /// The stream could not be read.
    ReadFailed,
    /// Storage rejected the batch; nothing was deleted.
    WriteFailed,
    /// The batch was written but its entries could not be deleted.
    AckFailed,
}

/// Consumer for the stream of one record kind.
pub struct StreamProcessor<R: Record> {
    queue: DurableQueue,
    writer: Arc<dyn BatchWriter<R>>,
    publisher: Publisher,
    metrics: Arc<MetricsRegistry>,
    config: ProcessorConfig,
}

impl<R: Record> StreamProcessor<R> {
    pub fn new(
        queue: DurableQueue,
        writer: Arc<dyn BatchWriter<R>>,
        publisher: Publisher,
        metrics: Arc<MetricsRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            writer,
            publisher,
            metrics,
            config,
        }
    }

    /// Run one read cycle to completion.
    pub async fn process_once(&self) -> CycleOutcome {
        let read = self.read().await;
        self.handle(read).await
    }

    /// Process until `cancel` fires.
    ///
    /// Failed reads back off exponentially. A batch that storage rejected,
    /// or whose delete failed, is retried on the same doubling schedule so
    /// an outage does not spin the loop.
    ///
    /// Cancellation is observed between cycles, while blocked on an empty
    /// stream, and while backing off. Once a batch has been read, its
    /// write, publish, and delete always run to completion.
    pub async fn run(self, cancel: CancellationToken) {
        let kind = R::KIND;
        let mut read_backoff =
            Backoff::new(self.config.backoff_floor(), self.config.backoff_cap());
        // Paces re-reads of a batch that storage or the delete rejected.
        let mut retry_backoff = read_backoff.clone();

        tracing::info!(kind = %kind, batch_size = self.config.batch_size, "Stream processor started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                read = self.read() => read,
            };

            let outcome = self.handle(read).await;

            let delay = match outcome {
                CycleOutcome::Idle | CycleOutcome::Processed { .. } => {
                    read_backoff.reset();
                    retry_backoff.reset();
                    continue;
                }
                CycleOutcome::ReadFailed => {
                    let delay = read_backoff.next_delay();
                    tracing::warn!(
                        kind = %kind,
                        delay_ms = delay.as_millis(),
                        "Backing off after failed read"
                    );
                    delay
                }
                CycleOutcome::WriteFailed | CycleOutcome::AckFailed => {
                    read_backoff.reset();
                    let delay = retry_backoff.next_delay();
                    tracing::warn!(
                        kind = %kind,
                        delay_ms = delay.as_millis(),
                        "Backing off before retrying batch"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(kind = %kind, "Stream processor stopped");
    }

    async fn read(&self) -> Result<Vec<StreamEntry>, IngestError> {
        self.queue
            .read_pending(R::KIND, self.config.batch_size, self.config.block_timeout())
            .await
    }

    async fn handle(&self, read: Result<Vec<StreamEntry>, IngestError>) -> CycleOutcome {
        let kind = R::KIND;

        let mut entries = match read {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Failed to read stream");
                self.metrics.record_error(kind);
                return CycleOutcome::ReadFailed;
            }
        };

        if entries.is_empty() {
            return CycleOutcome::Idle;
        }
        entries.truncate(self.config.batch_size);

        let (records, ids) = decode_batch::<R>(entries);
        let dropped = ids.len() - records.len();

        if !records.is_empty() {
            if let Err(e) = self.writer.insert(&records).await {
                tracing::error!(
                    kind = %kind,
                    records = records.len(),
                    error = %e,
                    "Batch write failed, entries left for retry"
                );
                self.metrics.record_error(kind);
                return CycleOutcome::WriteFailed;
            }

            self.publish_all(&records).await;
        }

        if let Err(e) = self.queue.delete(kind, &ids).await {
            tracing::error!(
                kind = %kind,
                entries = ids.len(),
                error = %e,
                "Failed to delete processed entries, they will be read again"
            );
            self.metrics.record_error(kind);
            return CycleOutcome::AckFailed;
        }

        self.metrics
            .record_processed(kind, u64::try_from(records.len()).unwrap_or(u64::MAX));

        tracing::debug!(
            kind = %kind,
            written = records.len(),
            dropped = dropped,
            "Batch processed"
        );

        CycleOutcome::Processed {
            written: records.len(),
            dropped,
        }
    }

    async fn publish_all(&self, records: &[R]) {
        for record in records {
            if let Err(e) = self.publisher.publish(record).await {
                tracing::debug!(
                    kind = %R::KIND,
                    record_id = %record.id(),
                    error = %e,
                    "Fan-out publish failed"
                );
            }
        }
    }
}

/// Decode entries, keeping every id for deletion.
///
/// Entries that fail to decode are logged and left out of the records
/// but their ids are still returned, so they are deleted with the batch.
fn decode_batch<R: Record>(entries: Vec<StreamEntry>) -> (Vec<R>, Vec<EntryId>) {
    let mut records = Vec::with_capacity(entries.len());
    let mut ids = Vec::with_capacity(entries.len());

    for entry in entries {
        match serde_json::from_slice::<R>(&entry.payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    kind = %R::KIND,
                    entry_id = %entry.id,
                    error = %e,
                    "Dropping undecodable entry"
                );
            }
        }
        ids.push(entry.id);
    }

    (records, ids)
}

impl<R: Record> std::fmt::Debug for StreamProcessor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("kind", &R::KIND)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AppLog, LogLevel, RecordKind};
    use crate::storage::MemoryWriter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vantage_broker::{MemoryFanout, MemoryStream, StreamBackend};

    struct Harness {
        stream: Arc<MemoryStream>,
        queue: DurableQueue,
        storage: Arc<MemoryWriter>,
        metrics: Arc<MetricsRegistry>,
        publisher: Publisher,
    }

    impl Harness {
        fn new() -> Self {
            let stream = Arc::new(MemoryStream::new());
            Self {
                queue: DurableQueue::new(stream.clone(), "test"),
                stream,
                storage: Arc::new(MemoryWriter::new()),
                metrics: Arc::new(MetricsRegistry::new()),
                publisher: Publisher::new(Arc::new(MemoryFanout::new())),
            }
        }

        fn processor(&self, writer: Arc<dyn BatchWriter<AppLog>>) -> StreamProcessor<AppLog> {
            let config = ProcessorConfig {
                block_timeout_ms: 10,
                ..ProcessorConfig::default()
            };
            StreamProcessor::new(
                self.queue.clone(),
                writer,
                self.publisher.clone(),
                self.metrics.clone(),
                config,
            )
        }

        async fn enqueue(&self, count: usize) {
            for i in 0..count {
                let log = AppLog::new("p1", LogLevel::Info, format!("line {i}"));
                self.queue.enqueue(&log).await.unwrap();
            }
        }
    }

    struct FailingWriter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchWriter<AppLog> for FailingWriter {
        async fn insert(&self, _: &[AppLog]) -> Result<(), IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::StorageWrite {
                table: "app_logs",
                message: "connection reset".to_owned(),
            })
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn backoff_reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_stream_is_idle() {
        let harness = Harness::new();
        let processor = harness.processor(harness.storage.clone());

        assert_eq!(processor.process_once().await, CycleOutcome::Idle);
        assert_eq!(harness.metrics.get(RecordKind::AppLog).error_count, 0);
    }

    #[tokio::test]
    async fn processes_and_acknowledges_batch() {
        let harness = Harness::new();
        harness.enqueue(5).await;
        let processor = harness.processor(harness.storage.clone());

        let outcome = processor.process_once().await;

        assert_eq!(
            outcome,
            CycleOutcome::Processed {
                written: 5,
                dropped: 0
            }
        );
        assert_eq!(harness.storage.count(RecordKind::AppLog), 5);
        assert_eq!(harness.stream.len("test:app").await.unwrap(), 0);

        let metrics = harness.metrics.get(RecordKind::AppLog);
        assert_eq!(metrics.processed_count, 5);
        assert!(metrics.last_process_time.is_some());
    }

    #[tokio::test]
    async fn write_failure_leaves_entries_pending() {
        let harness = Harness::new();
        harness.enqueue(3).await;
        let writer = Arc::new(FailingWriter {
            calls: AtomicUsize::new(0),
        });
        let processor = harness.processor(writer.clone());

        assert_eq!(processor.process_once().await, CycleOutcome::WriteFailed);
        assert_eq!(processor.process_once().await, CycleOutcome::WriteFailed);

        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.stream.len("test:app").await.unwrap(), 3);

        let metrics = harness.metrics.get(RecordKind::AppLog);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.processed_count, 0);
        assert!(metrics.last_process_time.is_none());
    }

    #[tokio::test]
    async fn batch_without_valid_records_skips_writer() {
        let harness = Harness::new();
        harness.stream.append("test:app", b"{}").await.unwrap();
        let writer = Arc::new(FailingWriter {
            calls: AtomicUsize::new(0),
        });
        let processor = harness.processor(writer.clone());

        assert_eq!(
            processor.process_once().await,
            CycleOutcome::Processed {
                written: 0,
                dropped: 1
            }
        );
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.stream.len("test:app").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let harness = Harness::new();
        let processor = harness.processor(harness.storage.clone());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(processor.run(cancel.clone()));
        harness.enqueue(2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(harness.storage.count(RecordKind::AppLog), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_outage_retries_on_backoff_schedule() {
        let harness = Harness::new();
        harness.enqueue(1).await;
        let writer = Arc::new(FailingWriter {
            calls: AtomicUsize::new(0),
        });
        let processor = harness.processor(writer.clone());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(processor.run(cancel.clone()));
        // Attempts at 0s, 1s, 3s and 7s; the next is due at 15s
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        task.await.unwrap();

        let calls = writer.calls.load(Ordering::SeqCst);
        assert!((2..=5).contains(&calls), "{calls} write attempts in 10s");
        assert_eq!(
            harness.metrics.get(RecordKind::AppLog).error_count,
            calls as u64
        );
        assert_eq!(harness.stream.len("test:app").await.unwrap(), 1);
    }
}
