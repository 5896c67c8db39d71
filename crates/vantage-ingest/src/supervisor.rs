//! Supervision of the four per-kind stream processors.
//!
//! Every kind gets its own supervised task. The processor itself runs in a
//! child task so that a panic is contained by the task boundary: the
//! supervisor sees it as a `JoinError`, logs it, waits the restart delay,
//! and starts a fresh processor. Other kinds keep running throughout.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::fanout::Publisher;
use crate::metrics::{KindMetrics, MetricsRegistry};
use crate::processor::StreamProcessor;
use crate::queue::DurableQueue;
use crate::record::{AppLog, Event, Metric, Record, RecordKind, RequestLog};
use crate::storage::{BatchWriter, StorageWriter};

/// Starts and restarts one processor per record kind.
pub struct ProcessorSupervisor<W> {
    queue: DurableQueue,
    writer: Arc<W>,
    publisher: Publisher,
    metrics: Arc<MetricsRegistry>,
    config: ProcessorConfig,
}

impl<W: StorageWriter> ProcessorSupervisor<W> {
    pub fn new(
        queue: DurableQueue,
        writer: Arc<W>,
        publisher: Publisher,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            writer,
            publisher,
            metrics: Arc::new(MetricsRegistry::new()),
            config,
        }
    }

    /// Shared registry the processors report into.
    pub fn registry(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// Point-in-time counters for every kind.
    pub fn metrics(&self) -> BTreeMap<RecordKind, KindMetrics> {
        self.metrics.snapshot()
    }

    /// Launch the four supervised processors.
    ///
    /// They stop when `cancel` fires or [`SupervisorHandle::shutdown`] is
    /// called.
    pub fn start(&self, cancel: CancellationToken) -> SupervisorHandle {
        let tasks = vec![
            self.spawn_supervised::<Event>(cancel.clone()),
            self.spawn_supervised::<AppLog>(cancel.clone()),
            self.spawn_supervised::<RequestLog>(cancel.clone()),
            self.spawn_supervised::<Metric>(cancel.clone()),
        ];

        tracing::info!(kinds = tasks.len(), "Processor supervisor started");

        SupervisorHandle {
            cancel,
            tasks,
            metrics: self.metrics.clone(),
        }
    }

    fn spawn_supervised<R: Record>(&self, cancel: CancellationToken) -> JoinHandle<()>
    where
        W: BatchWriter<R>,
    {
        let writer: Arc<dyn BatchWriter<R>> = self.writer.clone();
        let factory = ProcessorFactory {
            queue: self.queue.clone(),
            writer,
            publisher: self.publisher.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        };

        tokio::spawn(supervise(factory, cancel))
    }
}

/// Everything needed to build a fresh processor after a crash.
struct ProcessorFactory<R: Record> {
    queue: DurableQueue,
    writer: Arc<dyn BatchWriter<R>>,
    publisher: Publisher,
    metrics: Arc<MetricsRegistry>,
    config: ProcessorConfig,
}

impl<R: Record> ProcessorFactory<R> {
    fn build(&self) -> StreamProcessor<R> {
        StreamProcessor::new(
            self.queue.clone(),
            self.writer.clone(),
            self.publisher.clone(),
            self.metrics.clone(),
            self.config.clone(),
        )
    }
}

async fn supervise<R: Record>(factory: ProcessorFactory<R>, cancel: CancellationToken) {
    let kind = R::KIND;
    let restart_delay = factory.config.restart_delay();
    let mut restarts: u64 = 0;

    loop {
        let processor = factory.build();
        let child = tokio::spawn(processor.run(cancel.clone()));

        match child.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                restarts += 1;
                tracing::error!(
                    kind = %kind,
                    restarts = restarts,
                    restart_delay_ms = restart_delay.as_millis(),
                    "Stream processor panicked, restarting"
                );
            }
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Stream processor task aborted");
                break;
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(restart_delay) => {}
        }
    }

    tracing::debug!(kind = %kind, "Supervisor task finished");
}

/// Control over running processors.
pub struct SupervisorHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<MetricsRegistry>,
}

impl SupervisorHandle {
    /// Point-in-time counters for every kind.
    pub fn metrics(&self) -> BTreeMap<RecordKind, KindMetrics> {
        self.metrics.snapshot()
    }

    /// Cancel every processor and wait for all of them to stop.
    ///
    /// A processor in the middle of a batch finishes that batch first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
        tracing::info!("Processor supervisor stopped");
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use crate::storage::MemoryWriter;
    use std::time::Duration;
    use vantage_broker::{MemoryFanout, MemoryStream};

    fn supervisor() -> (ProcessorSupervisor<MemoryWriter>, DurableQueue, Arc<MemoryWriter>) {
        let queue = DurableQueue::new(Arc::new(MemoryStream::new()), "test");
        let storage = Arc::new(MemoryWriter::new());
        let config = ProcessorConfig {
            block_timeout_ms: 50,
            ..ProcessorConfig::default()
        };
        let supervisor = ProcessorSupervisor::new(
            queue.clone(),
            storage.clone(),
            Publisher::new(Arc::new(MemoryFanout::new())),
            config,
        );
        (supervisor, queue, storage)
    }

    #[tokio::test(start_paused = true)]
    async fn processes_every_kind() {
        let (supervisor, queue, storage) = supervisor();
        let handle = supervisor.start(CancellationToken::new());

        queue.enqueue_event(&Event::new("p1", "signup")).await.unwrap();
        queue
            .enqueue_app_log(&AppLog::new("p1", LogLevel::Info, "hello"))
            .await
            .unwrap();
        queue
            .enqueue_request_log(&RequestLog::new("p1", "GET", "/", 200, 4))
            .await
            .unwrap();
        queue
            .enqueue_metric(&Metric::new("p1", "cpu", 0.1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        for kind in RecordKind::ALL {
            assert_eq!(storage.count(kind), 1, "kind {kind}");
            assert_eq!(handle.metrics()[&kind].processed_count, 1);
        }
        assert_eq!(supervisor.metrics(), handle.metrics());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_stops_tasks() {
        let (supervisor, _, _) = supervisor();
        let cancel = CancellationToken::new();
        let handle = supervisor.start(cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("supervisor should stop promptly");
    }
}
