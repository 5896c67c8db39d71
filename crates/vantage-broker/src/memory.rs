use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::traits::{FanoutBackend, StreamBackend};
use crate::types::{EntryId, StreamEntry, Subscription};

/// Default per-channel buffer for [`MemoryFanout`].
pub const DEFAULT_FANOUT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    last_ms: u64,
    seq: u64,
}

impl StreamState {
    /// Ids follow the `<millis>-<seq>` shape Valkey uses, strictly increasing
    /// within a stream.
    fn next_id(&mut self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.seq = 0;
        } else {
            self.seq += 1;
        }

        format!("{}-{}", self.last_ms, self.seq)
    }
}

/// In-process durable stream.
///
/// "Durable" only for the lifetime of the process; intended for tests and
/// single-node development.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    appended: Arc<Notify>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamBackend for MemoryStream {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<EntryId, BrokerError> {
        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state
                .entries
                .push_back(StreamEntry::new(id.clone(), payload.to_vec()));
            id
        };

        self.appended.notify_waiters();
        Ok(EntryId::new(id))
    }

    async fn read_pending(
        &self,
        stream: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + block;

        loop {
            // Register before checking so an append between the check and
            // the wait still wakes us.
            let notified = self.appended.notified();

            {
                let streams = self.streams.lock().await;
                if let Some(state) = streams.get(stream) {
                    if !state.entries.is_empty() {
                        return Ok(state.entries.iter().take(max_count).cloned().collect());
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<usize, BrokerError> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };

        let initial_len = state.entries.len();
        state.entries.retain(|entry| !ids.contains(&entry.id));
        Ok(initial_len - state.entries.len())
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        let streams = self.streams.lock().await;
        Ok(streams.get(stream).map_or(0, |state| state.entries.len()))
    }
}

/// In-process fan-out over one tokio broadcast channel per name.
///
/// A subscriber that falls more than `capacity` messages behind skips the
/// messages it missed.
#[derive(Debug, Clone)]
pub struct MemoryFanout {
    channels: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl MemoryFanout {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FANOUT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for MemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutBackend for MemoryFanout {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(payload.to_vec()).unwrap_or(0),
            None => return Ok(0),
        };

        if delivered == 0 {
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let channel = channel.to_string();
        let stream = futures::stream::unfold(
            (receiver, channel),
            |(mut receiver, channel)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, (receiver, channel))),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                channel = %channel,
                                skipped = skipped,
                                "Fan-out subscriber lagged, messages skipped"
                            );
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_reads_from_head_until_deleted() {
        let stream = MemoryStream::new();
        let first = stream.append("app", b"one").await.unwrap();
        stream.append("app", b"two").await.unwrap();

        let entries = stream
            .read_pending("app", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, b"one");

        // Without a delete the same entries come back
        let again = stream
            .read_pending("app", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(again[0].id, first);

        assert_eq!(stream.delete("app", &[first]).await.unwrap(), 1);
        let rest = stream
            .read_pending("app", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, b"two");
    }

    #[tokio::test]
    async fn stream_respects_max_count() {
        let stream = MemoryStream::new();
        for i in 0..5u8 {
            stream.append("event", &[i]).await.unwrap();
        }

        let entries = stream
            .read_pending("event", 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].payload, vec![2]);
    }

    #[tokio::test]
    async fn stream_ids_are_unique_and_ordered() {
        let stream = MemoryStream::new();
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(stream.append("metric", b"x").await.unwrap());
        }

        let entries = stream
            .read_pending("metric", 100, Duration::ZERO)
            .await
            .unwrap();
        let read_ids: Vec<_> = entries.into_iter().map(|e| e.id).collect();
        assert_eq!(read_ids, ids);

        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn stream_delete_is_idempotent() {
        let stream = MemoryStream::new();
        let id = stream.append("request", b"x").await.unwrap();

        assert_eq!(stream.delete("request", &[id.clone()]).await.unwrap(), 1);
        assert_eq!(stream.delete("request", &[id]).await.unwrap(), 0);
        assert_eq!(
            stream
                .delete("missing", &[EntryId::new("0-0")])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_read_times_out_with_no_entries() {
        let stream = MemoryStream::new();
        let started = Instant::now();

        let entries = stream
            .read_pending("app", 10, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_read_wakes_on_append() {
        let stream = MemoryStream::new();
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .read_pending("app", 10, Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        stream.append("app", b"late").await.unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"late");
    }

    #[tokio::test]
    async fn stream_len_tracks_pending_entries() {
        let stream = MemoryStream::new();
        assert_eq!(stream.len("app").await.unwrap(), 0);

        let id = stream.append("app", b"x").await.unwrap();
        stream.append("app", b"y").await.unwrap();
        assert_eq!(stream.len("app").await.unwrap(), 2);

        stream.delete("app", &[id]).await.unwrap();
        assert_eq!(stream.len("app").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fanout_reaches_every_subscriber() {
        let fanout = MemoryFanout::new();
        let mut first = fanout.subscribe("p1:event").await.unwrap();
        let mut second = fanout.subscribe("p1:event").await.unwrap();

        let delivered = fanout.publish("p1:event", b"hello").await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(first.next().await.unwrap(), b"hello");
        assert_eq!(second.next().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn fanout_without_subscribers_is_not_an_error() {
        let fanout = MemoryFanout::new();
        assert_eq!(fanout.publish("p1:app", b"nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fanout_has_no_replay() {
        let fanout = MemoryFanout::new();
        let _early = fanout.subscribe("p1:metric").await.unwrap();
        fanout.publish("p1:metric", b"before").await.unwrap();

        let mut late = fanout.subscribe("p1:metric").await.unwrap();
        fanout.publish("p1:metric", b"after").await.unwrap();

        assert_eq!(late.next().await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_released() {
        let fanout = MemoryFanout::new();
        let first = fanout.subscribe("p1:event").await.unwrap();
        let mut second = fanout.subscribe("p1:event").await.unwrap();
        assert_eq!(fanout.subscriber_count("p1:event"), 2);

        drop(first);
        assert_eq!(fanout.subscriber_count("p1:event"), 1);

        assert_eq!(fanout.publish("p1:event", b"again").await.unwrap(), 1);
        assert_eq!(second.next().await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let fanout = MemoryFanout::new();
        let mut tenant_a = fanout.subscribe("a:event").await.unwrap();
        let _tenant_b = fanout.subscribe("b:event").await.unwrap();

        fanout.publish("b:event", b"for-b").await.unwrap();
        fanout.publish("a:event", b"for-a").await.unwrap();

        assert_eq!(tenant_a.next().await.unwrap(), b"for-a");
    }
}
