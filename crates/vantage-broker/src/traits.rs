use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{EntryId, StreamEntry, Subscription};

#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append a payload to the named stream. Returns once the append is
    /// acknowledged by the broker.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<EntryId, BrokerError>;

    /// Return up to `max_count` entries starting from the head of the stream,
    /// waiting up to `block` when the stream is empty.
    ///
    /// A timeout yields an empty vector, not an error.
    async fn read_pending(
        &self,
        stream: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Remove entries from the stream. Unknown ids are ignored; returns the
    /// number of entries actually removed.
    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<usize, BrokerError>;

    /// Number of entries currently in the stream.
    async fn len(&self, stream: &str) -> Result<usize, BrokerError>;
}

#[async_trait]
pub trait FanoutBackend: Send + Sync {
    /// Broadcast a payload to every current subscriber of `channel`.
    /// Returns how many subscribers it reached; zero is not an error.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError>;

    /// Subscribe to `channel`. Only messages published after this call
    /// returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}
