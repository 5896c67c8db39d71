//! Valkey/Redis adapter for stream and fan-out backends.
//!
//! Streams map onto `XADD` / `XREAD` / `XDEL`; fan-out maps onto
//! `PUBLISH` / `SUBSCRIBE`.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::error::BrokerError;
use crate::traits::{FanoutBackend, StreamBackend};
use crate::types::{EntryId, StreamEntry, Subscription};

/// Field name holding the serialized record inside each stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// Reading from id `0` returns entries from the head of the stream, every
/// time, regardless of what was read before.
const STREAM_HEAD: &str = "0";

fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Backend(err.to_string())
    }
}

async fn create_pool(url: &str, pool_size: usize) -> Result<Pool, BrokerError> {
    let config = Config::from_url(url);
    let pool = config
        .builder()
        .map_err(|e| BrokerError::Connection(e.to_string()))?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    // Test the connection
    let mut conn = pool
        .get()
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(map_redis_error)?;

    Ok(pool)
}

/// Valkey/Redis stream backend.
#[derive(Clone)]
pub struct ValkeyStream {
    pool: Pool,
}

impl ValkeyStream {
    /// Connect to Valkey and verify the connection with `PING`.
    pub async fn new(url: &str, pool_size: usize) -> Result<Self, BrokerError> {
        let pool = create_pool(url, pool_size).await?;
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

#[async_trait]
impl StreamBackend for ValkeyStream {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<EntryId, BrokerError> {
        let mut conn = self.connection().await?;

        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(map_redis_error)?;

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

        let mut conn = self.connection().await?;

        // BLOCK 0 means "wait forever" to Valkey, so a zero timeout is sent
        // as a plain non-blocking read.
        let mut options = StreamReadOptions::default().count(max_count);
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
        if block_ms > 0 {
            options = options.block(block_ms);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[STREAM_HEAD], &options)
            .await
            .map_err(map_redis_error)?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for stream_id in key.ids {
                match stream_id.get::<Vec<u8>>(PAYLOAD_FIELD) {
                    Some(payload) => entries.push(StreamEntry::new(stream_id.id, payload)),
                    None => {
                        // Surfaced as an empty payload so the consumer can
                        // still acknowledge it.
                        tracing::warn!(
                            stream = %stream,
                            id = %stream_id.id,
                            "Stream entry has no payload field"
                        );
                        entries.push(StreamEntry::new(stream_id.id, Vec::new()));
                    }
                }
            }
        }

        entries.truncate(max_count);
        Ok(entries)
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<usize, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let raw_ids: Vec<&str> = ids.iter().map(EntryId::as_str).collect();

        let deleted: usize = conn
            .xdel(stream, raw_ids.as_slice())
            .await
            .map_err(map_redis_error)?;

        Ok(deleted)
    }

    async fn len(&self, stream: &str) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;
        let len: usize = conn.xlen(stream).await.map_err(map_redis_error)?;
        Ok(len)
    }
}

/// Valkey/Redis pub/sub fan-out backend.
///
/// Publishing goes through the shared pool; each subscription opens its own
/// pub/sub connection, closed when the subscription is dropped.
#[derive(Clone)]
pub struct ValkeyFanout {
    pool: Pool,
    client: redis::Client,
}

impl ValkeyFanout {
    /// Connect to Valkey and verify the connection with `PING`.
    pub async fn new(url: &str, pool_size: usize) -> Result<Self, BrokerError> {
        let pool = create_pool(url, pool_size).await?;
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { pool, client })
    }
}

#[async_trait]
impl FanoutBackend for ValkeyFanout {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let receivers: usize = conn
            .publish(channel, payload)
            .await
            .map_err(map_redis_error)?;

        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_error)?;

        pubsub.subscribe(channel).await.map_err(map_redis_error)?;

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<Vec<u8>>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(
                            channel = %channel,
                            error = %e,
                            "Dropping unreadable pub/sub message"
                        );
                        None
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for ValkeyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStream").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ValkeyFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyFanout").finish_non_exhaustive()
    }
}
