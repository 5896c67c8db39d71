//! Live fan-out of persisted records to per-tenant subscribers.
//!
//! Channels are named `{project}:{kind}`. Delivery is best effort with no
//! replay: a subscriber sees only records published after it subscribed.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use vantage_broker::FanoutBackend;

use crate::record::{Record, RecordKind};
use crate::IngestError;

/// Decoded live records for one tenant and kind.
pub type RecordStream<R> = BoxStream<'static, R>;

/// Channel carrying `kind` records for `project`.
pub fn channel_name(project: &str, kind: RecordKind) -> String {
    format!("{project}:{kind}")
}

/// Publishes records to, and subscribes to, tenant channels.
#[derive(Clone)]
pub struct Publisher {
    backend: Arc<dyn FanoutBackend>,
}

impl Publisher {
    pub fn new(backend: Arc<dyn FanoutBackend>) -> Self {
        Self { backend }
    }

    /// Broadcast `record` on its tenant channel.
    ///
    /// Returns how many subscribers were reached. Having none is not an
    /// error.
    pub async fn publish<R: Record>(&self, record: &R) -> Result<usize, IngestError> {
        let payload = serde_json::to_vec(record)?;
        let channel = channel_name(record.project_id(), R::KIND);
        Ok(self.backend.publish(&channel, &payload).await?)
    }

    /// Live `R` records for `project`. Dropping the stream unsubscribes.
    pub async fn subscribe<R: Record>(&self, project: &str) -> Result<RecordStream<R>, IngestError> {
        let channel = channel_name(project, R::KIND);
        let subscription = self.backend.subscribe(&channel).await?;

        let records = subscription.filter_map(move |payload| {
            let decoded = serde_json::from_slice::<R>(&payload);
            let channel = channel.clone();
            async move {
                match decoded {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(
                            channel = %channel,
                            error = %e,
                            "Skipping undecodable fan-out message"
                        );
                        None
                    }
                }
            }
        });

        Ok(records.boxed())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}
