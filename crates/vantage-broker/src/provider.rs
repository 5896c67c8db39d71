use std::sync::Arc;

use crate::config::{BrokerConfig, FanoutConfig, StreamConfig};
use crate::error::ProviderError;
use crate::traits::{FanoutBackend, StreamBackend};

#[cfg(feature = "memory")]
use crate::memory::{MemoryFanout, MemoryStream};

#[cfg(feature = "valkey")]
use crate::valkey::{ValkeyFanout, ValkeyStream};

/// Stream and fan-out backends built from one [`BrokerConfig`].
#[derive(Clone)]
pub struct BrokerProvider {
    stream: Arc<dyn StreamBackend>,
    fanout: Arc<dyn FanoutBackend>,
}

impl BrokerProvider {
    pub fn new(stream: Arc<dyn StreamBackend>, fanout: Arc<dyn FanoutBackend>) -> Self {
        Self { stream, fanout }
    }

    pub async fn from_config(config: &BrokerConfig) -> Result<Self, ProviderError> {
        let stream = Self::create_stream_backend(&config.stream).await?;
        let fanout = Self::create_fanout_backend(&config.fanout).await?;
        Ok(Self { stream, fanout })
    }

    pub fn stream(&self) -> Arc<dyn StreamBackend> {
        self.stream.clone()
    }

    pub fn fanout(&self) -> Arc<dyn FanoutBackend> {
        self.fanout.clone()
    }

    async fn create_stream_backend(
        config: &StreamConfig,
    ) -> Result<Arc<dyn StreamBackend>, ProviderError> {
        match config {
            #[cfg(feature = "memory")]
            StreamConfig::Memory => Ok(Arc::new(MemoryStream::new())),

            #[cfg(feature = "valkey")]
            StreamConfig::Valkey { url, pool_size } => {
                let stream = ValkeyStream::new(url, *pool_size)
                    .await
                    .map_err(|e| ProviderError::Connection(e.to_string()))?;
                Ok(Arc::new(stream))
            }

            #[allow(unreachable_patterns)]
            _ => Err(ProviderError::UnsupportedBackend(
                "No suitable stream backend enabled".to_string(),
            )),
        }
    }

    async fn create_fanout_backend(
        config: &FanoutConfig,
    ) -> Result<Arc<dyn FanoutBackend>, ProviderError> {
        match config {
            #[cfg(feature = "memory")]
            FanoutConfig::Memory => Ok(Arc::new(MemoryFanout::new())),

            #[cfg(feature = "valkey")]
            FanoutConfig::Valkey { url, pool_size } => {
                let fanout = ValkeyFanout::new(url, *pool_size)
                    .await
                    .map_err(|e| ProviderError::Connection(e.to_string()))?;
                Ok(Arc::new(fanout))
            }

            #[allow(unreachable_patterns)]
            _ => Err(ProviderError::UnsupportedBackend(
                "No suitable fan-out backend enabled".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for BrokerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerProvider").finish_non_exhaustive()
    }
}
