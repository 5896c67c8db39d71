use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StreamConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum FanoutConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[cfg(feature = "valkey")]
fn default_pool_size() -> usize {
    10
}
