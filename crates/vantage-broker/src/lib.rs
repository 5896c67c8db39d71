//! Broker backends for the Vantage ingestion pipeline.
//!
//! Two concerns live here, each behind a trait so the ingest crate never
//! touches a concrete broker:
//!
//! - [`StreamBackend`]: append-only, per-name durable streams read from the
//!   head and acknowledged by deletion.
//! - [`FanoutBackend`]: fire-and-forget broadcast channels with no replay.
//!
//! The `memory` feature provides in-process implementations, `valkey`
//! provides Valkey/Redis implementations (streams + pub/sub), and `config`
//! adds serde configuration and a [`BrokerProvider`] that builds backends
//! from it.

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "valkey")]
mod valkey;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use error::{BrokerError, ProviderError};
pub use traits::{FanoutBackend, StreamBackend};
pub use types::{EntryId, StreamEntry, Subscription};

#[cfg(feature = "memory")]
pub use memory::{MemoryFanout, MemoryStream, DEFAULT_FANOUT_CAPACITY};

#[cfg(feature = "valkey")]
pub use valkey::{ValkeyFanout, ValkeyStream};

#[cfg(feature = "config")]
pub use config::{BrokerConfig, FanoutConfig, StreamConfig};

#[cfg(feature = "config")]
pub use provider::BrokerProvider;
