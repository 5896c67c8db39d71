//! Vantage ingestion pipeline.
//!
//! Producers enqueue telemetry records onto one durable stream per record
//! kind. A supervised processor per kind drains its stream in batches,
//! persists each batch to the time-series store, fans the records out to
//! live subscribers, and only then removes the entries from the stream.
//!
//! ## Architecture
//!
//! ```text
//! enqueue → stream "{prefix}:{kind}" → StreamProcessor<R> → BatchWriter<R>
//!                                              ↓
//!                                  Publisher "{project}:{kind}"
//! ```
//!
//! Delivery is at least once: a record may be written more than once, never
//! lost once its enqueue succeeded.

pub mod api;
pub mod config;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod record;
pub mod storage;
pub mod supervisor;

pub use config::IngestConfig;
pub use error::IngestError;
pub use record::{AppLog, Event, LogLevel, Metric, Record, RecordKind, RequestLog};
