//! Per-kind processing counters.
//!
//! The registry is the only state shared between the four processors. It
//! is written by processors and read by the status API, and every update
//! is mirrored to a `metrics` counter for Prometheus scraping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ::metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;

use crate::record::RecordKind;

/// Counters for one record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindMetrics {
    /// Records persisted to storage.
    pub processed_count: u64,
    /// Read, write, and acknowledge failures.
    pub error_count: u64,
    /// Completion time of the most recent acknowledged batch.
    pub last_process_time: Option<DateTime<Utc>>,
}

/// Health and throughput counters for every record kind.
#[derive(Debug)]
pub struct MetricsRegistry {
    kinds: RwLock<BTreeMap<RecordKind, KindMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let kinds = RecordKind::ALL
            .into_iter()
            .map(|kind| (kind, KindMetrics::default()))
            .collect();
        Self {
            kinds: RwLock::new(kinds),
        }
    }

    /// Counters for every kind at this instant.
    pub fn snapshot(&self) -> BTreeMap<RecordKind, KindMetrics> {
        self.kinds.read().clone()
    }

    pub fn get(&self, kind: RecordKind) -> KindMetrics {
        self.kinds.read().get(&kind).copied().unwrap_or_default()
    }

    /// Count `written` records for a completed batch.
    pub(crate) fn record_processed(&self, kind: RecordKind, written: u64) {
        {
            let mut kinds = self.kinds.write();
            let entry = kinds.entry(kind).or_default();
            entry.processed_count = entry.processed_count.saturating_add(written);
            entry.last_process_time = Some(Utc::now());
        }

        counter!("vantage.ingest.processed", "kind" => kind.as_str()).increment(written);
    }

    pub(crate) fn record_error(&self, kind: RecordKind) {
        {
            let mut kinds = self.kinds.write();
            let entry = kinds.entry(kind).or_default();
            entry.error_count = entry.error_count.saturating_add(1);
        }

        counter!("vantage.ingest.errors", "kind" => kind.as_str()).increment(1);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_every_kind_at_zero() {
        let registry = MetricsRegistry::new();
        let snapshot = registry.snapshot();

        assert_eq!(snapshot.len(), RecordKind::ALL.len());
        for kind in RecordKind::ALL {
            assert_eq!(snapshot[&kind], KindMetrics::default());
        }
    }

    #[test]
    fn processed_and_errors_are_tracked_per_kind() {
        let registry = MetricsRegistry::new();

        registry.record_processed(RecordKind::Event, 3);
        registry.record_processed(RecordKind::Event, 2);
        registry.record_error(RecordKind::Metric);

        let event = registry.get(RecordKind::Event);
        assert_eq!(event.processed_count, 5);
        assert_eq!(event.error_count, 0);
        assert!(event.last_process_time.is_some());

        let metric = registry.get(RecordKind::Metric);
        assert_eq!(metric.processed_count, 0);
        assert_eq!(metric.error_count, 1);
        assert!(metric.last_process_time.is_none());
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry = MetricsRegistry::new();
        let before = registry.snapshot();

        registry.record_error(RecordKind::AppLog);

        assert_eq!(before[&RecordKind::AppLog].error_count, 0);
        assert_eq!(registry.get(RecordKind::AppLog).error_count, 1);
    }
}
