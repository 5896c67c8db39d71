use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use ulid::Ulid;

use super::{table_name, BatchWriter};
use crate::record::{Record, RecordKind};
use crate::IngestError;

/// In-process record sink.
///
/// Records are kept per kind and keyed by id, so inserting the same record
/// twice stores it once.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    tables: Mutex<HashMap<RecordKind, BTreeMap<Ulid, Value>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of `kind`.
    pub fn count(&self, kind: RecordKind) -> usize {
        self.tables.lock().get(&kind).map_or(0, BTreeMap::len)
    }

    /// Stored records of type `R`, in id order.
    pub fn records<R: Record>(&self) -> Vec<R> {
        let tables = self.tables.lock();
        let Some(rows) = tables.get(&R::KIND) else {
            return Vec::new();
        };

        rows.values()
            .filter_map(|row| serde_json::from_value(row.clone()).ok())
            .collect()
    }

    pub fn contains(&self, kind: RecordKind, id: Ulid) -> bool {
        self.tables
            .lock()
            .get(&kind)
            .is_some_and(|rows| rows.contains_key(&id))
    }
}

#[async_trait]
impl<R: Record> BatchWriter<R> for MemoryWriter {
    async fn insert(&self, records: &[R]) -> Result<(), IngestError> {
        let mut tables = self.tables.lock();
        let rows = tables.entry(R::KIND).or_default();

        for record in records {
            let row = serde_json::to_value(record).map_err(|e| IngestError::StorageWrite {
                table: table_name(R::KIND),
                message: e.to_string(),
            })?;
            rows.entry(record.id()).or_insert(row);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Event, Metric};

    #[tokio::test]
    async fn stores_records_by_kind() {
        let writer = MemoryWriter::new();
        let events = vec![Event::new("p1", "a"), Event::new("p1", "b")];

        writer.insert(&events).await.unwrap();
        writer.insert(&[Metric::new("p1", "cpu", 0.9)]).await.unwrap();

        assert_eq!(writer.count(RecordKind::Event), 2);
        assert_eq!(writer.count(RecordKind::Metric), 1);
        assert_eq!(writer.count(RecordKind::AppLog), 0);

        let stored: Vec<Event> = writer.records();
        assert_eq!(stored.len(), 2);
        assert!(writer.contains(RecordKind::Event, events[0].id));
    }

    #[tokio::test]
    async fn reinsertion_is_idempotent() {
        let writer = MemoryWriter::new();
        let event = Event::new("p1", "signup");

        writer.insert(&[event.clone()]).await.unwrap();
        writer.insert(&[event.clone(), event]).await.unwrap();

        assert_eq!(writer.count(RecordKind::Event), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let writer = MemoryWriter::new();
        BatchWriter::<Event>::insert(&writer, &[]).await.unwrap();
        assert_eq!(writer.count(RecordKind::Event), 0);
    }
}
