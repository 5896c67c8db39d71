use std::fmt;

use futures::stream::BoxStream;

/// Broker-assigned identifier of a stream entry.
///
/// Only used to acknowledge (delete) an entry; never as a read cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: EntryId,
    pub payload: Vec<u8>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: EntryId::new(id),
            payload,
        }
    }
}

/// Live sequence of payloads published on a fan-out channel.
///
/// Dropping the stream ends the subscription.
pub type Subscription = BoxStream<'static, Vec<u8>>;
