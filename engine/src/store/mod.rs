//! Storage capability consumed by the engine.
//!
//! The engine never talks to a concrete database. Everything it needs from
//! a backend is captured by the [`Store`] trait: watching a collection as an
//! ordered change log, creating and destroying collections, single-row
//! mutations, and optimistic multi-row transactions.
//!
//! # Change log
//!
//! A [`Watch`] delivers [`ChangeEvent`]s for exactly one collection. Events
//! are grouped into atomic batches: every event of a batch except the last
//! carries `continued = true`. Subscribing first replays the current
//! contents of the collection as one batch and then yields live batches in
//! commit order.
//!
//! When a watched collection is destroyed the watch yields
//! [`StoreError::NotFound`] and then closes.
//!
//! # Backends
//!
//! - [`memory::MemoryStore`] - in-process reference backend

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::StoreError;

pub use memory::MemoryStore;

/// Identifier of a live watch subscription.
pub type WatchId = u64;

/// One item yielded by a watch: an event, or the error that ended the feed.
pub type WatchItem = Result<ChangeEvent, StoreError>;

/// Kind of row mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// A single row-level mutation observed on a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Collection the row belongs to.
    pub collection: String,
    /// Key of the mutated row.
    pub row_key: String,
    /// Whether the row was written or removed.
    pub kind: ChangeKind,
    /// Encoded row value; `None` for deletes.
    pub value: Option<Vec<u8>>,
    /// `true` if more events of the same batch follow.
    pub continued: bool,
}

impl ChangeEvent {
    /// Creates a put event.
    pub fn put(
        collection: impl Into<String>,
        row_key: impl Into<String>,
        value: Vec<u8>,
        continued: bool,
    ) -> Self {
        Self {
            collection: collection.into(),
            row_key: row_key.into(),
            kind: ChangeKind::Put,
            value: Some(value),
            continued,
        }
    }

    /// Creates a delete event.
    pub fn delete(
        collection: impl Into<String>,
        row_key: impl Into<String>,
        continued: bool,
    ) -> Self {
        Self {
            collection: collection.into(),
            row_key: row_key.into(),
            kind: ChangeKind::Delete,
            value: None,
            continued,
        }
    }

    /// Decodes the row value, returning `Ok(None)` for deletes.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the value does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.value
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
    }
}

/// A live subscription to one collection's change log.
#[derive(Debug)]
pub struct Watch {
    pub id: WatchId,
    pub events: mpsc::UnboundedReceiver<WatchItem>,
}

/// A row write inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put { row_key: String, value: Vec<u8> },
    Delete { row_key: String },
}

impl Write {
    /// Encodes `value` as JSON and wraps it in a put.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if serialization fails.
    pub fn put_json<T: Serialize>(
        row_key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::Put {
            row_key: row_key.into(),
            value: serde_json::to_vec(value)?,
        })
    }

    /// Key of the row this write touches.
    pub fn row_key(&self) -> &str {
        match self {
            Self::Put { row_key, .. } | Self::Delete { row_key } => row_key,
        }
    }
}

/// An atomic multi-row write against one collection.
///
/// When `expected_version` is set the commit fails with
/// [`StoreError::Conflict`] if the collection changed since that version
/// was observed. A successful commit is delivered to watchers as exactly one
/// batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub collection: String,
    pub expected_version: Option<u64>,
    pub writes: Vec<Write>,
}

/// Consistent point-in-time view of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Version of the collection; bumped by every mutating batch.
    pub version: u64,
    /// Rows keyed by row key.
    pub rows: BTreeMap<String, Vec<u8>>,
}

/// Backend capability required by the engine.
///
/// Implementations must be safe to share across tasks; the engine holds
/// them as `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Subscribes to a collection's change log.
    ///
    /// The current rows are replayed as the first batch.
    async fn watch(&self, collection: &str) -> Result<Watch, StoreError>;

    /// Cancels a watch. Unknown or already-cancelled ids are ignored.
    async fn unwatch(&self, id: WatchId);

    /// Creates a collection holding `rows`, announced as one batch.
    async fn create_collection(
        &self,
        collection: &str,
        rows: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StoreError>;

    /// Destroys a collection and ends every watch on it with
    /// [`StoreError::NotFound`].
    async fn destroy_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Writes one row as a single-event batch.
    async fn put(&self, collection: &str, row_key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Removes one row. Removing a missing row is a no-op.
    async fn delete(&self, collection: &str, row_key: &str) -> Result<(), StoreError>;

    /// Reads one row.
    async fn get(&self, collection: &str, row_key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Reads every row together with the collection version.
    async fn snapshot(&self, collection: &str) -> Result<Snapshot, StoreError>;

    /// Applies a transaction atomically.
    async fn commit(&self, txn: Transaction) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskSpec;

    #[test]
    fn decode_put_event() {
        let spec = TaskSpec::new("milk");
        let event = ChangeEvent::put("l1", "t1", serde_json::to_vec(&spec).unwrap(), false);
        let decoded: Option<TaskSpec> = event.decode().unwrap();
        assert_eq!(decoded, Some(spec));
    }

    #[test]
    fn decode_delete_event_is_none() {
        let event = ChangeEvent::delete("l1", "t1", false);
        let decoded: Option<TaskSpec> = event.decode().unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn decode_garbage_fails() {
        let event = ChangeEvent::put("l1", "t1", b"{not json".to_vec(), false);
        assert!(event.decode::<TaskSpec>().is_err());
    }

    #[test]
    fn write_row_key() {
        let put = Write::put_json("t1", &true).unwrap();
        let delete = Write::Delete {
            row_key: "t2".to_string(),
        };
        assert_eq!(put.row_key(), "t1");
        assert_eq!(delete.row_key(), "t2");
    }
}
