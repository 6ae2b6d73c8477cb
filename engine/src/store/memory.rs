//! In-process [`Store`] backend.
//!
//! All state lives behind one mutex. Watch feeds are unbounded channels so
//! publishing a batch never blocks while the lock is held, and a watch
//! subscription replays the current rows and registers itself atomically.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{ChangeEvent, Snapshot, Store, Transaction, Watch, WatchId, WatchItem, Write};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Collection {
    rows: BTreeMap<String, Vec<u8>>,
    version: u64,
    watchers: HashMap<WatchId, mpsc::UnboundedSender<WatchItem>>,
}

impl Collection {
    /// Sends one batch to every watcher, forgetting watchers that hung up.
    fn publish(&mut self, batch: &[ChangeEvent]) {
        if batch.is_empty() {
            return;
        }
        self.watchers.retain(|_, tx| {
            batch
                .iter()
                .all(|event| tx.send(Ok(event.clone())).is_ok())
        });
    }
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    next_watch_id: WatchId,
}

/// Reference backend keeping every collection in memory.
///
/// # Example
///
/// ```rust
/// use todos_engine::store::{MemoryStore, Store};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// store.create_collection("l1", vec![]).await.unwrap();
/// store.put("l1", "t1", b"true".to_vec()).await.unwrap();
/// assert_eq!(store.get("l1", "t1").await.unwrap(), Some(b"true".to_vec()));
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the collection exists.
    pub fn contains_collection(&self, collection: &str) -> bool {
        self.lock().collections.contains_key(collection)
    }

    /// Number of live watches across all collections.
    pub fn watch_count(&self) -> usize {
        self.lock()
            .collections
            .values()
            .map(|c| c.watchers.len())
            .sum()
    }
}

/// Marks every event but the last as continued.
fn seal(mut batch: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let last = batch.len().saturating_sub(1);
    for (i, event) in batch.iter_mut().enumerate() {
        event.continued = i < last;
    }
    batch
}

#[async_trait]
impl Store for MemoryStore {
    async fn watch(&self, collection: &str) -> Result<Watch, StoreError> {
        let mut inner = self.lock();
        inner.next_watch_id += 1;
        let id = inner.next_watch_id;

        let coll = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let replay = seal(
            coll.rows
                .iter()
                .map(|(key, value)| ChangeEvent::put(collection, key.as_str(), value.clone(), true))
                .collect(),
        );
        for event in replay {
            // Receiver is still in hand, send cannot fail.
            let _ = tx.send(Ok(event));
        }
        coll.watchers.insert(id, tx);

        trace!(collection, watch_id = id, rows = coll.rows.len(), "Watch subscribed");
        Ok(Watch { id, events: rx })
    }

    async fn unwatch(&self, id: WatchId) {
        let mut inner = self.lock();
        for (name, coll) in inner.collections.iter_mut() {
            if coll.watchers.remove(&id).is_some() {
                trace!(collection = %name, watch_id = id, "Watch cancelled");
                return;
            }
        }
    }

    async fn create_collection(
        &self,
        collection: &str,
        rows: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.collections.contains_key(collection) {
            return Err(StoreError::AlreadyExists(collection.to_string()));
        }
        let mut coll = Collection::default();
        for (key, value) in rows {
            coll.rows.insert(key, value);
        }
        if !coll.rows.is_empty() {
            coll.version = 1;
        }
        trace!(collection, rows = coll.rows.len(), "Collection created");
        inner.collections.insert(collection.to_string(), coll);
        Ok(())
    }

    async fn destroy_collection(&self, collection: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let coll = inner
            .collections
            .remove(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        for tx in coll.watchers.into_values() {
            let _ = tx.send(Err(StoreError::not_found(collection)));
        }
        trace!(collection, "Collection destroyed");
        Ok(())
    }

    async fn put(&self, collection: &str, row_key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.commit(Transaction {
            collection: collection.to_string(),
            expected_version: None,
            writes: vec![Write::Put {
                row_key: row_key.to_string(),
                value,
            }],
        })
        .await
    }

    async fn delete(&self, collection: &str, row_key: &str) -> Result<(), StoreError> {
        self.commit(Transaction {
            collection: collection.to_string(),
            expected_version: None,
            writes: vec![Write::Delete {
                row_key: row_key.to_string(),
            }],
        })
        .await
    }

    async fn get(&self, collection: &str, row_key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.lock();
        let coll = inner
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        Ok(coll.rows.get(row_key).cloned())
    }

    async fn snapshot(&self, collection: &str) -> Result<Snapshot, StoreError> {
        let inner = self.lock();
        let coll = inner
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        Ok(Snapshot {
            version: coll.version,
            rows: coll.rows.clone(),
        })
    }

    async fn commit(&self, txn: Transaction) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let coll = inner
            .collections
            .get_mut(&txn.collection)
            .ok_or_else(|| StoreError::not_found(&txn.collection))?;

        if let Some(expected) = txn.expected_version {
            if expected != coll.version {
                return Err(StoreError::Conflict {
                    collection: txn.collection,
                    expected,
                    actual: coll.version,
                });
            }
        }

        let mut batch = Vec::with_capacity(txn.writes.len());
        for write in txn.writes {
            match write {
                Write::Put { row_key, value } => {
                    coll.rows.insert(row_key.clone(), value.clone());
                    batch.push(ChangeEvent::put(&txn.collection, row_key, value, true));
                }
                Write::Delete { row_key } => {
                    if coll.rows.remove(&row_key).is_some() {
                        batch.push(ChangeEvent::delete(&txn.collection, row_key, true));
                    }
                }
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        coll.version += 1;
        trace!(
            collection = %txn.collection,
            version = coll.version,
            events = batch.len(),
            "Committed batch"
        );
        coll.publish(&seal(batch));
        Ok(())
    }
}
