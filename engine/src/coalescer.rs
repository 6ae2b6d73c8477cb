//! Batch coalescing over a change log.
//!
//! A watch feed interleaves nothing: events of one batch arrive contiguously
//! and the last one has `continued = false`. [`BatchCoalescer`] buffers the
//! events of the open batch and releases them together once the batch
//! closes, so consumers only ever observe whole batches.
//!
//! # Errors
//!
//! When the feed yields an error the partial batch is discarded and the
//! error is surfaced exactly once. The coalescer is then terminated and
//! ignores everything else it is given.

use tracing::trace;

use crate::error::StoreError;
use crate::store::{ChangeEvent, WatchItem};

/// Consumer of closed batches.
pub trait BatchSink {
    /// Applies one event of a closed batch.
    fn apply(&mut self, event: ChangeEvent);

    /// Called once after every event of the batch has been applied.
    fn on_batch_closed(&mut self);
}

/// Buffers change events until their batch closes.
#[derive(Debug, Default)]
pub struct BatchCoalescer {
    pending: Vec<ChangeEvent>,
    terminated: bool,
}

impl BatchCoalescer {
    /// Creates an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once an error has been surfaced.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Number of buffered events of the open batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feeds one watch item.
    ///
    /// Returns `Ok(Some(batch))` when the item closes a batch and `Ok(None)`
    /// while the batch is still open or after termination.
    ///
    /// # Errors
    ///
    /// Returns the feed error the first time one is seen.
    pub fn push(&mut self, item: WatchItem) -> Result<Option<Vec<ChangeEvent>>, StoreError> {
        if self.terminated {
            return Ok(None);
        }
        match item {
            Ok(event) => {
                let closes = !event.continued;
                self.pending.push(event);
                if closes {
                    trace!(events = self.pending.len(), "Batch closed");
                    Ok(Some(std::mem::take(&mut self.pending)))
                } else {
                    Ok(None)
                }
            }
            Err(err) => {
                trace!(discarded = self.pending.len(), error = %err, "Watch feed failed");
                self.pending.clear();
                self.terminated = true;
                Err(err)
            }
        }
    }

    /// Feeds one watch item and drives `sink` if it closes a batch.
    ///
    /// Returns `Ok(true)` if a batch was delivered.
    ///
    /// # Errors
    ///
    /// Returns the feed error the first time one is seen; `sink` is not
    /// called for the discarded partial batch.
    pub fn feed<S: BatchSink + ?Sized>(
        &mut self,
        item: WatchItem,
        sink: &mut S,
    ) -> Result<bool, StoreError> {
        match self.push(item)? {
            Some(batch) => {
                for event in batch {
                    sink.apply(event);
                }
                sink.on_batch_closed();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
