//! Fan-out of list events to multiple subscribers.
//!
//! [`ListEventBroadcaster`] is a [`ListEventListener`] that republishes every
//! call on a tokio broadcast channel, so any number of async consumers can
//! follow the same engine.
//!
//! # Example
//!
//! ```rust
//! use todos_engine::broadcast::ListEventBroadcaster;
//! use todos_engine::listener::{ListEvent, ListEventListener};
//!
//! let broadcaster = ListEventBroadcaster::<u32>::new();
//! let mut rx = broadcaster.subscribe();
//!
//! broadcaster.on_item_add(1);
//! assert_eq!(rx.try_recv().unwrap(), ListEvent::Added(1));
//! ```

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::listener::{ListEvent, ListEventListener};

/// Default channel capacity.
///
/// Subscribers that fall more than this many events behind receive
/// `RecvError::Lagged` on their next receive.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast hub for [`ListEvent`]s.
///
/// `ListEventBroadcaster` is `Clone`; clones share the underlying channel.
///
/// # Channel Capacity
///
/// The channel has a fixed capacity. When it is full the oldest event is
/// dropped and slow receivers observe a lag.
#[derive(Debug, Clone)]
pub struct ListEventBroadcaster<T> {
    sender: Sender<ListEvent<T>>,
}

impl<T: Clone> ListEventBroadcaster<T> {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0. [`Config::from_env`] rejects a zero
    /// `TODOS_EVENT_CAPACITY`.
    ///
    /// [`Config::from_env`]: crate::config::Config::from_env
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created list event broadcaster");
        Self { sender }
    }

    /// Subscribes to events broadcast from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ListEvent<T>> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New subscriber added"
        );
        rx
    }

    /// Sends an event to every current subscriber.
    ///
    /// Returns the number of subscribers reached, 0 if there were none.
    pub fn broadcast(&self, event: ListEvent<T>) -> usize {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(kind, receivers, "List event broadcast");
                receivers
            }
            Err(_) => {
                trace!(kind, "No active subscribers for list event");
                0
            }
        }
    }

    /// Number of live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for ListEventBroadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> ListEventListener<T> for ListEventBroadcaster<T> {
    fn on_item_add(&self, item: T) {
        self.broadcast(ListEvent::Added(item));
    }

    fn on_item_update(&self, item: T) {
        self.broadcast(ListEvent::Updated(item));
    }

    fn on_item_delete(&self, id: &str) {
        self.broadcast(ListEvent::Deleted(id.to_string()));
    }
}
