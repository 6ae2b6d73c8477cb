//! Downstream listener contracts.
//!
//! The engine reports derived state through three verbs: an item was added,
//! an item changed, an item went away. [`ListEventListener`] is that
//! contract; the registry drives it with [`ListMetadata`] and an open-list
//! watcher drives the [`TodoListListener`] extension with [`Task`]s.
//!
//! Listener methods are synchronous and must not block: they are invoked
//! from inside tracker actors. Use [`ChannelListener`] or
//! [`ListEventBroadcaster`](crate::broadcast::ListEventBroadcaster) to hand
//! events to async consumers.
//!
//! [`ListMetadata`]: crate::types::ListMetadata

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{ListSpec, Task};

/// Receiver of add/update/delete notifications for items of type `T`.
pub trait ListEventListener<T>: Send + Sync {
    /// An item was observed for the first time.
    fn on_item_add(&self, item: T);

    /// A previously added item changed.
    fn on_item_update(&self, item: T);

    /// The item with this id no longer exists.
    fn on_item_delete(&self, id: &str);
}

/// Listener for the tasks and metadata of one open list.
pub trait TodoListListener: ListEventListener<Task> {
    /// The list's spec row changed (or was first seen).
    fn on_list_update(&self, spec: ListSpec);

    /// The list itself was deleted.
    fn on_list_delete(&self);
}

/// One listener call, as a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ListEvent<T> {
    Added(T),
    Updated(T),
    Deleted(String),
}

impl<T> ListEvent<T> {
    /// Short name of the verb, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Forwards every listener call into an unbounded channel.
///
/// Sends to a dropped receiver are discarded.
#[derive(Debug, Clone)]
pub struct ChannelListener<T> {
    sender: mpsc::UnboundedSender<ListEvent<T>>,
}

impl<T> ChannelListener<T> {
    /// Creates a listener together with the receiving half.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListEvent<T>>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (Self { sender }, rx)
    }

    fn forward(&self, event: ListEvent<T>) {
        trace!(kind = event.kind(), "Forwarding list event");
        let _ = self.sender.send(event);
    }
}

impl<T: Send> ListEventListener<T> for ChannelListener<T> {
    fn on_item_add(&self, item: T) {
        self.forward(ListEvent::Added(item));
    }

    fn on_item_update(&self, item: T) {
        self.forward(ListEvent::Updated(item));
    }

    fn on_item_delete(&self, id: &str) {
        self.forward(ListEvent::Deleted(id.to_string()));
    }
}

/// Everything a [`TodoListListener`] can observe, as a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum TodoListEvent {
    Task(ListEvent<Task>),
    ListUpdated(ListSpec),
    ListDeleted,
}

/// Channel-backed [`TodoListListener`].
#[derive(Debug, Clone)]
pub struct TodoListChannel {
    sender: mpsc::UnboundedSender<TodoListEvent>,
}

impl TodoListChannel {
    /// Creates a listener together with the receiving half.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TodoListEvent>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (Self { sender }, rx)
    }
}

impl ListEventListener<Task> for TodoListChannel {
    fn on_item_add(&self, item: Task) {
        let _ = self.sender.send(TodoListEvent::Task(ListEvent::Added(item)));
    }

    fn on_item_update(&self, item: Task) {
        let _ = self.sender.send(TodoListEvent::Task(ListEvent::Updated(item)));
    }

    fn on_item_delete(&self, id: &str) {
        let _ = self
            .sender
            .send(TodoListEvent::Task(ListEvent::Deleted(id.to_string())));
    }
}

impl TodoListListener for TodoListChannel {
    fn on_list_update(&self, spec: ListSpec) {
        let _ = self.sender.send(TodoListEvent::ListUpdated(spec));
    }

    fn on_list_delete(&self) {
        let _ = self.sender.send(TodoListEvent::ListDeleted);
    }
}
