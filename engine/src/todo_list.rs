//! Task-level view of one open list.
//!
//! Where the registry summarizes lists, a [`TodoListWatcher`] follows a
//! single list in detail: every task is reported once as added, then as
//! updated or deleted, and changes to the list's spec row are reported
//! separately. Like the registry it only acts on closed batches and reports
//! the net effect of each batch per task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::coalescer::{BatchCoalescer, BatchSink};
use crate::context::EngineContext;
use crate::error::{EngineError, Result, StoreError};
use crate::listener::TodoListListener;
use crate::store::{ChangeEvent, ChangeKind, WatchId, WatchItem};
use crate::types::{ListId, ListSpec, Task, TaskId, TaskSpec, LIST_SPEC_ROW};

/// Folds closed batches of a list collection into listener calls.
struct TodoListState {
    list_id: ListId,
    listener: Arc<dyn TodoListListener>,
    known: HashMap<TaskId, Task>,
    // Per-batch scratch: first-touch order and last value of each task.
    touched: Vec<TaskId>,
    latest: HashMap<TaskId, Option<TaskSpec>>,
    spec: Option<ListSpec>,
}

impl TodoListState {
    fn new(list_id: ListId, listener: Arc<dyn TodoListListener>) -> Self {
        Self {
            list_id,
            listener,
            known: HashMap::new(),
            touched: Vec::new(),
            latest: HashMap::new(),
            spec: None,
        }
    }

    fn touch(&mut self, id: String, value: Option<TaskSpec>) {
        if self.latest.insert(id.clone(), value).is_none() {
            self.touched.push(id);
        }
    }
}

impl BatchSink for TodoListState {
    fn apply(&mut self, event: ChangeEvent) {
        if event.row_key == LIST_SPEC_ROW {
            if event.kind == ChangeKind::Put {
                match event.decode::<ListSpec>() {
                    Ok(spec) => self.spec = spec,
                    Err(e) => {
                        warn!(list_id = %self.list_id, error = %e, "Skipping undecodable list spec");
                    }
                }
            }
            return;
        }

        match event.kind {
            ChangeKind::Put => match event.decode::<TaskSpec>() {
                Ok(value) => self.touch(event.row_key, value),
                Err(e) => warn!(
                    list_id = %self.list_id,
                    task_id = %event.row_key,
                    error = %e,
                    "Skipping undecodable task row"
                ),
            },
            ChangeKind::Delete => self.touch(event.row_key, None),
        }
    }

    fn on_batch_closed(&mut self) {
        if let Some(spec) = self.spec.take() {
            self.listener.on_list_update(spec);
        }

        let touched = std::mem::take(&mut self.touched);
        let mut latest = std::mem::take(&mut self.latest);
        for id in touched {
            match latest.remove(&id).flatten() {
                Some(spec) => {
                    let task = Task::from_spec(id.as_str(), spec);
                    if self.known.insert(id, task.clone()).is_some() {
                        self.listener.on_item_update(task);
                    } else {
                        self.listener.on_item_add(task);
                    }
                }
                None => {
                    if self.known.remove(&id).is_some() {
                        self.listener.on_item_delete(&id);
                    }
                }
            }
        }
        trace!(list_id = %self.list_id, tasks = self.known.len(), "Open list batch applied");
    }
}

/// Live task-level subscription to one list.
pub struct TodoListWatcher {
    ctx: EngineContext,
    list_id: ListId,
    watch_id: WatchId,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TodoListWatcher {
    /// Starts following `list_id`.
    ///
    /// The current tasks are reported as adds once the initial batch is
    /// applied.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownList`] if the list collection does not
    /// exist.
    pub async fn start(
        ctx: EngineContext,
        list_id: impl Into<ListId>,
        listener: Arc<dyn TodoListListener>,
    ) -> Result<Self> {
        let list_id = list_id.into();
        let watch = match ctx.store.watch(&list_id).await {
            Ok(watch) => watch,
            Err(StoreError::NotFound(_)) => return Err(EngineError::UnknownList(list_id)),
            Err(e) => return Err(e.into()),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = TodoListState::new(list_id.clone(), listener);
        let task = tokio::spawn(run(state, watch.events, shutdown_rx));
        debug!(list_id = %list_id, watch_id = watch.id, "Watching open list");

        Ok(Self {
            ctx,
            list_id,
            watch_id: watch.id,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    /// Returns `true` until the list is deleted, the feed fails, or the
    /// watcher is stopped.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops following the list.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.ctx.store.unwatch(self.watch_id).await;
        let _ = (&mut self.task).await;
        debug!(list_id = %self.list_id, "Stopped watching open list");
    }
}

async fn run(
    mut state: TodoListState,
    mut events: mpsc::UnboundedReceiver<WatchItem>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut coalescer = BatchCoalescer::new();
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            item = events.recv() => {
                let Some(item) = item else { break };
                match coalescer.feed(item, &mut state) {
                    Ok(_) => {}
                    Err(StoreError::NotFound(_)) => {
                        debug!(list_id = %state.list_id, "Open list deleted");
                        state.listener.on_list_delete();
                        break;
                    }
                    Err(e) if e.is_benign() => break,
                    Err(e) => {
                        error!(list_id = %state.list_id, error = %e, "Open list watch failed");
                        break;
                    }
                }
            }
        }
    }
}
