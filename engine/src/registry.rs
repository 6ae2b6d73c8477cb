//! Registry of tracked lists.
//!
//! The registry watches the top-level registry collection, where every row
//! key is a list id. It owns one [`TrackerActor`] per live list and drives
//! each list through `Absent -> Tracked -> Disabled -> removed`.
//!
//! # Teardown order
//!
//! When a registry row is deleted the list is torn down in a fixed order:
//!
//! 1. cancel the list watch (actor first, then the store subscription)
//! 2. destroy the list collection
//! 3. disable the tracker and wait for its acknowledgement
//! 4. report the deletion to the listener
//! 5. forget the tracker
//!
//! Because the watch is gone before the collection is destroyed and the
//! tracker is disabled before the deletion is reported, no add or update for
//! a list can reach the listener after its delete.
//!
//! # Failed list watches
//!
//! A list watch that fails (anything but its collection being destroyed) is
//! reported once by its tracker. The list is then untracked: it leaves
//! [`RegistryHandle::tracked_lists`] and its tracker keeps its last state
//! until [`RegistryHandle::resubscribe`] or a fresh registry put for the
//! same id watches it again. Deleting an untracked list still reports
//! exactly one delete.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coalescer::BatchCoalescer;
use crate::context::EngineContext;
use crate::error::{EngineError, Result, StoreError};
use crate::listener::ListEventListener;
use crate::store::{ChangeEvent, ChangeKind, WatchId, WatchItem};
use crate::tracker::{ListTracker, TrackerActor, TrackerCommand, TrackerFailure};
use crate::txn;
use crate::types::{ListId, ListMetadata};

/// Capacity of each tracker's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Registry-side handle to one running tracker.
struct TrackerHandle {
    watch_id: WatchId,
    /// `false` from a failed watch until it is resubscribed.
    subscribed: bool,
    commands: mpsc::Sender<TrackerCommand>,
    task: JoinHandle<ListTracker>,
}

type TrackerMap = Arc<RwLock<HashMap<ListId, TrackerHandle>>>;

/// Entry point for running the registry.
pub struct Registry;

impl Registry {
    /// Starts watching the registry collection, creating it if needed.
    ///
    /// Every list already present is reported through `listener` once its
    /// first batch has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the registry collection cannot be
    /// created or watched.
    pub async fn start(
        ctx: EngineContext,
        listener: Arc<dyn ListEventListener<ListMetadata>>,
    ) -> Result<RegistryHandle> {
        let collection = ctx.registry_collection().to_string();
        match ctx.store.create_collection(&collection, Vec::new()).await {
            Ok(()) => debug!(collection = %collection, "Created registry collection"),
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let watch = ctx.store.watch(&collection).await?;
        let trackers: TrackerMap = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let registry_loop = RegistryLoop {
            ctx: ctx.clone(),
            listener,
            trackers: trackers.clone(),
            coalescer: BatchCoalescer::new(),
            failures: failures_tx,
        };
        let task = tokio::spawn(registry_loop.run(watch.events, failures_rx, shutdown_rx));

        info!(collection = %collection, "Registry started");

        Ok(RegistryHandle {
            ctx,
            trackers,
            watch_id: watch.id,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Handle to a running registry.
pub struct RegistryHandle {
    ctx: EngineContext,
    trackers: TrackerMap,
    watch_id: WatchId,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RegistryHandle {
    /// Ids of the lists currently tracked, sorted.
    pub async fn tracked_lists(&self) -> Vec<ListId> {
        self.lists_where(true).await
    }

    /// Ids of the lists whose watch failed and that wait for
    /// [`resubscribe`](Self::resubscribe), sorted.
    pub async fn untracked_lists(&self) -> Vec<ListId> {
        self.lists_where(false).await
    }

    async fn lists_where(&self, subscribed: bool) -> Vec<ListId> {
        let mut ids: Vec<ListId> = self
            .trackers
            .read()
            .await
            .iter()
            .filter(|(_, handle)| handle.subscribed == subscribed)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Watches an untracked list again.
    ///
    /// The new watch replays the list, and its tracker reports the rebuilt
    /// metadata as an update. Does nothing for a list that is tracked.
    ///
    /// # Errors
    ///
    /// - [`EngineError::RegistryStopped`] if the registry loop has ended
    /// - [`EngineError::UnknownList`] if the list is not registered or its
    ///   collection is gone
    /// - [`EngineError::Store`] if the watch cannot be established
    pub async fn resubscribe(&self, list_id: &str) -> Result<()> {
        self.ensure_running()?;
        resubscribe(&self.ctx, &self.trackers, list_id).await
    }

    /// Returns `true` while the registry loop is consuming its watch.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Fails with [`EngineError::RegistryStopped`] once the registry loop
    /// has ended.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::RegistryStopped)
        }
    }

    /// Stops the registry and every tracker without touching stored data.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!(error = %e, "Registry loop panicked");
        }
        self.ctx.store.unwatch(self.watch_id).await;

        let handles: Vec<(ListId, TrackerHandle)> = self.trackers.write().await.drain().collect();
        for (list_id, handle) in handles {
            let _ = handle.commands.send(TrackerCommand::CancelWatch).await;
            self.ctx.store.unwatch(handle.watch_id).await;
            let (ack, acked) = oneshot::channel();
            if handle.commands.send(TrackerCommand::Disable { ack }).await.is_ok() {
                let _ = acked.await;
            }
            let _ = handle.task.await;
            debug!(list_id = %list_id, "Tracker closed");
        }

        info!("Registry stopped");
    }
}

/// State owned by the registry task.
struct RegistryLoop {
    ctx: EngineContext,
    listener: Arc<dyn ListEventListener<ListMetadata>>,
    trackers: TrackerMap,
    coalescer: BatchCoalescer,
    failures: mpsc::UnboundedSender<TrackerFailure>,
}

impl RegistryLoop {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<WatchItem>,
        mut failures: mpsc::UnboundedReceiver<TrackerFailure>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Registry received shutdown signal");
                    break;
                }

                Some(failure) = failures.recv() => self.untrack(failure).await,

                item = events.recv() => {
                    let Some(item) = item else {
                        debug!("Registry watch ended");
                        break;
                    };
                    match self.coalescer.push(item) {
                        Ok(Some(batch)) => {
                            for event in batch {
                                self.handle_event(event).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_benign() => {
                            debug!(error = %e, "Registry watch closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Registry watch failed, registry stopped");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let list_id = event.row_key;
        let subscribed = self
            .trackers
            .read()
            .await
            .get(&list_id)
            .map(|handle| handle.subscribed);

        match (event.kind, subscribed) {
            (ChangeKind::Put, None) => self.track(list_id).await,
            (ChangeKind::Put, Some(true)) => {
                warn!(list_id = %list_id, "Registry put for a list that is already tracked");
            }
            (ChangeKind::Put, Some(false)) => {
                if let Err(e) = resubscribe(&self.ctx, &self.trackers, &list_id).await {
                    warn!(list_id = %list_id, error = %e, "Cannot resubscribe list");
                }
            }
            (ChangeKind::Delete, Some(_)) => self.teardown(&list_id).await,
            (ChangeKind::Delete, None) => {
                debug!(list_id = %list_id, "Ignoring delete of untracked list");
            }
        }
    }

    /// Marks a list whose watch failed as untracked.
    async fn untrack(&self, failure: TrackerFailure) {
        let watch_id = {
            let mut trackers = self.trackers.write().await;
            let Some(handle) = trackers.get_mut(&failure.list_id) else {
                return;
            };
            if !handle.subscribed {
                return;
            }
            handle.subscribed = false;
            handle.watch_id
        };
        self.ctx.store.unwatch(watch_id).await;
        warn!(
            list_id = %failure.list_id,
            error = %failure.error,
            "List watch failed, list untracked until resubscribed"
        );
    }

    async fn track(&self, list_id: ListId) {
        let watch = match self.ctx.store.watch(&list_id).await {
            Ok(watch) => watch,
            Err(StoreError::NotFound(_)) => {
                // Not retried; a later registry put for the id tracks it.
                debug!(list_id = %list_id, "List collection missing, not tracking it");
                return;
            }
            Err(e) => {
                warn!(list_id = %list_id, error = %e, "Cannot watch list, not tracking it");
                return;
            }
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let tracker = ListTracker::new(list_id.clone(), self.listener.clone());
        let actor = TrackerActor::new(tracker, watch.events, command_rx)
            .report_failures_to(self.failures.clone());
        let task = tokio::spawn(actor.run());

        debug!(list_id = %list_id, watch_id = watch.id, "Tracking list");
        self.trackers.write().await.insert(
            list_id,
            TrackerHandle {
                watch_id: watch.id,
                subscribed: true,
                commands,
                task,
            },
        );
    }

    async fn teardown(&self, list_id: &str) {
        let (watch_id, commands) = {
            let trackers = self.trackers.read().await;
            let Some(handle) = trackers.get(list_id) else {
                return;
            };
            (handle.watch_id, handle.commands.clone())
        };

        // 1. Stop the feed before anything can observe the destroy.
        if commands.send(TrackerCommand::CancelWatch).await.is_err() {
            debug!(list_id, "Tracker already exited before cancel");
        }
        self.ctx.store.unwatch(watch_id).await;

        // 2.
        match self.ctx.store.destroy_collection(list_id).await {
            Ok(()) => {}
            Err(e) if e.is_benign() => debug!(list_id, error = %e, "List collection already gone"),
            Err(e) => error!(list_id, error = %e, "Failed to destroy list collection"),
        }

        // 3.
        let (ack, acked) = oneshot::channel();
        if commands.send(TrackerCommand::Disable { ack }).await.is_ok() {
            let _ = acked.await;
        }

        // 4.
        self.listener.on_item_delete(list_id);

        // 5.
        let removed = self.trackers.write().await.remove(list_id);
        if let Some(handle) = removed {
            let _ = handle.task.await;
        }
        debug!(list_id, "List torn down");
    }
}

/// Watches an untracked list again and hands the feed to its tracker.
async fn resubscribe(ctx: &EngineContext, trackers: &TrackerMap, list_id: &str) -> Result<()> {
    let mut trackers = trackers.write().await;
    let handle = trackers
        .get_mut(list_id)
        .ok_or_else(|| EngineError::UnknownList(list_id.to_string()))?;
    if handle.subscribed {
        return Ok(());
    }

    let watch = ctx
        .store
        .watch(list_id)
        .await
        .map_err(|e| txn::unknown_list(list_id, e))?;
    let command = TrackerCommand::Resubscribe {
        events: watch.events,
    };
    if handle.commands.send(command).await.is_err() {
        ctx.store.unwatch(watch.id).await;
        return Err(EngineError::UnknownList(list_id.to_string()));
    }

    handle.watch_id = watch.id;
    handle.subscribed = true;
    info!(list_id, watch_id = watch.id, "List resubscribed");
    Ok(())
}
