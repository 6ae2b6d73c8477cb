//! Per-list metadata tracking.
//!
//! A [`ListTracker`] folds the change log of one list collection into a
//! [`ListMetadata`] record and reports it to a listener once per closed
//! batch: the first report is an add, every later one an update.
//!
//! Each tracker is owned by a [`TrackerActor`], a task that consumes the
//! list's watch feed and a command channel. Teardown reaches the tracker only
//! through that channel, so applying a batch and disabling the tracker can
//! never interleave.
//!
//! ```text
//!   watch feed ──► BatchCoalescer ──► ListTracker::apply_batch ──► listener
//!                                           ▲
//!   registry ──► TrackerCommand ────────────┘ (CancelWatch / Disable)
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::aggregator::{TaskCounts, TaskSetAggregator};
use crate::coalescer::{BatchCoalescer, BatchSink};
use crate::error::StoreError;
use crate::listener::ListEventListener;
use crate::store::{ChangeEvent, ChangeKind, WatchItem};
use crate::types::{ListId, ListMetadata, ListSpec, TaskSpec, LIST_SPEC_ROW};

/// Lifecycle phase of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    /// Receiving batches. `has_emitted_add` records whether the listener has
    /// already been told about this list.
    Tracked { has_emitted_add: bool },
    /// The list was deleted; every further batch is discarded.
    Disabled,
}

/// Aggregated view of one todo list.
pub struct ListTracker {
    list_id: ListId,
    spec: Option<ListSpec>,
    tasks: TaskSetAggregator,
    phase: TrackerPhase,
    listener: Arc<dyn ListEventListener<ListMetadata>>,
}

impl ListTracker {
    /// Creates a tracker that has seen nothing yet.
    pub fn new(
        list_id: impl Into<ListId>,
        listener: Arc<dyn ListEventListener<ListMetadata>>,
    ) -> Self {
        Self {
            list_id: list_id.into(),
            spec: None,
            tasks: TaskSetAggregator::new(),
            phase: TrackerPhase::Tracked {
                has_emitted_add: false,
            },
            listener,
        }
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn counts(&self) -> TaskCounts {
        self.tasks.snapshot_counts()
    }

    /// Current metadata, or `None` until the spec row has been seen.
    pub fn metadata(&self) -> Option<ListMetadata> {
        let spec = self.spec.as_ref()?;
        let counts = self.tasks.snapshot_counts();
        Some(ListMetadata {
            id: self.list_id.clone(),
            name: spec.name.clone(),
            updated_at: spec.updated_at,
            num_tasks: counts.num_tasks,
            num_completed: counts.num_completed,
        })
    }

    /// Stops all further listener calls.
    pub fn disable(&mut self) {
        if self.phase != TrackerPhase::Disabled {
            debug!(list_id = %self.list_id, "Tracker disabled");
            self.phase = TrackerPhase::Disabled;
        }
    }

    /// Applies one closed batch and notifies the listener.
    ///
    /// Batches reach a tracker only through this method or its
    /// [`BatchSink`] implementation, and both drop the batch untouched once
    /// the tracker is disabled. A batch that closes before the list's spec
    /// row has ever been seen updates the counts but emits nothing, so the
    /// first report is the add carrying every task seen so far.
    pub fn apply_batch(&mut self, batch: Vec<ChangeEvent>) {
        if self.phase == TrackerPhase::Disabled {
            trace!(
                list_id = %self.list_id,
                events = batch.len(),
                "Dropping batch for disabled tracker"
            );
            return;
        }
        for event in batch {
            self.apply_event(event);
        }
        self.report();
    }

    /// Reports the current metadata once the spec is known.
    fn report(&mut self) {
        let TrackerPhase::Tracked { has_emitted_add } = self.phase else {
            return;
        };
        let Some(metadata) = self.metadata() else {
            trace!(list_id = %self.list_id, "No list spec yet, nothing to report");
            return;
        };

        trace!(
            list_id = %self.list_id,
            num_tasks = metadata.num_tasks,
            num_completed = metadata.num_completed,
            "List batch applied"
        );

        if has_emitted_add {
            self.listener.on_item_update(metadata);
        } else {
            self.phase = TrackerPhase::Tracked {
                has_emitted_add: true,
            };
            self.listener.on_item_add(metadata);
        }
    }

    /// Forgets every row while keeping the phase, before a fresh watch
    /// replays the collection.
    fn clear_rows(&mut self) {
        self.spec = None;
        self.tasks = TaskSetAggregator::new();
    }

    fn apply_event(&mut self, event: ChangeEvent) {
        if event.row_key == LIST_SPEC_ROW {
            match event.kind {
                ChangeKind::Put => match event.decode::<ListSpec>() {
                    Ok(Some(spec)) => self.spec = Some(spec),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(list_id = %self.list_id, error = %e, "Skipping undecodable list spec")
                    }
                },
                // Deletion of the list is reported by the registry.
                ChangeKind::Delete => {
                    debug!(list_id = %self.list_id, "Ignoring delete of list spec row")
                }
            }
            return;
        }

        match event.kind {
            ChangeKind::Put => match event.decode::<TaskSpec>() {
                Ok(Some(task)) => self.tasks.apply_put(&event.row_key, task.done),
                Ok(None) => {}
                Err(e) => warn!(
                    list_id = %self.list_id,
                    task_id = %event.row_key,
                    error = %e,
                    "Skipping undecodable task row"
                ),
            },
            ChangeKind::Delete => self.tasks.apply_delete(&event.row_key),
        }
    }
}

impl BatchSink for ListTracker {
    fn apply(&mut self, event: ChangeEvent) {
        if self.phase != TrackerPhase::Disabled {
            self.apply_event(event);
        }
    }

    fn on_batch_closed(&mut self) {
        self.report();
    }
}

/// A list watch that failed for a reason other than its collection being
/// destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerFailure {
    pub list_id: ListId,
    pub error: StoreError,
}

/// Control messages sent to a [`TrackerActor`].
#[derive(Debug)]
pub enum TrackerCommand {
    /// Stop consuming the watch feed, dropping anything still queued.
    CancelWatch,
    /// Enter [`TrackerPhase::Disabled`], acknowledge, and exit.
    Disable { ack: oneshot::Sender<()> },
    /// Replace a failed feed with a fresh watch of the same collection.
    ///
    /// Rows are rebuilt from the new watch's replay; a tracker that already
    /// reported its add keeps reporting updates.
    Resubscribe {
        events: mpsc::UnboundedReceiver<WatchItem>,
    },
}

/// Task driving one [`ListTracker`].
pub struct TrackerActor {
    tracker: ListTracker,
    events: Option<mpsc::UnboundedReceiver<WatchItem>>,
    commands: mpsc::Receiver<TrackerCommand>,
    coalescer: BatchCoalescer,
    failures: Option<mpsc::UnboundedSender<TrackerFailure>>,
}

impl TrackerActor {
    pub fn new(
        tracker: ListTracker,
        events: mpsc::UnboundedReceiver<WatchItem>,
        commands: mpsc::Receiver<TrackerCommand>,
    ) -> Self {
        Self {
            tracker,
            events: Some(events),
            commands,
            coalescer: BatchCoalescer::new(),
            failures: None,
        }
    }

    /// Reports a failed watch feed on `failures`, once per feed.
    #[must_use]
    pub fn report_failures_to(mut self, failures: mpsc::UnboundedSender<TrackerFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Runs until disabled or until the command channel closes, returning
    /// the final tracker.
    ///
    /// Commands always win over watch items that are ready at the same time.
    pub async fn run(mut self) -> ListTracker {
        debug!(list_id = %self.tracker.list_id(), "Tracker started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(TrackerCommand::CancelWatch) => {
                        debug!(
                            list_id = %self.tracker.list_id(),
                            buffered = self.coalescer.pending(),
                            "Watch cancelled"
                        );
                        self.events = None;
                        self.coalescer = BatchCoalescer::new();
                    }
                    Some(TrackerCommand::Resubscribe { events }) => {
                        debug!(list_id = %self.tracker.list_id(), "Watch resubscribed");
                        self.tracker.clear_rows();
                        self.events = Some(events);
                        self.coalescer = BatchCoalescer::new();
                    }
                    Some(TrackerCommand::Disable { ack }) => {
                        self.tracker.disable();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!(list_id = %self.tracker.list_id(), "Command channel closed");
                        break;
                    }
                },

                item = next_item(&mut self.events) => match item {
                    Some(item) => self.on_item(item),
                    None => {
                        debug!(list_id = %self.tracker.list_id(), "Watch feed ended");
                        self.events = None;
                    }
                },
            }
        }

        debug!(list_id = %self.tracker.list_id(), "Tracker stopped");
        self.tracker
    }

    fn on_item(&mut self, item: WatchItem) {
        match self.coalescer.feed(item, &mut self.tracker) {
            Ok(_) => {}
            Err(e) if e.is_benign() => {
                debug!(list_id = %self.tracker.list_id(), error = %e, "List watch ended");
                self.events = None;
            }
            Err(e) => {
                error!(list_id = %self.tracker.list_id(), error = %e, "List watch failed");
                self.events = None;
                if let Some(failures) = &self.failures {
                    let failure = TrackerFailure {
                        list_id: self.tracker.list_id().to_string(),
                        error: e,
                    };
                    let _ = failures.send(failure);
                }
            }
        }
    }
}

/// Next item of an optional feed; pends forever once the feed is gone.
async fn next_item(events: &mut Option<mpsc::UnboundedReceiver<WatchItem>>) -> Option<WatchItem> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, ListEvent};
    use crate::types::TaskId;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn spec_row(name: &str, continued: bool) -> ChangeEvent {
        let spec = ListSpec {
            name: name.to_string(),
            updated_at: Utc.with_ymd_and_hms(2016, 5, 4, 12, 0, 0).unwrap(),
        };
        ChangeEvent::put("l1", LIST_SPEC_ROW, serde_json::to_vec(&spec).unwrap(), continued)
    }

    fn task_row(id: &str, done: bool, continued: bool) -> ChangeEvent {
        let spec = TaskSpec {
            text: format!("task {id}"),
            added_at: Utc::now(),
            done,
        };
        ChangeEvent::put("l1", id, serde_json::to_vec(&spec).unwrap(), continued)
    }

    fn tracker() -> (ListTracker, mpsc::UnboundedReceiver<ListEvent<ListMetadata>>) {
        let (listener, rx) = ChannelListener::new();
        (ListTracker::new("l1", Arc::new(listener)), rx)
    }

    fn counts_of(event: &ListEvent<ListMetadata>) -> (usize, usize) {
        match event {
            ListEvent::Added(m) | ListEvent::Updated(m) => (m.num_tasks, m.num_completed),
            ListEvent::Deleted(_) => panic!("unexpected delete"),
        }
    }

    // ========================================================================
    // ListTracker
    // ========================================================================

    #[test]
    fn nothing_emitted_before_spec() {
        let (mut t, mut rx) = tracker();
        t.apply_batch(vec![task_row("a1", true, false)]);
        assert!(rx.try_recv().is_err());
        assert_eq!(t.phase(), TrackerPhase::Tracked { has_emitted_add: false });
        assert_eq!(t.counts().num_tasks, 1);
    }

    #[test]
    fn first_batch_is_add_then_updates() {
        let (mut t, mut rx) = tracker();
        t.apply_batch(vec![spec_row("Chores", false)]);
        t.apply_batch(vec![task_row("a1", false, false)]);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, ListEvent::Added(ref m) if m.name == "Chores"));
        assert_eq!(counts_of(&first), (0, 0));

        let second = rx.try_recv().unwrap();
        assert!(matches!(second, ListEvent::Updated(_)));
        assert_eq!(counts_of(&second), (1, 0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn multi_event_batch_reports_once() {
        let (mut t, mut rx) = tracker();
        t.apply_batch(vec![
            spec_row("Chores", true),
            task_row("a1", false, true),
            task_row("a2", true, false),
        ]);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ListEvent::Added(_)));
        assert_eq!(counts_of(&event), (2, 1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn undecodable_rows_are_skipped() {
        let (mut t, mut rx) = tracker();
        t.apply_batch(vec![
            spec_row("Chores", true),
            ChangeEvent::put("l1", "bad", b"not json".to_vec(), true),
            task_row("a1", true, false),
        ]);
        assert_eq!(counts_of(&rx.try_recv().unwrap()), (1, 1));
    }

    #[test]
    fn spec_row_delete_is_ignored() {
        let (mut t, mut rx) = tracker();
        t.apply_batch(vec![spec_row("Chores", false)]);
        t.apply_batch(vec![ChangeEvent::delete("l1", LIST_SPEC_ROW, false)]);
        rx.try_recv().unwrap();
        let update = rx.try_recv().unwrap();
        assert!(matches!(update, ListEvent::Updated(ref m) if m.name == "Chores"));
    }

    #[test]
    fn disabled_tracker_is_silent() {
        let (mut t, mut rx) = tracker();
        t.apply_batch(vec![spec_row("Chores", false)]);
        rx.try_recv().unwrap();

        t.disable();
        t.apply_batch(vec![task_row("a1", true, false)]);

        assert!(rx.try_recv().is_err());
        assert_eq!(t.counts().num_tasks, 0);
        assert_eq!(t.phase(), TrackerPhase::Disabled);
    }

    /// One randomly generated row write: `Some(done)` puts the task,
    /// `None` deletes it.
    fn random_write(rng: &mut StdRng) -> (TaskId, Option<bool>) {
        let id = format!("t{}", rng.random_range(0..5));
        let done = (!rng.random_bool(0.3)).then(|| rng.random_bool(0.5));
        (id, done)
    }

    #[test]
    fn random_batches_match_model() {
        for seed in 0..32u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (mut t, mut rx) = tracker();
            let mut coalescer = BatchCoalescer::new();

            let mut model: HashMap<TaskId, bool> = HashMap::new();
            let mut pending: Vec<(TaskId, Option<bool>)> = Vec::new();
            let mut reports = 0;

            let mut feed = vec![(None, spec_row("Chores", rng.random_bool(0.5)))];
            for i in 0..200 {
                let (id, done) = random_write(&mut rng);
                let continued = i < 199 && rng.random_bool(0.6);
                let event = match done {
                    Some(done) => task_row(&id, done, continued),
                    None => ChangeEvent::delete("l1", id.as_str(), continued),
                };
                feed.push((Some((id, done)), event));
            }

            for (write, event) in feed {
                pending.extend(write);
                let closed = coalescer.feed(Ok(event), &mut t).unwrap();
                if !closed {
                    assert!(rx.try_recv().is_err(), "seed {seed}: report inside a batch");
                    continue;
                }

                for (id, done) in pending.drain(..) {
                    match done {
                        Some(done) => model.insert(id, done),
                        None => model.remove(&id),
                    };
                }
                let expected = (model.len(), model.values().filter(|done| **done).count());

                let event = rx.try_recv().unwrap();
                if reports == 0 {
                    assert!(matches!(event, ListEvent::Added(_)), "seed {seed}");
                } else {
                    assert!(matches!(event, ListEvent::Updated(_)), "seed {seed}");
                }
                assert_eq!(counts_of(&event), expected, "seed {seed}");
                assert!(rx.try_recv().is_err(), "seed {seed}: more than one report");
                reports += 1;
            }

            assert!(reports > 0, "seed {seed}");
            assert!(pending.is_empty());
        }
    }

    // ========================================================================
    // TrackerActor
    // ========================================================================

    #[tokio::test]
    async fn actor_applies_batches_from_feed() {
        let (t, mut rx) = tracker();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(TrackerActor::new(t, feed_rx, cmd_rx).run());

        feed_tx.send(Ok(spec_row("Chores", true))).unwrap();
        feed_tx.send(Ok(task_row("a1", false, false))).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(counts_of(&event), (1, 0));

        let (ack, acked) = oneshot::channel();
        cmd_tx.send(TrackerCommand::Disable { ack }).await.unwrap();
        acked.await.unwrap();
        let tracker = task.await.unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::Disabled);
    }

    #[tokio::test]
    async fn queued_update_is_dropped_when_cancelled_first() {
        let (t, mut rx) = tracker();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);

        // A batch queued on the feed before the actor ever runs.
        feed_tx.send(Ok(spec_row("Chores", false))).unwrap();
        let (ack, acked) = oneshot::channel();
        cmd_tx.send(TrackerCommand::CancelWatch).await.unwrap();
        cmd_tx.send(TrackerCommand::Disable { ack }).await.unwrap();

        let tracker = TrackerActor::new(t, feed_rx, cmd_rx).run().await;

        acked.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(tracker.metadata().is_none());
    }

    #[tokio::test]
    async fn transport_error_stops_feed_but_not_commands() {
        let (t, mut rx) = tracker();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(TrackerActor::new(t, feed_rx, cmd_rx).run());

        feed_tx.send(Ok(spec_row("Chores", true))).unwrap();
        feed_tx.send(Err(StoreError::transport("reset"))).unwrap();
        let _ = feed_tx.send(Ok(spec_row("Later", false)));

        let (ack, acked) = oneshot::channel();
        cmd_tx.send(TrackerCommand::Disable { ack }).await.unwrap();
        acked.await.unwrap();
        task.await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn actor_exits_when_command_channel_closes() {
        let (t, _rx) = tracker();
        let (_feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        drop(cmd_tx);

        let tracker = TrackerActor::new(t, feed_rx, cmd_rx).run().await;
        assert_eq!(tracker.phase(), TrackerPhase::Tracked { has_emitted_add: false });
    }

    #[tokio::test]
    async fn failed_feed_is_reported_once() {
        let (t, mut rx) = tracker();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let actor = TrackerActor::new(t, feed_rx, cmd_rx).report_failures_to(failures_tx);
        tokio::spawn(actor.run());

        feed_tx.send(Ok(spec_row("Chores", false))).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), ListEvent::Added(_)));

        feed_tx.send(Err(StoreError::transport("reset"))).unwrap();
        feed_tx.send(Err(StoreError::transport("reset again"))).unwrap();

        let failure = failures_rx.recv().await.unwrap();
        assert_eq!(
            failure,
            TrackerFailure {
                list_id: "l1".to_string(),
                error: StoreError::transport("reset"),
            }
        );
        tokio::task::yield_now().await;
        assert!(failures_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn benign_feed_end_is_not_reported() {
        let (t, _rx) = tracker();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let actor = TrackerActor::new(t, feed_rx, cmd_rx).report_failures_to(failures_tx);
        let task = tokio::spawn(actor.run());

        feed_tx.send(Err(StoreError::not_found("l1"))).unwrap();

        let (ack, acked) = oneshot::channel();
        cmd_tx.send(TrackerCommand::Disable { ack }).await.unwrap();
        acked.await.unwrap();
        task.await.unwrap();

        assert!(failures_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn resubscribe_rebuilds_rows_and_keeps_reporting_updates() {
        let (t, mut rx) = tracker();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let actor = TrackerActor::new(t, feed_rx, cmd_rx).report_failures_to(failures_tx);
        let task = tokio::spawn(actor.run());

        feed_tx.send(Ok(spec_row("Chores", true))).unwrap();
        feed_tx.send(Ok(task_row("a1", true, false))).unwrap();
        assert_eq!(counts_of(&rx.recv().await.unwrap()), (1, 1));

        feed_tx.send(Err(StoreError::transport("reset"))).unwrap();
        failures_rx.recv().await.unwrap();

        // Replay of the list as it is now: a1 was deleted during the outage.
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        replay_tx.send(Ok(spec_row("Chores", true))).unwrap();
        replay_tx.send(Ok(task_row("a2", false, false))).unwrap();
        cmd_tx
            .send(TrackerCommand::Resubscribe { events: replay_rx })
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ListEvent::Updated(_)));
        assert_eq!(counts_of(&event), (1, 0));

        let (ack, acked) = oneshot::channel();
        cmd_tx.send(TrackerCommand::Disable { ack }).await.unwrap();
        acked.await.unwrap();
        let tracker = task.await.unwrap();
        assert_eq!(tracker.phase(), TrackerPhase::Disabled);
    }
}
