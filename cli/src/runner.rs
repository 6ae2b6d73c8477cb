//! Script replay against a fresh in-memory engine.
//!
//! The runner starts a [`Registry`] over a new [`MemoryStore`], subscribes
//! to a [`ListEventBroadcaster`], executes the script's steps through
//! [`TodoOps`], and writes every list event as one JSON line. List ids in the
//! output are replaced by their script aliases so that output is stable
//! across runs.
//!
//! [`MemoryStore`]: todos_engine::MemoryStore

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use todos_engine::{
    BulkOutcome, Config, EngineContext, ListEvent, ListEventBroadcaster, ListId, ListMetadata,
    Registry, RegistryHandle, TaskId, TodoOps,
};

use crate::script::{Script, Step};

/// How long the event feed must stay silent before a settle completes.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(50);

/// Counters reported after a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub steps: usize,
    pub events: usize,
}

/// Executes scripts and prints the resulting list events.
pub struct Runner<W: Write> {
    ops: TodoOps,
    registry: RegistryHandle,
    events: Receiver<ListEvent<ListMetadata>>,
    out: W,
    quiet_period: Duration,
    lists: HashMap<String, ListId>,
    aliases: HashMap<ListId, String>,
    tasks: HashMap<(String, String), TaskId>,
    emitted: usize,
}

impl<W: Write> Runner<W> {
    /// Starts an engine over a fresh in-memory store.
    pub async fn start(config: Config, out: W) -> Result<Self> {
        let capacity = config.event_capacity;
        let (ctx, _store) = EngineContext::in_memory(config);
        let broadcaster = ListEventBroadcaster::with_capacity(capacity);
        let events = broadcaster.subscribe();
        let registry = Registry::start(ctx.clone(), Arc::new(broadcaster))
            .await
            .context("Failed to start registry")?;

        Ok(Self {
            ops: TodoOps::new(ctx),
            registry,
            events,
            out,
            quiet_period: DEFAULT_QUIET_PERIOD,
            lists: HashMap::new(),
            aliases: HashMap::new(),
            tasks: HashMap::new(),
            emitted: 0,
        })
    }

    /// Overrides the settle quiet period.
    #[must_use]
    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    /// Runs every step, settles, and shuts the engine down.
    pub async fn replay(mut self, script: &Script) -> Result<(ReplaySummary, W)> {
        for (i, step) in script.steps.iter().enumerate() {
            debug!(step = i + 1, ?step, "Running step");
            self.run_step(step)
                .await
                .with_context(|| format!("Step {} failed", i + 1))?;
        }
        self.settle().await?;

        let summary = ReplaySummary {
            steps: script.steps.len(),
            events: self.emitted,
        };
        self.registry.shutdown().await;
        info!(steps = summary.steps, events = summary.events, "Replay finished");
        Ok((summary, self.out))
    }

    async fn run_step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::CreateList { alias, name } => {
                let id = self.ops.create_list(name).await?;
                self.aliases.insert(id.clone(), alias.clone());
                self.lists.insert(alias.clone(), id);
            }
            Step::RenameList { list, name } => {
                let id = self.list_id(list)?;
                self.ops.update_list_spec(&id, name).await?;
            }
            Step::DeleteList { list } => {
                let id = self.list_id(list)?;
                self.ops.delete_list(&id).await?;
                self.lists.remove(list);
                self.tasks.retain(|(l, _), _| l != list);
            }
            Step::AddTask { list, alias, text } => {
                let id = self.list_id(list)?;
                let task_id = self.ops.add_task(&id, text).await?;
                self.tasks.insert((list.clone(), alias.clone()), task_id);
            }
            Step::UpdateTask {
                list,
                task,
                text,
                done,
            } => {
                let id = self.list_id(list)?;
                let task_id = self.task_id(list, task)?;
                let mut current = self.ops.get_task(&id, &task_id).await?;
                if let Some(text) = text {
                    current.text = text.clone();
                }
                if let Some(done) = done {
                    current.done = *done;
                }
                self.ops.update_task(&id, &current).await?;
            }
            Step::DeleteTask { list, task } => {
                let id = self.list_id(list)?;
                let task_id = self.task_id(list, task)?;
                self.ops.delete_task(&id, &task_id).await?;
                self.tasks.remove(&(list.clone(), task.clone()));
            }
            Step::CompleteAll { list } => {
                let id = self.list_id(list)?;
                match self.ops.complete_all_tasks(&id).await? {
                    BulkOutcome::Completed { updated, attempts } => {
                        debug!(list = %list, updated, attempts, "Completed all tasks")
                    }
                    BulkOutcome::AlreadyComplete => debug!(list = %list, "Nothing to complete"),
                }
            }
            Step::Settle => self.settle().await?,
        }
        Ok(())
    }

    /// Drains list events until none arrives for the quiet period.
    async fn settle(&mut self) -> Result<()> {
        loop {
            match timeout(self.quiet_period, self.events.recv()).await {
                Ok(Ok(event)) => self.emit(event)?,
                Ok(Err(RecvError::Lagged(missed))) => {
                    warn!(missed, "Event output lagged, some list events were dropped");
                }
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }
        self.registry.ensure_running()?;
        Ok(())
    }

    fn emit(&mut self, event: ListEvent<ListMetadata>) -> Result<()> {
        let event = match event {
            ListEvent::Added(meta) => ListEvent::Added(self.with_alias(meta)),
            ListEvent::Updated(meta) => ListEvent::Updated(self.with_alias(meta)),
            ListEvent::Deleted(id) => ListEvent::Deleted(self.alias_of(&id)),
        };
        serde_json::to_writer(&mut self.out, &event).context("Failed to encode list event")?;
        writeln!(self.out).context("Failed to write list event")?;
        self.emitted += 1;
        Ok(())
    }

    fn with_alias(&self, mut meta: ListMetadata) -> ListMetadata {
        meta.id = self.alias_of(&meta.id);
        meta
    }

    fn alias_of(&self, id: &str) -> String {
        self.aliases
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn list_id(&self, alias: &str) -> Result<ListId> {
        self.lists
            .get(alias)
            .cloned()
            .with_context(|| format!("Unknown list alias '{alias}'"))
    }

    fn task_id(&self, list: &str, alias: &str) -> Result<TaskId> {
        self.tasks
            .get(&(list.to_string(), alias.to_string()))
            .cloned()
            .with_context(|| format!("Unknown task alias '{alias}' in list '{list}'"))
    }
}

/// Replays `script` on a fresh engine, writing events to `out`.
pub async fn replay<W: Write>(script: &Script, config: Config, out: W) -> Result<ReplaySummary> {
    let runner = Runner::start(config, out).await?;
    let (summary, _out) = runner.replay(script).await?;
    Ok(summary)
}
