//! Mutating API.
//!
//! [`TodoOps`] is the write side of the engine. It never updates derived
//! state directly: every change is written to the store and observed back
//! through the watch path like any other writer's.
//!
//! Task mutations rewrite the task row and bump the list's `updated_at` in
//! one transaction, so trackers see a single batch and report a single
//! update. Writes to a list are optimistic (see [`txn`](crate::txn)): a
//! concurrent rename or task deletion is never overwritten.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::bulk::{self, BulkOutcome};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::store::{Snapshot, Write};
use crate::txn::{self, Plan};
use crate::types::{ListId, ListSpec, Task, TaskId, TaskSpec, LIST_SPEC_ROW};

/// Sentinel value stored in the registry collection.
const REGISTRY_SENTINEL: &[u8] = b"true";

/// Write operations on lists and tasks.
#[derive(Debug, Clone)]
pub struct TodoOps {
    ctx: EngineContext,
}

impl TodoOps {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Creates a list and registers it.
    ///
    /// The list collection is created with its spec row before the registry
    /// row is written, so a tracker never watches a missing collection.
    pub async fn create_list(&self, name: &str) -> Result<ListId> {
        let list_id = Uuid::new_v4().to_string();
        let spec = serde_json::to_vec(&ListSpec::new(name))?;
        self.ctx
            .store
            .create_collection(&list_id, vec![(LIST_SPEC_ROW.to_string(), spec)])
            .await?;
        self.ctx
            .store
            .put(
                self.ctx.registry_collection(),
                &list_id,
                REGISTRY_SENTINEL.to_vec(),
            )
            .await?;
        debug!(list_id = %list_id, name, "Created list");
        Ok(list_id)
    }

    /// Deletes a list.
    ///
    /// Only the registry row is removed here; the registry tears the list
    /// down, including its collection, when it observes the delete.
    pub async fn delete_list(&self, list_id: &str) -> Result<()> {
        let registry = self.ctx.registry_collection();
        if self.ctx.store.get(registry, list_id).await?.is_none() {
            return Err(EngineError::UnknownList(list_id.to_string()));
        }
        self.ctx.store.delete(registry, list_id).await?;
        debug!(list_id, "Deleted list");
        Ok(())
    }

    /// Reads a list's spec row.
    pub async fn list_spec(&self, list_id: &str) -> Result<ListSpec> {
        let raw = self
            .ctx
            .store
            .get(list_id, LIST_SPEC_ROW)
            .await
            .map_err(|e| txn::unknown_list(list_id, e))?
            .ok_or_else(|| EngineError::UnknownList(list_id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Renames a list.
    pub async fn update_list_spec(&self, list_id: &str, name: &str) -> Result<()> {
        txn::run(&self.ctx, list_id, |snapshot| {
            txn::list_spec(list_id, snapshot)?;
            let spec = ListSpec {
                name: name.to_string(),
                updated_at: Utc::now(),
            };
            Ok(Plan::Commit {
                writes: vec![Write::put_json(LIST_SPEC_ROW, &spec)?],
                value: (),
            })
        })
        .await?;
        debug!(list_id, name, "Renamed list");
        Ok(())
    }

    /// Reads one task.
    pub async fn get_task(&self, list_id: &str, task_id: &str) -> Result<Task> {
        let raw = self
            .ctx
            .store
            .get(list_id, task_id)
            .await
            .map_err(|e| txn::unknown_list(list_id, e))?;
        match raw {
            Some(raw) if task_id != LIST_SPEC_ROW => {
                Ok(Task::from_spec(task_id, serde_json::from_slice(&raw)?))
            }
            _ => Err(unknown_task(list_id, task_id)),
        }
    }

    /// Adds an open task, returning its id.
    pub async fn add_task(&self, list_id: &str, text: &str) -> Result<TaskId> {
        let task_id = Uuid::new_v4().to_string();
        let spec = TaskSpec::new(text);
        txn::run(&self.ctx, list_id, |snapshot| {
            let write = Write::put_json(task_id.as_str(), &spec)?;
            Plan::touching(list_id, snapshot, write, ())
        })
        .await?;
        debug!(list_id, task_id = %task_id, "Added task");
        Ok(task_id)
    }

    /// Overwrites an existing task.
    ///
    /// Fails with [`EngineError::UnknownTask`] if the task is gone by the
    /// time the write commits.
    pub async fn update_task(&self, list_id: &str, task: &Task) -> Result<()> {
        let spec = task.to_spec();
        txn::run(&self.ctx, list_id, |snapshot| {
            require_task(list_id, &task.id, snapshot)?;
            let write = Write::put_json(task.id.as_str(), &spec)?;
            Plan::touching(list_id, snapshot, write, ())
        })
        .await?;
        debug!(list_id, task_id = %task.id, done = task.done, "Updated task");
        Ok(())
    }

    /// Deletes an existing task.
    pub async fn delete_task(&self, list_id: &str, task_id: &str) -> Result<()> {
        txn::run(&self.ctx, list_id, |snapshot| {
            require_task(list_id, task_id, snapshot)?;
            let write = Write::Delete {
                row_key: task_id.to_string(),
            };
            Plan::touching(list_id, snapshot, write, ())
        })
        .await?;
        debug!(list_id, task_id, "Deleted task");
        Ok(())
    }

    /// Marks every task of the list as done.
    pub async fn complete_all_tasks(&self, list_id: &str) -> Result<BulkOutcome> {
        bulk::complete_all_tasks(&self.ctx, list_id).await
    }
}

fn unknown_task(list_id: &str, task_id: &str) -> EngineError {
    EngineError::UnknownTask {
        list_id: list_id.to_string(),
        task_id: task_id.to_string(),
    }
}

/// Fails unless `task_id` is a task row of the snapshot.
fn require_task(list_id: &str, task_id: &str, snapshot: &Snapshot) -> Result<()> {
    if task_id != LIST_SPEC_ROW && snapshot.rows.contains_key(task_id) {
        Ok(())
    } else {
        Err(unknown_task(list_id, task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::StoreError;

    fn ops() -> TodoOps {
        let (ctx, _store) = EngineContext::in_memory(Config::default());
        TodoOps::new(ctx)
    }

    async fn registry_has(ops: &TodoOps, list_id: &str) -> bool {
        let ctx = &ops.ctx;
        ctx.store
            .get(ctx.registry_collection(), list_id)
            .await
            .unwrap()
            .is_some()
    }

    async fn ensure_registry(ops: &TodoOps) {
        let ctx = &ops.ctx;
        ctx.store
            .create_collection(ctx.registry_collection(), Vec::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_list_writes_spec_and_registry_row() {
        let ops = ops();
        ensure_registry(&ops).await;

        let id = ops.create_list("Groceries").await.unwrap();

        assert_eq!(ops.list_spec(&id).await.unwrap().name, "Groceries");
        assert!(registry_has(&ops, &id).await);
    }

    #[tokio::test]
    async fn create_list_without_registry_fails() {
        let ops = ops();
        let err = ops.create_list("Groceries").await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_list_removes_only_registry_row() {
        let ops = ops();
        ensure_registry(&ops).await;
        let id = ops.create_list("Groceries").await.unwrap();

        ops.delete_list(&id).await.unwrap();

        assert!(!registry_has(&ops, &id).await);
        assert!(ops.list_spec(&id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_unknown_list_fails() {
        let ops = ops();
        ensure_registry(&ops).await;
        let err = ops.delete_list("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownList(_)));
    }

    #[tokio::test]
    async fn task_lifecycle_bumps_list_timestamp() {
        let ops = ops();
        ensure_registry(&ops).await;
        let list = ops.create_list("Chores").await.unwrap();
        let created = ops.list_spec(&list).await.unwrap().updated_at;

        let task_id = ops.add_task(&list, "sweep").await.unwrap();
        let mut task = ops.get_task(&list, &task_id).await.unwrap();
        assert_eq!(task.text, "sweep");
        assert!(!task.done);
        assert!(ops.list_spec(&list).await.unwrap().updated_at >= created);

        task.done = true;
        ops.update_task(&list, &task).await.unwrap();
        assert!(ops.get_task(&list, &task_id).await.unwrap().done);

        ops.delete_task(&list, &task_id).await.unwrap();
        assert!(matches!(
            ops.get_task(&list, &task_id).await,
            Err(EngineError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn task_ops_on_unknown_list_fail() {
        let ops = ops();
        assert!(matches!(
            ops.add_task("ghost", "x").await,
            Err(EngineError::UnknownList(_))
        ));
        assert!(matches!(
            ops.update_list_spec("ghost", "x").await,
            Err(EngineError::UnknownList(_))
        ));
    }

    #[tokio::test]
    async fn spec_row_is_not_a_task() {
        let ops = ops();
        ensure_registry(&ops).await;
        let list = ops.create_list("Chores").await.unwrap();
        assert!(matches!(
            ops.get_task(&list, LIST_SPEC_ROW).await,
            Err(EngineError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn rename_list() {
        let ops = ops();
        ensure_registry(&ops).await;
        let list = ops.create_list("Chores").await.unwrap();
        ops.update_list_spec(&list, "Weekend chores").await.unwrap();
        assert_eq!(ops.list_spec(&list).await.unwrap().name, "Weekend chores");
    }

    #[tokio::test]
    async fn task_writes_are_version_guarded() {
        let ops = ops();
        ensure_registry(&ops).await;
        let list = ops.create_list("Chores").await.unwrap();
        let before = ops.ctx.store.snapshot(&list).await.unwrap().version;

        let task_id = ops.add_task(&list, "sweep").await.unwrap();
        ops.delete_task(&list, &task_id).await.unwrap();

        // One version per operation: each commit carried task and spec.
        let after = ops.ctx.store.snapshot(&list).await.unwrap().version;
        assert_eq!(after, before + 2);
    }

    #[tokio::test]
    async fn update_of_missing_task_writes_nothing() {
        let ops = ops();
        ensure_registry(&ops).await;
        let list = ops.create_list("Chores").await.unwrap();
        let before = ops.ctx.store.snapshot(&list).await.unwrap().version;

        let ghost = Task::from_spec("ghost", TaskSpec::new("never added"));
        assert!(matches!(
            ops.update_task(&list, &ghost).await,
            Err(EngineError::UnknownTask { .. })
        ));
        assert!(matches!(
            ops.delete_task(&list, "ghost").await,
            Err(EngineError::UnknownTask { .. })
        ));
        assert_eq!(ops.ctx.store.snapshot(&list).await.unwrap().version, before);
    }
}
