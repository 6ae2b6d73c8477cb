//! Bulk completion of a list.
//!
//! [`complete_all_tasks`] marks every open task of a list as done in one
//! optimistic transaction (see [`txn`](crate::txn)). If another writer gets
//! in first the operator backs off and plans again from a fresh snapshot,
//! so a task added concurrently is completed too.
//!
//! Nothing is partially applied: either every open task flips to done
//! together with the list timestamp, or nothing changes.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::Result;
use crate::store::{Snapshot, Write};
use crate::txn::{self, Plan};
use crate::types::{TaskSpec, LIST_SPEC_ROW};

/// Result of a successful bulk completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum BulkOutcome {
    /// `updated` tasks were marked done on attempt number `attempts`.
    Completed { updated: usize, attempts: u32 },
    /// Every task was already done; nothing was written.
    AlreadyComplete,
}

/// Marks every task of `list_id` as done.
///
/// # Errors
///
/// - [`EngineError::UnknownList`] if the list collection or its spec row is
///   missing
/// - [`EngineError::TransactionConflict`] if every attempt conflicted
/// - [`EngineError::Store`] for any other store failure
///
/// [`EngineError::UnknownList`]: crate::error::EngineError::UnknownList
/// [`EngineError::TransactionConflict`]: crate::error::EngineError::TransactionConflict
/// [`EngineError::Store`]: crate::error::EngineError::Store
pub async fn complete_all_tasks(ctx: &EngineContext, list_id: &str) -> Result<BulkOutcome> {
    let (updated, attempts) = txn::run(ctx, list_id, |snapshot| plan(list_id, snapshot)).await?;

    if updated == 0 {
        debug!(list_id, "All tasks already done");
        return Ok(BulkOutcome::AlreadyComplete);
    }
    info!(list_id, updated, attempts, "Completed all tasks");
    Ok(BulkOutcome::Completed { updated, attempts })
}

/// Plans the completion writes, yielding the number of tasks flipped.
fn plan(list_id: &str, snapshot: &Snapshot) -> Result<Plan<usize>> {
    let spec = txn::list_spec(list_id, snapshot)?;

    let mut writes = Vec::new();
    for (key, raw) in &snapshot.rows {
        if key == LIST_SPEC_ROW {
            continue;
        }
        let mut task: TaskSpec = match serde_json::from_slice(raw) {
            Ok(task) => task,
            Err(e) => {
                warn!(list_id, task_id = %key, error = %e, "Skipping undecodable task row");
                continue;
            }
        };
        if !task.done {
            task.done = true;
            writes.push(Write::put_json(key.as_str(), &task)?);
        }
    }

    if writes.is_empty() {
        return Ok(Plan::Skip(0));
    }
    let updated = writes.len();
    writes.push(Write::put_json(LIST_SPEC_ROW, &spec.touched(Utc::now()))?);
    Ok(Plan::Commit {
        writes,
        value: updated,
    })
}
