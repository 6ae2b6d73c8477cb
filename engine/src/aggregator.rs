//! Incremental task counting for one list.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::TaskId;

/// Task totals of one list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub num_tasks: usize,
    pub num_completed: usize,
}

/// Live task set with running counters.
///
/// `num_completed` always equals the number of entries whose flag is
/// `true`; every mutation adjusts it by at most one.
#[derive(Debug, Default)]
pub struct TaskSetAggregator {
    task_done: HashMap<TaskId, bool>,
    num_completed: usize,
}

impl TaskSetAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that task `id` exists with the given done flag.
    pub fn apply_put(&mut self, id: &str, done: bool) {
        match self.task_done.insert(id.to_string(), done) {
            None if done => self.num_completed += 1,
            Some(false) if done => self.num_completed += 1,
            Some(true) if !done => self.num_completed -= 1,
            _ => {}
        }
    }

    /// Forgets task `id`. Unknown ids are ignored.
    pub fn apply_delete(&mut self, id: &str) {
        if let Some(true) = self.task_done.remove(id) {
            self.num_completed -= 1;
        }
    }

    /// Current totals.
    #[must_use]
    pub fn snapshot_counts(&self) -> TaskCounts {
        TaskCounts {
            num_tasks: self.task_done.len(),
            num_completed: self.num_completed,
        }
    }

    /// Returns `true` if the task is in the live set.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.task_done.contains_key(id)
    }
}
