//! Shared data types for the todos engine.
//!
//! This module defines the persisted row values ([`ListSpec`], [`TaskSpec`])
//! and the derived records handed to listeners ([`ListMetadata`], [`Task`]).
//! Persisted values are serialized as JSON with camelCase field names so that
//! rows written by one backend can be read by any other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a todo list (and of its task collection).
pub type ListId = String;

/// Opaque identifier of a task row within a list collection.
pub type TaskId = String;

/// Row key of the list collection row that holds the [`ListSpec`].
///
/// Every other row of a list collection is a task keyed by its [`TaskId`].
pub const LIST_SPEC_ROW: &str = "list";

/// Persisted description of a todo list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSpec {
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

impl ListSpec {
    /// Creates a spec stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            updated_at: Utc::now(),
        }
    }

    /// Returns a copy with `updated_at` moved to `now`.
    #[must_use]
    pub fn touched(&self, now: DateTime<Utc>) -> Self {
        Self {
            name: self.name.clone(),
            updated_at: now,
        }
    }
}

/// Persisted state of a single task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub text: String,
    pub added_at: DateTime<Utc>,
    pub done: bool,
}

impl TaskSpec {
    /// Creates an undone task added now.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            added_at: Utc::now(),
            done: false,
        }
    }
}

/// A task together with its row key, as delivered to task-level listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    pub added_at: DateTime<Utc>,
    pub done: bool,
}

impl Task {
    /// Combines a row key with its decoded spec.
    #[must_use]
    pub fn from_spec(id: impl Into<TaskId>, spec: TaskSpec) -> Self {
        Self {
            id: id.into(),
            text: spec.text,
            added_at: spec.added_at,
            done: spec.done,
        }
    }

    /// Strips the row key, yielding the persisted form.
    #[must_use]
    pub fn to_spec(&self) -> TaskSpec {
        TaskSpec {
            text: self.text.clone(),
            added_at: self.added_at,
            done: self.done,
        }
    }
}

/// Derived summary of one todo list.
///
/// Never persisted: it is always recomputed from the observed rows.
/// `num_tasks` is the size of the live task set and `num_completed` the
/// number of those tasks marked done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMetadata {
    pub id: ListId,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub num_tasks: usize,
    pub num_completed: usize,
}

impl ListMetadata {
    /// Returns `true` if the list has tasks and all of them are done.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::Utc;
    /// use todos_engine::types::ListMetadata;
    ///
    /// let meta = ListMetadata {
    ///     id: "groceries".to_string(),
    ///     name: "Groceries".to_string(),
    ///     updated_at: Utc::now(),
    ///     num_tasks: 2,
    ///     num_completed: 2,
    /// };
    /// assert!(meta.is_done());
    /// assert!(!meta.can_complete_all());
    /// ```
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.num_tasks > 0 && self.num_completed == self.num_tasks
    }

    /// Returns `true` if at least one task is still open.
    #[must_use]
    pub fn can_complete_all(&self) -> bool {
        self.num_completed < self.num_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 5, 4, 12, 0, 0).unwrap()
    }

    fn meta(num_tasks: usize, num_completed: usize) -> ListMetadata {
        ListMetadata {
            id: "l1".to_string(),
            name: "List".to_string(),
            updated_at: fixed_time(),
            num_tasks,
            num_completed,
        }
    }

    #[test]
    fn list_spec_serializes_camel_case() {
        let spec = ListSpec {
            name: "Chores".to_string(),
            updated_at: fixed_time(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["name"], "Chores");
        assert!(json.get("updatedAt").is_some());
        assert!(json.get("updated_at").is_none());
    }

    #[test]
    fn task_spec_deserializes_from_camel_case() {
        let json = r#"{"text":"milk","addedAt":"2016-05-04T12:00:00Z","done":true}"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.text, "milk");
        assert_eq!(spec.added_at, fixed_time());
        assert!(spec.done);
    }

    #[test]
    fn task_spec_new_is_not_done() {
        assert!(!TaskSpec::new("write tests").done);
    }

    #[test]
    fn task_round_trips_through_spec() {
        let spec = TaskSpec {
            text: "eggs".to_string(),
            added_at: fixed_time(),
            done: false,
        };
        let task = Task::from_spec("t1", spec.clone());
        assert_eq!(task.id, "t1");
        assert_eq!(task.to_spec(), spec);
    }

    #[test]
    fn touched_keeps_name() {
        let spec = ListSpec {
            name: "Chores".to_string(),
            updated_at: fixed_time(),
        };
        let later = fixed_time() + chrono::Duration::minutes(5);
        let touched = spec.touched(later);
        assert_eq!(touched.name, "Chores");
        assert_eq!(touched.updated_at, later);
    }

    #[test]
    fn empty_list_is_not_done() {
        let m = meta(0, 0);
        assert!(!m.is_done());
        assert!(!m.can_complete_all());
    }

    #[test]
    fn partially_complete_list() {
        let m = meta(3, 2);
        assert!(!m.is_done());
        assert!(m.can_complete_all());
    }

    #[test]
    fn fully_complete_list() {
        let m = meta(3, 3);
        assert!(m.is_done());
        assert!(!m.can_complete_all());
    }
}
