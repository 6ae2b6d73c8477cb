//! Replay scripts.
//!
//! A script is a JSON array of steps. Lists and tasks are named by
//! script-local aliases, because the engine assigns random ids:
//!
//! ```json
//! [
//!   { "op": "create_list", "alias": "groceries", "name": "Groceries" },
//!   { "op": "add_task", "list": "groceries", "alias": "milk", "text": "Milk" },
//!   { "op": "update_task", "list": "groceries", "task": "milk", "done": true },
//!   { "op": "settle" }
//! ]
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Built-in walkthrough used by `todos demo`.
const DEMO_SCRIPT: &str = include_str!("../scripts/demo.json");

/// Errors raised while loading or checking a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script file could not be read.
    #[error("failed to read script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The script is not a valid JSON step array.
    #[error("invalid script: {0}")]
    Parse(#[from] serde_json::Error),

    /// A step refers to a list alias that was never created.
    #[error("step {step}: unknown list alias '{alias}'")]
    UnknownList { step: usize, alias: String },

    /// A step refers to a task alias that was never added.
    #[error("step {step}: unknown task alias '{alias}' in list '{list}'")]
    UnknownTask {
        step: usize,
        list: String,
        alias: String,
    },

    /// An alias is defined twice.
    #[error("step {step}: alias '{alias}' is already defined")]
    DuplicateAlias { step: usize, alias: String },
}

/// One script step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateList {
        alias: String,
        name: String,
    },
    RenameList {
        list: String,
        name: String,
    },
    DeleteList {
        list: String,
    },
    AddTask {
        list: String,
        alias: String,
        text: String,
    },
    UpdateTask {
        list: String,
        task: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        done: Option<bool>,
    },
    DeleteTask {
        list: String,
        task: String,
    },
    CompleteAll {
        list: String,
    },
    /// Wait until the engine has reported everything written so far.
    Settle,
}

/// A parsed, alias-checked script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    /// Parses and checks a script.
    pub fn from_json(json: &str) -> Result<Self, ScriptError> {
        let script: Script = serde_json::from_str(json)?;
        script.check_aliases()?;
        Ok(script)
    }

    /// Reads a script file.
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let json = fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// The built-in demo walkthrough.
    pub fn demo() -> Result<Self, ScriptError> {
        Self::from_json(DEMO_SCRIPT)
    }

    /// Verifies that every alias is defined once and before use.
    ///
    /// Deleting a list or task retires its alias.
    fn check_aliases(&self) -> Result<(), ScriptError> {
        let mut lists: HashSet<&str> = HashSet::new();
        let mut tasks: HashSet<(&str, &str)> = HashSet::new();

        for (i, step) in self.steps.iter().enumerate() {
            let step_no = i + 1;
            match step {
                Step::CreateList { alias, .. } => {
                    if !lists.insert(alias.as_str()) {
                        return Err(ScriptError::DuplicateAlias {
                            step: step_no,
                            alias: alias.clone(),
                        });
                    }
                }
                Step::RenameList { list, .. } | Step::CompleteAll { list } => {
                    need_list(&lists, step_no, list)?;
                }
                Step::DeleteList { list } => {
                    need_list(&lists, step_no, list)?;
                    lists.remove(list.as_str());
                    tasks.retain(|(l, _)| *l != list.as_str());
                }
                Step::AddTask { list, alias, .. } => {
                    need_list(&lists, step_no, list)?;
                    if !tasks.insert((list.as_str(), alias.as_str())) {
                        return Err(ScriptError::DuplicateAlias {
                            step: step_no,
                            alias: alias.clone(),
                        });
                    }
                }
                Step::UpdateTask { list, task, .. } => {
                    need_list(&lists, step_no, list)?;
                    need_task(&tasks, step_no, list, task)?;
                }
                Step::DeleteTask { list, task } => {
                    need_list(&lists, step_no, list)?;
                    need_task(&tasks, step_no, list, task)?;
                    tasks.remove(&(list.as_str(), task.as_str()));
                }
                Step::Settle => {}
            }
        }
        Ok(())
    }
}

fn need_list(lists: &HashSet<&str>, step: usize, alias: &str) -> Result<(), ScriptError> {
    if lists.contains(alias) {
        Ok(())
    } else {
        Err(ScriptError::UnknownList {
            step,
            alias: alias.to_string(),
        })
    }
}

fn need_task(
    tasks: &HashSet<(&str, &str)>,
    step: usize,
    list: &str,
    alias: &str,
) -> Result<(), ScriptError> {
    if tasks.contains(&(list, alias)) {
        Ok(())
    } else {
        Err(ScriptError::UnknownTask {
            step,
            list: list.to_string(),
            alias: alias.to_string(),
        })
    }
}
