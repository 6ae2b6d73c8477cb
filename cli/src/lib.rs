//! Todos CLI - Replays todo-list scripts through the aggregation engine.
//!
//! # Modules
//!
//! - [`script`]: Script format and alias checking
//! - [`runner`]: Executes a script and prints list events as JSON lines

pub mod runner;
pub mod script;

pub use runner::{replay, ReplaySummary, Runner, DEFAULT_QUIET_PERIOD};
pub use script::{Script, ScriptError, Step};
