//! Todos Engine - Incremental list aggregation over a batched change log.
//!
//! This crate turns the change log of a two-level store (a registry of todo
//! lists, each holding a collection of tasks) into always-consistent
//! [`ListMetadata`] records delivered as add/update/delete events.
//!
//! # Overview
//!
//! ```text
//!   Store watch ──► BatchCoalescer ──► ListTracker (per list) ──► listener
//!                                            ▲
//!   registry watch ──► Registry ─────────────┘ (create / tear down)
//! ```
//!
//! Each closed batch of a list produces exactly one listener call, the first
//! being an add. Deleting a list yields exactly one delete and nothing after
//! it.
//!
//! # Modules
//!
//! - [`store`]: Storage capability trait and the in-memory backend
//! - [`coalescer`]: Batch coalescing over a watch feed
//! - [`aggregator`]: Incremental task counters
//! - [`tracker`]: Per-list tracker and its actor
//! - [`registry`]: Lifecycle of all trackers
//! - `txn`: Version-guarded list transactions with retry
//! - [`bulk`]: Optimistic "complete all tasks" transaction
//! - [`todo_list`]: Task-level watcher for one open list
//! - [`ops`]: Mutating API
//! - [`listener`]: Listener traits and channel adapters
//! - [`broadcast`]: Broadcast fan-out of list events
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types

pub mod aggregator;
pub mod broadcast;
pub mod bulk;
pub mod coalescer;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod ops;
pub mod registry;
pub mod store;
pub mod todo_list;
pub mod tracker;
mod txn;
pub mod types;

pub use aggregator::{TaskCounts, TaskSetAggregator};
pub use broadcast::{ListEventBroadcaster, DEFAULT_CHANNEL_CAPACITY};
pub use bulk::{complete_all_tasks, BulkOutcome};
pub use coalescer::{BatchCoalescer, BatchSink};
pub use config::{Config, ConfigError};
pub use context::EngineContext;
pub use error::{EngineError, Result, StoreError};
pub use listener::{
    ChannelListener, ListEvent, ListEventListener, TodoListChannel, TodoListEvent,
    TodoListListener,
};
pub use ops::TodoOps;
pub use registry::{Registry, RegistryHandle};
pub use store::{
    ChangeEvent, ChangeKind, MemoryStore, Snapshot, Store, Transaction, Watch, WatchId, Write,
};
pub use todo_list::TodoListWatcher;
pub use tracker::{ListTracker, TrackerActor, TrackerCommand, TrackerFailure, TrackerPhase};
pub use types::{ListId, ListMetadata, ListSpec, Task, TaskId, TaskSpec, LIST_SPEC_ROW};
