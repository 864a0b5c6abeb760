//! Node scheduler library
//!
//! Decides, on one edge node, which plugins of which science goals run at any
//! moment. Goals arrive from a configuration source, plugins are promoted by
//! the rule engine's verdicts, and one Ready plugin at a time is handed to the
//! execution substrate when the node has room for it.
//!
//! ## Architecture
//!
//! ```text
//! goal watcher ──┐
//! substrate watch ┤                          ┌─> ResourceManager ─> substrate
//! rule engine ────┼─> NodeScheduler (loop) ──┤
//! GC ticker ──────┤    owns the goal table   └─> TelemetrySink
//! status API ─────┘
//! ```
//!
//! Every producer talks to the loop through a bounded channel. The loop is
//! the only task that reads or writes goals and plugins.
//!
//! ## Modules
//!
//! - `model`: goals, sub-goals, plugins, resources, job templates
//! - `transition`: the plugin status reducer
//! - `policy`: promotion and best-task selection
//! - `goal`: goal sources, the watcher task and the goal table
//! - `resource`: capacity accounting and the execution substrate seam
//! - `knowledgebase`: rule-engine IPC
//! - `telemetry`: best-effort status egress
//! - `scheduler`: the orchestration loop
//! - `api`: read-only HTTP status surface

pub mod api;
pub mod backoff;
pub mod config;
pub mod goal;
pub mod knowledgebase;
pub mod model;
pub mod policy;
pub mod resource;
pub mod scheduler;
pub mod telemetry;
pub mod transition;

/// Default capacity of every internal queue.
pub const CHANNEL_CAPACITY: usize = 100;

pub use config::Config;
pub use goal::{GoalSource, NodeGoalManager, SourceEvent, SourceEventKind};
pub use model::{Plugin, Resource, SchedulingStatus, ScienceGoal, SubGoal};
pub use policy::{RuleMode, Selection, SimpleSchedulingPolicy};
pub use resource::{ExecutionSubstrate, MockSubstrate, ResourceManager};
pub use scheduler::{NodeScheduler, SchedulerInputs};
