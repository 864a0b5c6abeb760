//! Goal management: sources of goal updates, the watcher task that follows
//! them, and the goal table owned by the orchestration loop.

mod manager;
mod source;
mod watcher;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::ScienceGoal;

pub use manager::NodeGoalManager;
pub use source::{FileGoalSource, GoalSource, SourceEvent, SourceEventKind};
pub use watcher::run_goal_watcher;

/// Goals keyed by name. Iteration order is the stable order used by the
/// scheduling policy.
pub type GoalTable = BTreeMap<String, ScienceGoal>;

#[derive(Debug, Error)]
pub enum GoalError {
    #[error("malformed job template: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("job template is missing required field {0}")]
    MissingField(String),

    #[error("invalid resource requirement for plugin {0}")]
    InvalidResource(String),

    #[error("update carries no {0:?} entry")]
    MissingKey(String),

    #[error("goal source unavailable: {0}")]
    Source(String),
}
