//! Goal and plugin state model.

mod goal;
mod job;
mod node;
mod plugin;
mod resource;

pub use goal::{ScienceGoal, SubGoal};
pub use job::JobTemplate;
pub use node::{Device, Node};
pub use plugin::{DataShim, Plugin, PluginSpec, PluginStatus, SchedulingStatus};
pub use resource::Resource;
