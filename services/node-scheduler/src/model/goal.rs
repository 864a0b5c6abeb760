//! Science goals and their per-node slices.

use serde::{Deserialize, Serialize};
use ses_id::GoalId;

use super::{Node, Plugin, SchedulingStatus};

/// One node's view of a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGoal {
    pub node: Node,
    pub plugins: Vec<Plugin>,
    pub science_rules: Vec<String>,
}

impl SubGoal {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            plugins: Vec::new(),
            science_rules: Vec::new(),
        }
    }

    pub fn get_plugin(&self, name: &str) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.is_named(name))
    }

    pub fn get_plugin_mut(&mut self, name: &str) -> Option<&mut Plugin> {
        self.plugins.iter_mut().find(|p| p.is_named(name))
    }

    /// Plugins in the given state, in declaration order.
    pub fn plugins_in(&self, status: SchedulingStatus) -> impl Iterator<Item = &Plugin> {
        self.plugins.iter().filter(move |p| p.scheduling() == status)
    }

    pub fn has_rules(&self) -> bool {
        !self.science_rules.is_empty()
    }
}

/// A declarative unit of work, sliced per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScienceGoal {
    pub id: GoalId,
    pub name: String,
    pub sub_goals: Vec<SubGoal>,
}

impl ScienceGoal {
    /// The sub-goal bound to `node_id`, if this goal has one.
    pub fn my_sub_goal(&self, node_id: &str) -> Option<&SubGoal> {
        self.sub_goals.iter().find(|s| s.node.name == node_id)
    }

    pub fn my_sub_goal_mut(&mut self, node_id: &str) -> Option<&mut SubGoal> {
        self.sub_goals.iter_mut().find(|s| s.node.name == node_id)
    }

    /// Matches either the goal name or its rendered id.
    pub fn is_referenced_by(&self, name_or_id: &str) -> bool {
        self.name == name_or_id || self.id.to_string() == name_or_id
    }
}
