//! Round-robin across goals, first fit within a goal.

use std::ops::Bound;

use ses_events::ContextStatus;
use tracing::debug;

use super::{RuleMode, SchedulingPolicy, Selection};
use crate::goal::GoalTable;
use crate::model::{Plugin, Resource, SchedulingStatus, ScienceGoal, SubGoal};
use crate::transition::Transition;

/// Round-robin with FIFO tie-break.
///
/// Goals are visited in name order starting just after the goal of the last
/// dispatch, wrapping around. Within a goal plugins are visited in
/// declaration order and the first dispatchable one that fits wins. Plugins
/// that do not fit, or whose workload is still held by another dispatch, are
/// skipped for this pass only.
#[derive(Debug, Default)]
pub struct SimpleSchedulingPolicy {
    mode: RuleMode,
    cursor: Option<String>,
}

impl SimpleSchedulingPolicy {
    pub fn new(mode: RuleMode) -> Self {
        Self { mode, cursor: None }
    }

    pub fn mode(&self) -> RuleMode {
        self.mode
    }

    /// Name of the goal that produced the last dispatch.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    fn is_triggered(&self, sub_goal: &SubGoal, plugin: &Plugin) -> bool {
        match self.mode {
            RuleMode::Unconditional => true,
            RuleMode::Knowledgebase => {
                !sub_goal.has_rules() || plugin.status.context == ContextStatus::Runnable
            }
        }
    }

    fn goals_in_turn<'a>(
        &self,
        goals: &'a GoalTable,
    ) -> Box<dyn Iterator<Item = &'a ScienceGoal> + 'a> {
        match self.cursor.as_deref() {
            None => Box::new(goals.values()),
            Some(last) => {
                let after = goals.range::<str, _>((Bound::Excluded(last), Bound::Unbounded));
                let before = goals.range::<str, _>((Bound::Unbounded, Bound::Included(last)));
                Box::new(after.chain(before).map(|(_, goal)| goal))
            }
        }
    }
}

impl SchedulingPolicy for SimpleSchedulingPolicy {
    fn promote_plugins(&self, sub_goal: &mut SubGoal) -> usize {
        let triggered: Vec<usize> = sub_goal
            .plugins
            .iter()
            .enumerate()
            .filter(|(_, p)| p.scheduling() == SchedulingStatus::Waiting)
            .filter(|(_, p)| self.is_triggered(sub_goal, p))
            .map(|(i, _)| i)
            .collect();

        let mut promoted = 0;
        for i in triggered {
            let plugin = &mut sub_goal.plugins[i];
            if plugin.apply(Transition::Promote).is_ok() {
                debug!(plugin = %plugin.name, "Promoted plugin to ready");
                promoted += 1;
            }
        }
        promoted
    }

    fn select_best_task(
        &self,
        goals: &GoalTable,
        available: &Resource,
        node_id: &str,
        is_reserved: &dyn Fn(&str) -> bool,
    ) -> Option<Selection> {
        for goal in self.goals_in_turn(goals) {
            let Some(sub_goal) = goal.my_sub_goal(node_id) else {
                continue;
            };
            for plugin in sub_goal.plugins.iter().filter(|p| p.is_dispatchable()) {
                if is_reserved(&plugin.workload_name()) {
                    debug!(
                        goal = %goal.name,
                        plugin = %plugin.name,
                        "Workload still held by another dispatch, skipping"
                    );
                    continue;
                }
                if plugin.requirement().fits_within(available) {
                    return Some(Selection {
                        goal_name: goal.name.clone(),
                        goal_id: goal.id,
                        plugin_name: plugin.name.clone(),
                    });
                }
                debug!(
                    goal = %goal.name,
                    plugin = %plugin.name,
                    required = %plugin.requirement(),
                    available = %available,
                    "Plugin does not fit, skipping"
                );
            }
        }
        None
    }

    fn record_dispatch(&mut self, selection: &Selection) {
        self.cursor = Some(selection.goal_name.clone());
    }
}
