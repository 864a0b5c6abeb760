//! Scheduling policy: promotion and best-task selection.

mod simple;

use serde::Serialize;
use ses_id::GoalId;

use crate::goal::GoalTable;
use crate::model::{Resource, SubGoal};

pub use simple::SimpleSchedulingPolicy;

/// How promotion decides that a Waiting plugin's trigger is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleMode {
    /// Promote every Waiting plugin.
    Unconditional,
    /// Promote when the sub-goal has no rules, or the rule engine last
    /// reported the plugin runnable.
    #[default]
    Knowledgebase,
}

/// The plugin picked for dispatch. Owned, so the table can be borrowed
/// mutably afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub goal_name: String,
    pub goal_id: GoalId,
    pub plugin_name: String,
}

/// Decides what runs next. Never touches anything but promotion state.
pub trait SchedulingPolicy: Send {
    /// Moves every satisfied Waiting plugin of `sub_goal` to Ready.
    ///
    /// Returns the number of promoted plugins. Idempotent: a second call on
    /// an unchanged sub-goal promotes nothing.
    fn promote_plugins(&self, sub_goal: &mut SubGoal) -> usize;

    /// Picks one dispatchable plugin that fits `available`, or `None`.
    ///
    /// Plugins whose workload name `is_reserved` reports as held are passed
    /// over, so one shared workload never blocks the rest of the table.
    /// `None` is a normal outcome, not an error.
    fn select_best_task(
        &self,
        goals: &GoalTable,
        available: &Resource,
        node_id: &str,
        is_reserved: &dyn Fn(&str) -> bool,
    ) -> Option<Selection>;

    /// Notes that `selection` was dispatched.
    fn record_dispatch(&mut self, selection: &Selection);
}
