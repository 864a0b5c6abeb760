//! Internal event definitions.
//!
//! Every queue inside the scheduler carries [`Event`]s. The kind says what
//! happened; the body names the thing it happened to.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Goals
    pub const GOAL_NEW: &str = "goal.new";
    pub const GOAL_UPDATED: &str = "goal.updated";
    pub const GOAL_REMOVED: &str = "goal.removed";

    // Plugin status reported by the execution substrate
    pub const PLUGIN_STATUS_LAUNCHED: &str = "plugin.status.launched";
    pub const PLUGIN_STATUS_COMPLETE: &str = "plugin.status.complete";
    pub const PLUGIN_STATUS_FAILED: &str = "plugin.status.failed";
    pub const PLUGIN_STATUS_STOPPED: &str = "plugin.status.stopped";

    // Plugin context reported by the rule engine
    pub const PLUGIN_CONTEXT_RUNNABLE: &str = "plugin.context.runnable";
    pub const PLUGIN_CONTEXT_STOPPABLE: &str = "plugin.context.stoppable";

    // Scheduling
    pub const SCHEDULING_TICK: &str = "scheduling.tick";
    pub const SCHEDULING_NEEDED: &str = "scheduling.needed";
}

/// Meta key naming the goal an event refers to.
pub const META_GOAL: &str = "goal";

/// Meta key carrying the dispatch id of a plugin run.
pub const META_DISPATCH: &str = "dispatch";

/// Meta key carrying a human readable reason (failures, stops).
pub const META_REASON: &str = "reason";

// =============================================================================
// Event Kind
// =============================================================================

/// What an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "goal.new")]
    GoalNew,
    #[serde(rename = "goal.updated")]
    GoalUpdated,
    #[serde(rename = "goal.removed")]
    GoalRemoved,
    #[serde(rename = "plugin.status.launched")]
    PluginStatusLaunched,
    #[serde(rename = "plugin.status.complete")]
    PluginStatusComplete,
    #[serde(rename = "plugin.status.failed")]
    PluginStatusFailed,
    #[serde(rename = "plugin.status.stopped")]
    PluginStatusStopped,
    #[serde(rename = "plugin.context.runnable")]
    PluginContextRunnable,
    #[serde(rename = "plugin.context.stoppable")]
    PluginContextStoppable,
    #[serde(rename = "scheduling.tick")]
    SchedulingTick,
    #[serde(rename = "scheduling.needed")]
    SchedulingNeeded,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 11] = [
        EventKind::GoalNew,
        EventKind::GoalUpdated,
        EventKind::GoalRemoved,
        EventKind::PluginStatusLaunched,
        EventKind::PluginStatusComplete,
        EventKind::PluginStatusFailed,
        EventKind::PluginStatusStopped,
        EventKind::PluginContextRunnable,
        EventKind::PluginContextStoppable,
        EventKind::SchedulingTick,
        EventKind::SchedulingNeeded,
    ];

    /// The dotted wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::GoalNew => event_types::GOAL_NEW,
            EventKind::GoalUpdated => event_types::GOAL_UPDATED,
            EventKind::GoalRemoved => event_types::GOAL_REMOVED,
            EventKind::PluginStatusLaunched => event_types::PLUGIN_STATUS_LAUNCHED,
            EventKind::PluginStatusComplete => event_types::PLUGIN_STATUS_COMPLETE,
            EventKind::PluginStatusFailed => event_types::PLUGIN_STATUS_FAILED,
            EventKind::PluginStatusStopped => event_types::PLUGIN_STATUS_STOPPED,
            EventKind::PluginContextRunnable => event_types::PLUGIN_CONTEXT_RUNNABLE,
            EventKind::PluginContextStoppable => event_types::PLUGIN_CONTEXT_STOPPABLE,
            EventKind::SchedulingTick => event_types::SCHEDULING_TICK,
            EventKind::SchedulingNeeded => event_types::SCHEDULING_NEEDED,
        }
    }

    /// Returns true for kinds describing a goal table change.
    pub fn is_goal_change(&self) -> bool {
        matches!(
            self,
            EventKind::GoalNew | EventKind::GoalUpdated | EventKind::GoalRemoved
        )
    }

    /// Returns true for kinds reported by the execution substrate.
    pub fn is_plugin_status(&self) -> bool {
        matches!(
            self,
            EventKind::PluginStatusLaunched
                | EventKind::PluginStatusComplete
                | EventKind::PluginStatusFailed
                | EventKind::PluginStatusStopped
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Event
// =============================================================================

/// The message shape of every internal queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Correlation string: a goal name, a plugin name.
    pub body: String,

    /// Extra correlation (goal of a plugin, dispatch id, reason).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(kind: EventKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
            meta: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a meta entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Looks up a meta entry.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// The goal this event refers to, if the producer recorded one.
    pub fn goal(&self) -> Option<&str> {
        self.meta(META_GOAL)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.body)
    }
}

// =============================================================================
// Tests
// =============================================================================
