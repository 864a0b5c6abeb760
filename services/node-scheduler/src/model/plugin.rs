//! Plugins: one schedulable unit of work inside a sub-goal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ses_events::ContextStatus;
use ses_id::DispatchId;

use super::Resource;
use crate::transition::{self, Transition, TransitionError};

/// Binding of a named data stream into the plugin's filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataShim {
    pub name: String,
    pub path: String,
}

/// A plugin as declared in a job template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSpec {
    pub name: String,
    pub version: String,

    /// Container image; defaults to `<registry>/<name>:<version>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,

    /// Hardware tags the node must provide (e.g. `camera`, `gpu`).
    pub hardware: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// Resource requirement; zero when omitted.
    pub resource: Resource,

    pub data_shims: Vec<DataShim>,
    pub knobs: BTreeMap<String, String>,

    /// Device profiles the plugin can run on.
    pub profiles: Vec<String>,
}

/// Scheduling state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStatus {
    /// Eligible, waiting for its trigger.
    #[default]
    Waiting,
    /// Promoted; about to be dispatched.
    Ready,
    /// Dispatched and executing.
    Running,
    /// Administratively halted.
    Stopped,
}

impl std::fmt::Display for SchedulingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulingStatus::Waiting => "waiting",
            SchedulingStatus::Ready => "ready",
            SchedulingStatus::Running => "running",
            SchedulingStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub scheduling: SchedulingStatus,

    /// Last verdict from the rule engine.
    pub context: ContextStatus,

    /// Set while a dispatch is in flight or running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchId>,

    pub last_updated: DateTime<Utc>,
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self {
            scheduling: SchedulingStatus::Waiting,
            context: ContextStatus::Unknown,
            dispatch: None,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    pub spec: PluginSpec,
    pub status: PluginStatus,
}

impl Plugin {
    /// Materializes a plugin from its spec, starting in `Waiting`.
    pub fn new(spec: PluginSpec) -> Self {
        Self {
            name: spec.name.clone(),
            spec,
            status: PluginStatus::default(),
        }
    }

    pub fn scheduling(&self) -> SchedulingStatus {
        self.status.scheduling
    }

    pub fn requirement(&self) -> &Resource {
        &self.spec.resource
    }

    /// Substrate-facing name. Substrate naming is case-insensitive.
    pub fn workload_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Case-insensitive name match.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Ready and not yet handed to the resource manager.
    pub fn is_dispatchable(&self) -> bool {
        self.status.scheduling == SchedulingStatus::Ready && self.status.dispatch.is_none()
    }

    /// Applies a status transition and stamps the update time.
    ///
    /// Leaving the running cycle (back to `Waiting`, or `Stopped`) clears the
    /// dispatch. On error the plugin is left untouched.
    pub fn apply(&mut self, t: Transition) -> Result<SchedulingStatus, TransitionError> {
        let next = transition::apply(self.status.scheduling, t)?;
        self.status.scheduling = next;
        if matches!(next, SchedulingStatus::Waiting | SchedulingStatus::Stopped) {
            self.status.dispatch = None;
        }
        self.status.last_updated = Utc::now();
        Ok(next)
    }

    /// Records the dispatch handed to the resource manager.
    pub fn mark_dispatched(&mut self, dispatch: DispatchId) {
        self.status.dispatch = Some(dispatch);
        self.status.last_updated = Utc::now();
    }

    pub fn set_context(&mut self, context: ContextStatus) {
        self.status.context = context;
        self.status.last_updated = Utc::now();
    }
}
