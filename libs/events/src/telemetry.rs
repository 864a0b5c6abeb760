//! Telemetry records forwarded to the message broker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Event, EventKind};

/// Name prefix of plugin status records.
pub const TELEMETRY_PLUGIN_STATUS_PREFIX: &str = "sys.scheduler.status.plugin";

/// One best-effort telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub name: String,
    pub value: String,
    /// Nanoseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ns: i64,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Event {
    /// Builds the telemetry record reporting this event.
    ///
    /// Plugin status events are named `sys.scheduler.status.plugin.<state>`;
    /// everything else uses `sys.scheduler.<kind>`.
    pub fn to_telemetry(&self) -> TelemetryRecord {
        let name = match self.kind {
            EventKind::PluginStatusLaunched => format!("{TELEMETRY_PLUGIN_STATUS_PREFIX}.launched"),
            EventKind::PluginStatusComplete => format!("{TELEMETRY_PLUGIN_STATUS_PREFIX}.complete"),
            EventKind::PluginStatusFailed => format!("{TELEMETRY_PLUGIN_STATUS_PREFIX}.failed"),
            EventKind::PluginStatusStopped => format!("{TELEMETRY_PLUGIN_STATUS_PREFIX}.stopped"),
            other => format!("sys.scheduler.{other}"),
        };
        TelemetryRecord {
            name,
            value: self.body.clone(),
            timestamp_ns: self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            meta: self.meta.clone(),
        }
    }
}
