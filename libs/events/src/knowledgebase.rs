//! Messages exchanged with the rule engine ("knowledgebase").
//!
//! Requests go out over a persistent request channel, one JSON object per
//! line. Runnability notifications come back on a separate event channel.

use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::{Event, EventKind, META_GOAL};

/// Command name used to register the rules of a goal.
pub const KB_COMMAND_RULE: &str = "rule";

/// A request to the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbRequest {
    #[serde(default)]
    pub return_code: i32,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl KbRequest {
    /// Registers `rules` under `goal_id`: `{command: "rule", args: [goal_id, rules...]}`.
    pub fn rule(goal_id: impl Into<String>, rules: &[String]) -> Self {
        let mut args = Vec::with_capacity(rules.len() + 1);
        args.push(goal_id.into());
        args.extend(rules.iter().cloned());
        Self {
            return_code: 0,
            command: KB_COMMAND_RULE.to_string(),
            args,
            result: serde_json::Value::Null,
        }
    }
}

/// Whether the rule engine currently wants a plugin to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    /// No verdict received yet.
    #[default]
    Unknown,
    /// The plugin's trigger conditions hold.
    Runnable,
    /// The plugin should be stopped.
    Stoppable,
}

/// Runnability notification from the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginContextEvent {
    /// Goal id or name; empty when the engine did not say.
    #[serde(default, rename = "goalID", alias = "goal_id")]
    pub goal_id: String,
    #[serde(rename = "pluginName", alias = "plugin_name")]
    pub plugin_name: String,
    pub status: ContextStatus,
}

impl PluginContextEvent {
    /// Decodes one line of the event channel.
    pub fn from_line(line: &str) -> Result<Self, EventError> {
        let event: Self = serde_json::from_str(line.trim())?;
        if event.plugin_name.is_empty() {
            return Err(EventError::InvalidPayload("empty plugin name".into()));
        }
        Ok(event.normalized())
    }

    /// Lower-cases the plugin name; substrate naming is case-insensitive.
    pub fn normalized(mut self) -> Self {
        self.plugin_name = self.plugin_name.to_lowercase();
        self
    }

    /// Converts into an internal event, or `None` for an `Unknown` verdict.
    pub fn to_event(&self) -> Option<Event> {
        let kind = match self.status {
            ContextStatus::Runnable => EventKind::PluginContextRunnable,
            ContextStatus::Stoppable => EventKind::PluginContextStoppable,
            ContextStatus::Unknown => return None,
        };
        let mut event = Event::new(kind, self.plugin_name.clone());
        if !self.goal_id.is_empty() {
            event = event.with_meta(META_GOAL, self.goal_id.clone());
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_request_shape() {
        let rules = vec!["cloud-cover: cronjob(\"*/5 * * * *\")".to_string()];
        let request = KbRequest::rule("goal_01HV4Z2WQXKJNM8GPQY6VBKC3D", &rules);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["command"], "rule");
        assert_eq!(json["args"][0], "goal_01HV4Z2WQXKJNM8GPQY6VBKC3D");
        assert_eq!(json["args"][1], rules[0]);
        assert_eq!(json["args"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_context_event_lowercases_name() {
        let event =
            PluginContextEvent::from_line(r#"{"pluginName": "Cloud-Cover", "status": "runnable"}"#)
                .unwrap();
        assert_eq!(event.plugin_name, "cloud-cover");
        assert_eq!(event.status, ContextStatus::Runnable);
        assert!(event.goal_id.is_empty());
    }

    #[test]
    fn test_context_event_rejects_empty_name() {
        let err = PluginContextEvent::from_line(r#"{"plugin_name": "", "status": "stoppable"}"#)
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_context_event_garbage() {
        let err = PluginContextEvent::from_line("not json").unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }

    #[test]
    fn test_context_event_to_internal_event() {
        let runnable = PluginContextEvent {
            goal_id: "sky-watch".into(),
            plugin_name: "cloud-cover".into(),
            status: ContextStatus::Runnable,
        };
        let event = runnable.to_event().unwrap();
        assert_eq!(event.kind, EventKind::PluginContextRunnable);
        assert_eq!(event.body, "cloud-cover");
        assert_eq!(event.goal(), Some("sky-watch"));

        let unknown = PluginContextEvent {
            status: ContextStatus::Unknown,
            ..runnable
        };
        assert!(unknown.to_event().is_none());
    }
}
