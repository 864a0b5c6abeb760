//! Job templates as stored in the goal source.

use serde::{Deserialize, Serialize};

use super::PluginSpec;
use crate::goal::GoalError;

/// A user job: plugins to run and the rules that trigger them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobTemplate {
    pub name: String,
    pub plugins: Vec<PluginSpec>,
    pub science_rules: Vec<String>,
    pub node_tags: Vec<String>,
}

impl JobTemplate {
    /// Parses and validates a YAML job template.
    pub fn from_yaml(raw: &str) -> Result<Self, GoalError> {
        let template: JobTemplate = serde_yaml::from_str(raw)?;
        template.validate()?;
        Ok(template)
    }

    /// Rejects templates the scheduler cannot materialize.
    pub fn validate(&self) -> Result<(), GoalError> {
        if self.name.trim().is_empty() {
            return Err(GoalError::MissingField("name".into()));
        }
        for (i, plugin) in self.plugins.iter().enumerate() {
            if plugin.name.trim().is_empty() {
                return Err(GoalError::MissingField(format!("plugins[{i}].name")));
            }
            if plugin.version.trim().is_empty() {
                return Err(GoalError::MissingField(format!("plugins[{i}].version")));
            }
            if !plugin.resource.is_valid() {
                return Err(GoalError::InvalidResource(plugin.name.clone()));
            }
        }
        Ok(())
    }
}
