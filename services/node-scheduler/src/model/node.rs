//! Static node reference data.

use serde::{Deserialize, Serialize};

use super::{PluginSpec, Resource};

/// A compute device on a node (e.g. the main board, an accelerator).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub name: String,
    pub architecture: String,
    pub resource: Resource,
}

/// An edge node. Never mutated by the scheduling core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub name: String,
    pub tags: Vec<String>,
    pub hardware: Vec<String>,
    pub architecture: String,
    pub devices: Vec<Device>,
}

impl Node {
    /// A node known only by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// True when the node carries every requested hardware tag.
    pub fn supports_hardware(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|tag| self.hardware.iter().any(|h| h.eq_ignore_ascii_case(tag)))
    }

    /// Devices of the given architecture.
    pub fn supported_devices<'a>(
        &'a self,
        architecture: &'a str,
    ) -> impl Iterator<Item = &'a Device> + 'a {
        self.devices
            .iter()
            .filter(move |d| d.architecture.eq_ignore_ascii_case(architecture))
    }

    /// Profiles requested by `plugin` that name no device on this node.
    pub fn unsupported_profiles<'a>(&self, plugin: &'a PluginSpec) -> Vec<&'a str> {
        plugin
            .profiles
            .iter()
            .filter(|p| !self.devices.iter().any(|d| d.name.eq_ignore_ascii_case(p)))
            .map(String::as_str)
            .collect()
    }

    /// Sum of all device resources.
    pub fn total_resource(&self) -> Resource {
        self.devices.iter().map(|d| &d.resource).sum()
    }
}
