//! Per-plugin message broker credentials.

use serde::Serialize;

use crate::model::Plugin;

/// Broker login handed to a plugin through its environment.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PluginCredential {
    pub username: String,
    pub password: String,
}

impl PluginCredential {
    /// `<lower-name>-<version>` with a fresh 128-bit hex password.
    pub fn generate(plugin: &Plugin) -> Self {
        Self {
            username: format!("{}-{}", plugin.workload_name(), plugin.spec.version),
            password: hex::encode(rand::random::<[u8; 16]>()),
        }
    }
}

impl std::fmt::Debug for PluginCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
