//! Resource manager: capacity accounting, dispatch and cleanup against the
//! execution substrate.

mod credential;
mod manager;
mod substrate;

pub use credential::PluginCredential;
pub use manager::{BrokerEndpoint, ResourceManager, ResourceManagerConfig};
pub use substrate::{
    ExecutionSubstrate, MockSubstrate, SubstrateError, WorkloadInfo, WorkloadPhase, WorkloadSpec,
    WorkloadStatus,
};
