//! # ses-events
//!
//! The single message shape that flows through every internal queue of the
//! node scheduler, plus the messages exchanged with its collaborators.
//!
//! ## Internal events
//!
//! An [`Event`] is `{kind, body}`: a closed set of kinds and a free-form
//! correlation string (a goal name, a plugin name). Optional `meta` carries
//! extra correlation such as the goal a plugin belongs to. New kinds can be
//! added without touching any transport.
//!
//! ## Collaborator messages
//!
//! - Rule engine: [`KbRequest`] out, [`PluginContextEvent`] in.
//! - Telemetry sink: [`TelemetryRecord`] out, produced from an [`Event`].

mod error;
mod knowledgebase;
mod telemetry;
mod types;

pub use error::EventError;
pub use knowledgebase::*;
pub use telemetry::*;
pub use types::*;
