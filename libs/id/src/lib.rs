//! # ses-id
//!
//! Typed identifiers used by the node scheduler.
//!
//! Identifiers that the scheduler generates itself (science goals, dispatch
//! attempts) use a prefixed ULID: `{prefix}_{ulid}`, e.g.
//! `goal_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix keeps ids of different kinds
//! from being mixed up in logs and on the wire; the ULID keeps them unique and
//! time-ordered.
//!
//! Node names are *not* generated here. They come from the fleet inventory
//! (e.g. `000000000001`) and are carried as plain strings.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
