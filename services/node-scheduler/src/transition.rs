//! Plugin status reducer.
//!
//! Every change to a plugin's scheduling status goes through [`apply`]. The
//! orchestration loop is the only caller (via [`Plugin::apply`]).
//!
//! ```text
//!            Promote            Launched
//!  Waiting ───────────> Ready ───────────> Running ───Stop───> Stopped
//!     ^  │                │                   │                   │
//!     │  └───Launched─────┼──────────────────>│                   │
//!     │                   │ Completed/Failed  │ Completed/Failed  │
//!     ├───────────────────┴───────────────────┘                   │
//!     └─────────────────────────Resume────────────────────────────┘
//! ```
//!
//! [`Plugin::apply`]: crate::model::Plugin::apply

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SchedulingStatus;

/// Inputs to the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// The policy found the plugin's trigger satisfied.
    Promote,
    /// The substrate reports the workload running.
    Launched,
    /// The workload finished successfully.
    Completed,
    /// The workload failed, or could not be dispatched.
    Failed,
    /// Administrative stop.
    Stop,
    /// The rule engine reports a stopped plugin runnable again.
    Resume,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Transition::Promote => "promote",
            Transition::Launched => "launched",
            Transition::Completed => "completed",
            Transition::Failed => "failed",
            Transition::Stop => "stop",
            Transition::Resume => "resume",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition: {transition} from {from}")]
    InvalidTransition {
        from: SchedulingStatus,
        transition: Transition,
    },
}

/// Computes the next status, or rejects the transition.
pub fn apply(
    current: SchedulingStatus,
    transition: Transition,
) -> Result<SchedulingStatus, TransitionError> {
    use SchedulingStatus::*;

    match (current, transition) {
        (Waiting, Transition::Promote) => Ok(Ready),
        (Ready | Waiting, Transition::Launched) => Ok(Running),
        (Running | Ready, Transition::Completed | Transition::Failed) => Ok(Waiting),
        (Running, Transition::Stop) => Ok(Stopped),
        (Stopped, Transition::Resume) => Ok(Waiting),
        (from, transition) => Err(TransitionError::InvalidTransition { from, transition }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use SchedulingStatus::*;

    #[rstest]
    #[case(Waiting, Transition::Promote, Ready)]
    #[case(Ready, Transition::Launched, Running)]
    #[case(Waiting, Transition::Launched, Running)]
    #[case(Running, Transition::Completed, Waiting)]
    #[case(Running, Transition::Failed, Waiting)]
    #[case(Ready, Transition::Failed, Waiting)]
    #[case(Ready, Transition::Completed, Waiting)]
    #[case(Running, Transition::Stop, Stopped)]
    #[case(Stopped, Transition::Resume, Waiting)]
    fn test_allowed(
        #[case] from: SchedulingStatus,
        #[case] transition: Transition,
        #[case] to: SchedulingStatus,
    ) {
        assert_eq!(apply(from, transition).unwrap(), to);
    }

    #[rstest]
    #[case(Ready, Transition::Promote)]
    #[case(Running, Transition::Promote)]
    #[case(Running, Transition::Launched)]
    #[case(Waiting, Transition::Completed)]
    #[case(Waiting, Transition::Stop)]
    #[case(Ready, Transition::Stop)]
    #[case(Stopped, Transition::Promote)]
    #[case(Stopped, Transition::Launched)]
    #[case(Stopped, Transition::Failed)]
    #[case(Waiting, Transition::Resume)]
    #[case(Ready, Transition::Resume)]
    #[case(Running, Transition::Resume)]
    fn test_rejected(#[case] from: SchedulingStatus, #[case] transition: Transition) {
        assert_eq!(
            apply(from, transition),
            Err(TransitionError::InvalidTransition { from, transition })
        );
    }

    #[test]
    fn test_status_cycle_returns_to_waiting() {
        let mut status = Waiting;
        for t in [Transition::Promote, Transition::Launched, Transition::Completed] {
            status = apply(status, t).unwrap();
        }
        assert_eq!(status, Waiting);
        assert_eq!(apply(status, Transition::Promote).unwrap(), Ready);
    }

    #[test]
    fn test_stopped_plugin_rejoins_cycle() {
        let mut status = Running;
        for t in [Transition::Stop, Transition::Resume, Transition::Promote] {
            status = apply(status, t).unwrap();
        }
        assert_eq!(status, Ready);
    }
}
