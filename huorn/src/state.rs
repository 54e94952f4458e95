//! VM lifecycle states and guarded transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum VmState {
    /// Bundle loaded or freshly built, never started.
    #[default]
    Created,
    /// Engine start in progress.
    Starting,
    /// Guest is running.
    Running,
    /// Engine pause in progress.
    Pausing,
    /// Guest execution is suspended.
    Paused,
    /// Engine stop in progress.
    Stopping,
    /// Guest has been stopped.
    Stopped,
    /// The engine reported an unrecoverable failure.
    Error,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        })
    }
}

/// Lifecycle operation requested on a VM handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Operation {
    /// Boot the guest.
    Start,
    /// Suspend guest execution.
    Pause,
    /// Continue a paused guest.
    Resume,
    /// Shut the guest down.
    Stop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        })
    }
}

impl Operation {
    /// Validates `self` against `state`.
    ///
    /// Returns the `(transitional, settled)` pair the VM passes through on
    /// success. `transitional` is `None` when the operation has no
    /// in-progress state of its own.
    pub fn plan(self, state: VmState) -> Result<(Option<VmState>, VmState)> {
        use VmState::{Created, Paused, Pausing, Running, Starting, Stopped, Stopping};

        match (self, state) {
            (Self::Start, Created | Stopped) => Ok((Some(Starting), Running)),
            (Self::Pause, Running) => Ok((Some(Pausing), Paused)),
            (Self::Resume, Paused) => Ok((None, Running)),
            (Self::Stop, Running | Paused) => Ok((Some(Stopping), Stopped)),
            _ => Err(Error::Lifecycle {
                state,
                operation: self,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert_eq!(
            Operation::Start.plan(VmState::Created).unwrap(),
            (Some(VmState::Starting), VmState::Running)
        );
        assert_eq!(
            Operation::Start.plan(VmState::Stopped).unwrap(),
            (Some(VmState::Starting), VmState::Running)
        );
        assert_eq!(
            Operation::Pause.plan(VmState::Running).unwrap(),
            (Some(VmState::Pausing), VmState::Paused)
        );
        assert_eq!(
            Operation::Resume.plan(VmState::Paused).unwrap(),
            (None, VmState::Running)
        );
        assert_eq!(
            Operation::Stop.plan(VmState::Paused).unwrap(),
            (Some(VmState::Stopping), VmState::Stopped)
        );
    }

    #[test]
    fn illegal_transitions_name_the_pair() {
        for (op, state) in [
            (Operation::Stop, VmState::Created),
            (Operation::Stop, VmState::Stopped),
            (Operation::Pause, VmState::Paused),
            (Operation::Resume, VmState::Running),
            (Operation::Start, VmState::Running),
            (Operation::Start, VmState::Error),
        ] {
            match op.plan(state) {
                Err(Error::Lifecycle { state: s, operation }) => {
                    assert_eq!(s, state);
                    assert_eq!(operation, op);
                }
                other => panic!("{op} from {state}: expected lifecycle error, got {other:?}"),
            }
        }
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&VmState::Paused).unwrap(),
            "\"paused\""
        );
    }
}
