//! Execution and unit lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Status of a logical execution.
///
/// ```text
/// idle ──submit──> running ──success──> complete
///                     │    ──error────> failed
///                     └──cancel──> stopping ──ack/watchdog──> cancelled
///                                     └──completion wins──> complete
/// ```
///
/// Terminal states move back to `running` on the next submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    Stopping,
    Complete,
    Failed,
    Cancelled,
}

/// Event driving an `ExecutionState` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// `submit()` accepted a new execution.
    Submit,
    /// The unit reported `complete`.
    Completed,
    /// The unit reported `error`, or the execution timed out or lost its unit.
    Failed,
    /// `interrupt_current()` signalled the unit.
    CancelRequested,
    /// The unit reported `cancelled`.
    CancelAcknowledged,
    /// The fallback grace delay or the watchdog resolved the execution.
    CancelForced,
}

impl ExecutionEvent {
    fn name(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Completed => "complete",
            Self::Failed => "error",
            Self::CancelRequested => "cancel",
            Self::CancelAcknowledged => "cancelled",
            Self::CancelForced => "forced cancel",
        }
    }
}

impl ExecutionState {
    /// Whether this state ends an execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Whether an execution in this state still occupies the unit.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Compute the next state for `event`.
    ///
    /// Returns `Error::InvalidTransition` for transitions the machine does not
    /// allow; callers keep the previous state in that case.
    pub fn transition(self, event: ExecutionEvent) -> Result<Self> {
        use ExecutionEvent as E;
        use ExecutionState as S;

        let next = match (self, event) {
            (S::Idle | S::Complete | S::Failed | S::Cancelled, E::Submit) => S::Running,
            (S::Running | S::Stopping, E::Completed) => S::Complete,
            (S::Running | S::Stopping, E::Failed) => S::Failed,
            (S::Running, E::CancelRequested) => S::Stopping,
            (S::Stopping, E::CancelAcknowledged | E::CancelForced) => S::Cancelled,
            // The runtime may observe a stale or racing interrupt on its own.
            (S::Running, E::CancelAcknowledged) => S::Cancelled,
            (from, event) => {
                return Err(Error::InvalidTransition {
                    from,
                    event: event.name(),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitLifecycleState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Errored,
    Terminated,
}

impl UnitLifecycleState {
    /// Whether `initialize()` may spawn a new unit from this state.
    pub fn can_spawn(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Terminated)
    }
}

impl fmt::Display for UnitLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Errored => "errored",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionEvent as E;
    use ExecutionState as S;

    #[test]
    fn test_happy_path() {
        let state = S::Idle.transition(E::Submit).unwrap();
        assert_eq!(state, S::Running);
        assert_eq!(state.transition(E::Completed).unwrap(), S::Complete);
        assert_eq!(state.transition(E::Failed).unwrap(), S::Failed);
    }

    #[test]
    fn test_cancel_path() {
        let stopping = S::Running.transition(E::CancelRequested).unwrap();
        assert_eq!(stopping, S::Stopping);
        assert_eq!(stopping.transition(E::CancelAcknowledged).unwrap(), S::Cancelled);
        assert_eq!(stopping.transition(E::CancelForced).unwrap(), S::Cancelled);
    }

    #[test]
    fn test_completion_wins_over_pending_cancel() {
        assert_eq!(S::Stopping.transition(E::Completed).unwrap(), S::Complete);
    }

    #[test]
    fn test_stopping_only_from_running() {
        for from in [S::Idle, S::Stopping, S::Complete, S::Failed, S::Cancelled] {
            let err = from.transition(E::CancelRequested).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
        }
    }

    #[test]
    fn test_terminal_states_resubmit() {
        for from in [S::Complete, S::Failed, S::Cancelled] {
            assert!(from.is_terminal());
            assert_eq!(from.transition(E::Submit).unwrap(), S::Running);
        }
        assert!(S::Running.is_active() && S::Stopping.is_active());
        assert!(S::Running.transition(E::Submit).is_err());
        assert!(S::Stopping.transition(E::Submit).is_err());
    }

    #[test]
    fn test_terminal_events_need_active_execution() {
        assert!(S::Idle.transition(E::Completed).is_err());
        assert!(S::Complete.transition(E::Failed).is_err());
        assert!(S::Cancelled.transition(E::CancelForced).is_err());
    }

    #[test]
    fn test_lifecycle_can_spawn() {
        assert!(UnitLifecycleState::Uninitialized.can_spawn());
        assert!(UnitLifecycleState::Terminated.can_spawn());
        assert!(!UnitLifecycleState::Errored.can_spawn());
        assert!(!UnitLifecycleState::Ready.can_spawn());
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&S::Stopping).unwrap();
        assert_eq!(json, format!("\"{}\"", S::Stopping));
    }
}
