//! Results handed back to callers of `submit()`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::ipc::CorrelationId;
use crate::state::ExecutionState;

/// Error text for submissions made before the unit is ready.
pub const NOT_READY: &str = "Worker is not ready";

/// Error text for submissions made while another execution is in flight.
pub const BUSY: &str = "Another execution is already running";

/// Error text for cancelled executions.
pub const INTERRUPTED: &str = "Execution interrupted by user";

/// Error text when the host goes away before a result arrives.
pub const HOST_DROPPED: &str = "Execution host was dropped";

/// Error text for executions cut short by an explicit teardown.
pub const TERMINATED: &str = "Execution unit was terminated";

/// Error text for executions lost to a forced unit reset.
pub const RESET: &str = "Execution unit was reset";

/// Message for an execution that ran out of time.
pub fn timeout_message(budget: Duration) -> String {
    let millis = budget.as_millis();
    if millis % 1000 == 0 {
        format!("Execution timed out after {} seconds", millis / 1000)
    } else {
        format!("Execution timed out after {} ms", millis)
    }
}

/// Message for executions lost to a unit crash.
pub fn crash_message(reason: &str) -> String {
    format!("Execution unit crashed: {}", reason)
}

/// How confident the host is that a cancelled execution actually stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationOutcome {
    /// The unit reported `cancelled`.
    Acknowledged,
    /// Message fallback: marked cancelled after the grace delay, unconfirmed.
    Assumed,
    /// The watchdog fired and the unit was torn down.
    Forced,
}

/// Final outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Output fragments in arrival order, stdout and stderr interleaved.
    pub output: Vec<String>,
    /// Error text, `None` on success.
    pub error: Option<String>,
    /// Whether the execution reached a terminal condition (false when rejected).
    pub is_complete: bool,
    /// Final execution state.
    pub state: ExecutionState,
    /// Set when the execution was cancelled.
    pub cancellation: Option<CancellationOutcome>,
}

impl ExecutionResult {
    /// A submission that never reached the unit.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            output: Vec::new(),
            error: Some(error.into()),
            is_complete: false,
            state: ExecutionState::Idle,
            cancellation: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.is_complete && self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ExecutionState::Cancelled
    }

    /// All output fragments joined together.
    pub fn text(&self) -> String {
        self.output.concat()
    }
}

/// Future resolving to the `ExecutionResult` of one submission.
///
/// Rejected submissions are resolved from the start; [`PendingResult::rejection`]
/// exposes them without awaiting.
#[derive(Debug)]
pub struct PendingResult {
    id: Option<CorrelationId>,
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Resolved(Option<ExecutionResult>),
    Waiting(oneshot::Receiver<ExecutionResult>),
}

impl PendingResult {
    pub(crate) fn rejected(error: impl Into<String>) -> Self {
        Self {
            id: None,
            state: PendingState::Resolved(Some(ExecutionResult::rejected(error))),
        }
    }

    pub(crate) fn waiting(id: CorrelationId, rx: oneshot::Receiver<ExecutionResult>) -> Self {
        Self {
            id: Some(id),
            state: PendingState::Waiting(rx),
        }
    }

    /// Correlation id of the execution, `None` if it was rejected.
    pub fn id(&self) -> Option<&CorrelationId> {
        self.id.as_ref()
    }

    /// The immediate result of a rejected submission.
    pub fn rejection(&self) -> Option<&ExecutionResult> {
        match &self.state {
            PendingState::Resolved(result) => result.as_ref(),
            PendingState::Waiting(_) => None,
        }
    }
}

impl Future for PendingResult {
    type Output = ExecutionResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Resolved(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| ExecutionResult::rejected("Result already taken")),
            ),
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| ExecutionResult::rejected(HOST_DROPPED))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            timeout_message(Duration::from_secs(30)),
            "Execution timed out after 30 seconds"
        );
        assert_eq!(
            timeout_message(Duration::from_millis(150)),
            "Execution timed out after 150 ms"
        );
    }

    #[tokio::test]
    async fn test_rejected_resolves_immediately() {
        let pending = PendingResult::rejected(NOT_READY);
        assert!(pending.id().is_none());
        assert_eq!(pending.rejection().unwrap().error.as_deref(), Some(NOT_READY));

        let result = pending.await;
        assert!(result.output.is_empty());
        assert!(!result.is_complete);
    }

    #[tokio::test]
    async fn test_dropped_sender_resolves_with_error() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingResult::waiting(CorrelationId::new("a"), rx);
        assert!(pending.rejection().is_none());
        drop(tx);

        let result = pending.await;
        assert_eq!(result.error.as_deref(), Some(HOST_DROPPED));
    }

    #[test]
    fn test_result_helpers() {
        let result = ExecutionResult {
            output: vec!["a".to_string(), "b".to_string()],
            error: None,
            is_complete: true,
            state: ExecutionState::Complete,
            cancellation: None,
        };
        assert!(result.is_success());
        assert!(!result.is_cancelled());
        assert_eq!(result.text(), "ab");
    }
}
