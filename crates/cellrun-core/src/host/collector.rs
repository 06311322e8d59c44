//! Streaming output collection.
//!
//! Each in-flight execution owns an [`OutputCollector`]. Fragments are appended
//! in arrival order and reported through the optional callback; a terminal
//! envelope consumes the collector and produces the final `ExecutionResult`.
//!
//! Callbacks and result delivery never run under the host lock. The router
//! hands back a [`Delivery`] which the host fires once the lock is released.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::result::{CancellationOutcome, ExecutionResult, INTERRUPTED};
use crate::state::ExecutionState;

/// Receives a snapshot of the accumulated output whenever it changes.
pub trait OutputCallback: Send + Sync {
    fn on_output(&self, output: &[String], error: Option<&str>);
}

impl<F> OutputCallback for F
where
    F: Fn(&[String], Option<&str>) + Send + Sync,
{
    fn on_output(&self, output: &[String], error: Option<&str>) {
        self(output, error)
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Terminal {
    Complete,
    Failed(String),
    Cancelled(CancellationOutcome),
}

impl Terminal {
    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Complete => ExecutionState::Complete,
            Self::Failed(_) => ExecutionState::Failed,
            Self::Cancelled(_) => ExecutionState::Cancelled,
        }
    }
}

/// Accumulated output of one execution.
pub(crate) struct OutputCollector {
    output: Vec<String>,
    callback: Option<Arc<dyn OutputCallback>>,
}

impl OutputCollector {
    pub fn new(callback: Option<Arc<dyn OutputCallback>>) -> Self {
        Self {
            output: Vec::new(),
            callback,
        }
    }

    /// Append a stdout or stderr fragment.
    pub fn on_fragment(&mut self, text: String) -> Option<Delivery> {
        self.output.push(text);
        self.callback.as_ref().map(|callback| Delivery {
            callback: Some((Arc::clone(callback), self.output.clone(), None)),
            result: None,
        })
    }

    /// Consume the collector into the final result for `terminal`.
    ///
    /// Error endings report to the callback once more, with the error set.
    pub fn finish(self, terminal: Terminal, responder: oneshot::Sender<ExecutionResult>) -> Delivery {
        let state = terminal.state();
        let (error, cancellation) = match terminal {
            Terminal::Complete => (None, None),
            Terminal::Failed(error) => (Some(error), None),
            Terminal::Cancelled(outcome) => (Some(INTERRUPTED.to_string()), Some(outcome)),
        };

        let callback = match (&self.callback, &error) {
            (Some(callback), Some(error)) => {
                Some((Arc::clone(callback), self.output.clone(), Some(error.clone())))
            }
            _ => None,
        };

        let result = ExecutionResult {
            output: self.output,
            error,
            is_complete: true,
            state,
            cancellation,
        };
        Delivery {
            callback,
            result: Some((responder, result)),
        }
    }
}

impl fmt::Debug for OutputCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCollector")
            .field("fragments", &self.output.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

type CallbackCall = (Arc<dyn OutputCallback>, Vec<String>, Option<String>);

/// Work deferred until the host lock is released.
#[must_use]
pub(crate) struct Delivery {
    callback: Option<CallbackCall>,
    result: Option<(oneshot::Sender<ExecutionResult>, ExecutionResult)>,
}

impl Delivery {
    /// Run the callback, then hand the result to the waiting caller.
    pub fn deliver(self) {
        if let Some((callback, output, error)) = self.callback {
            callback.on_output(&output, error.as_deref());
        }
        if let Some((responder, result)) = self.result {
            // The caller may have dropped its PendingResult.
            let _ = responder.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(Vec<String>, Option<String>)>>>;

    fn recording() -> (Calls, Arc<dyn OutputCallback>) {
        let calls: Calls = Arc::default();
        let sink = Arc::clone(&calls);
        let callback = move |output: &[String], error: Option<&str>| {
            sink.lock()
                .unwrap()
                .push((output.to_vec(), error.map(str::to_string)));
        };
        (calls, Arc::new(callback))
    }

    #[test]
    fn test_fragments_reported_in_order() {
        let (calls, callback) = recording();
        let mut collector = OutputCollector::new(Some(callback));

        collector.on_fragment("a".to_string()).unwrap().deliver();
        collector.on_fragment("b".to_string()).unwrap().deliver();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, vec!["a"]);
        assert_eq!(calls[1].0, vec!["a", "b"]);
        assert!(calls[1].1.is_none());
    }

    #[test]
    fn test_no_callback_no_delivery() {
        let mut collector = OutputCollector::new(None);
        assert!(collector.on_fragment("a".to_string()).is_none());
    }

    #[test]
    fn test_complete_does_not_call_back() {
        let (calls, callback) = recording();
        let mut collector = OutputCollector::new(Some(callback));
        collector.on_fragment("x".to_string()).unwrap().deliver();

        let (tx, mut rx) = oneshot::channel();
        collector.finish(Terminal::Complete, tx).deliver();

        let result = rx.try_recv().unwrap();
        assert_eq!(result.output, vec!["x"]);
        assert!(result.error.is_none());
        assert!(result.is_complete);
        assert_eq!(result.state, ExecutionState::Complete);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_error_calls_back_once_more() {
        let (calls, callback) = recording();
        let mut collector = OutputCollector::new(Some(callback));
        collector.on_fragment("partial".to_string()).unwrap().deliver();

        let (tx, mut rx) = oneshot::channel();
        collector
            .finish(Terminal::Failed("NameError: x".to_string()), tx)
            .deliver();

        let result = rx.try_recv().unwrap();
        assert_eq!(result.output, vec!["partial"]);
        assert_eq!(result.error.as_deref(), Some("NameError: x"));
        assert_eq!(result.state, ExecutionState::Failed);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.as_deref(), Some("NameError: x"));
    }

    #[test]
    fn test_cancelled_result() {
        let collector = OutputCollector::new(None);
        let (tx, mut rx) = oneshot::channel();
        collector
            .finish(Terminal::Cancelled(CancellationOutcome::Forced), tx)
            .deliver();

        let result = rx.try_recv().unwrap();
        assert_eq!(result.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(result.state, ExecutionState::Cancelled);
        assert_eq!(result.cancellation, Some(CancellationOutcome::Forced));
    }
}
