//! Correlation-id based routing of unit envelopes.

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::collector::{Delivery, OutputCollector, Terminal};
use super::result::{CancellationOutcome, ExecutionResult};
use crate::error::{Error, Result};
use crate::ipc::{CorrelationId, UnitMessage};

/// Host-side bookkeeping for one execution awaiting its terminal envelope.
#[derive(Debug)]
pub(crate) struct PendingExecution {
    collector: OutputCollector,
    responder: oneshot::Sender<ExecutionResult>,
    timeout: Option<JoinHandle<()>>,
}

impl PendingExecution {
    pub fn new(collector: OutputCollector, responder: oneshot::Sender<ExecutionResult>) -> Self {
        Self {
            collector,
            responder,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: JoinHandle<()>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop the timeout timer and build the final delivery.
    pub fn finish(self, terminal: Terminal) -> Delivery {
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        self.collector.finish(terminal, self.responder)
    }
}

/// What the router did with an envelope.
pub(crate) enum Dispatch {
    /// Output was collected, maybe with a callback to fire.
    Progress(Option<Delivery>),
    /// A terminal envelope removed its execution from the table.
    Resolved {
        id: CorrelationId,
        pending: PendingExecution,
        terminal: Terminal,
    },
    /// No handler for the envelope's id.
    Dropped(UnitMessage),
}

/// Table of in-flight executions keyed by correlation id.
///
/// An id is removed exactly once, by whichever terminal condition arrives
/// first; later envelopes for it are dropped.
#[derive(Debug, Default)]
pub(crate) struct Router {
    pending: FxHashMap<CorrelationId, PendingExecution>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: CorrelationId, pending: PendingExecution) -> Result<()> {
        if id.is_reserved() {
            return Err(Error::Ipc(format!("correlation id '{}' is reserved", id)));
        }
        if self.pending.contains_key(&id) {
            return Err(Error::Ipc(format!("correlation id '{}' is already in flight", id)));
        }
        self.pending.insert(id, pending);
        Ok(())
    }

    pub fn dispatch(&mut self, message: UnitMessage) -> Dispatch {
        let terminal = match &message {
            UnitMessage::Stdout { id, value } | UnitMessage::Stderr { id, value } => {
                return match self.pending.get_mut(id) {
                    Some(pending) => Dispatch::Progress(pending.collector.on_fragment(value.clone())),
                    None => Dispatch::Dropped(message),
                };
            }
            UnitMessage::Complete { .. } => Terminal::Complete,
            UnitMessage::Error { error, .. } => Terminal::Failed(error.clone()),
            UnitMessage::Cancelled { .. } => Terminal::Cancelled(CancellationOutcome::Acknowledged),
            UnitMessage::Ready { .. } => return Dispatch::Dropped(message),
        };

        match self.pending.remove_entry(message.id()) {
            Some((id, pending)) => Dispatch::Resolved {
                id,
                pending,
                terminal,
            },
            None => Dispatch::Dropped(message),
        }
    }

    pub fn remove(&mut self, id: &CorrelationId) -> Option<PendingExecution> {
        self.pending.remove(id)
    }

    /// Take every pending execution, e.g. when the unit goes away.
    pub fn drain(&mut self) -> Vec<(CorrelationId, PendingExecution)> {
        self.pending.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
