//! Cancellation of a running execution.
//!
//! The preferred path writes `SIGINT` into the interrupt segment shared with
//! the unit; a busy run polls it at its next safe point. Units that cannot
//! share memory get an `interrupt` envelope instead, and since that envelope
//! may sit in the unit's queue behind the run it is meant to stop, the host
//! marks the execution cancelled after a short grace delay without waiting.
//!
//! Either way a watchdog is armed. If no terminal envelope acknowledges the
//! interrupt before it fires, the unit is considered unresponsive and gets
//! torn down and recreated.

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::InterruptMode;
use crate::ipc::{CorrelationId, InterruptBuffer};

/// How interrupts reach the unit, decided once per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptStrategy {
    SharedMemory,
    Message,
}

impl InterruptStrategy {
    /// Pick the strategy for a unit given the configured mode.
    pub fn select(mode: InterruptMode, shared_memory_available: bool) -> Self {
        match mode {
            InterruptMode::Message => Self::Message,
            InterruptMode::SharedMemory | InterruptMode::Auto if shared_memory_available => {
                Self::SharedMemory
            }
            InterruptMode::SharedMemory => {
                tracing::warn!("Shared memory interrupts unavailable, using message fallback");
                Self::Message
            }
            InterruptMode::Auto => Self::Message,
        }
    }
}

impl std::fmt::Display for InterruptStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedMemory => write!(f, "shared memory"),
            Self::Message => write!(f, "message"),
        }
    }
}

/// Outcome of `interrupt_current()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    /// Nothing was running.
    Idle,
    /// An interrupt is already in progress.
    AlreadyStopping,
    /// The unit was signalled through the given strategy.
    Signaled(InterruptStrategy),
}

/// Per-unit interrupt state.
#[derive(Debug)]
pub(crate) struct CancellationCoordinator {
    strategy: InterruptStrategy,
    buffer: Option<InterruptBuffer>,
    awaiting: Option<CorrelationId>,
    watchdog: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl CancellationCoordinator {
    /// Coordinator for a fresh unit; allocates a segment for shared memory.
    pub fn new(strategy: InterruptStrategy) -> Self {
        let buffer = match strategy {
            InterruptStrategy::SharedMemory => Some(InterruptBuffer::new()),
            InterruptStrategy::Message => None,
        };
        Self {
            strategy,
            buffer,
            awaiting: None,
            watchdog: None,
            grace: None,
        }
    }

    pub fn buffer(&self) -> Option<&InterruptBuffer> {
        self.buffer.as_ref()
    }

    /// Clear any stale signal before a new execution is sent.
    pub fn prepare_execution(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.reset();
        }
    }

    /// Signal the unit about `id`.
    ///
    /// Returns `true` when the caller must still send the fallback envelope.
    pub fn request(&mut self, id: &CorrelationId) -> bool {
        self.awaiting = Some(id.clone());
        match &self.buffer {
            Some(buffer) => {
                buffer.signal();
                false
            }
            None => true,
        }
    }

    pub fn arm_watchdog(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.watchdog.replace(timer) {
            old.abort();
        }
    }

    pub fn arm_grace(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.grace.replace(timer) {
            old.abort();
        }
    }

    /// Whether an interrupt for `id` is still unacknowledged.
    pub fn is_awaiting(&self, id: &CorrelationId) -> bool {
        self.awaiting.as_ref() == Some(id)
    }

    /// Whether any interrupt is still unacknowledged.
    pub fn is_busy(&self) -> bool {
        self.awaiting.is_some()
    }

    /// A terminal envelope for `id` arrived. Returns `true` if it settled an interrupt.
    pub fn acknowledge(&mut self, id: &CorrelationId) -> bool {
        if !self.is_awaiting(id) {
            return false;
        }
        self.disarm();
        true
    }

    /// Forget the pending interrupt and stop its timers.
    pub fn disarm(&mut self) {
        self.awaiting = None;
        for timer in [self.watchdog.take(), self.grace.take()].into_iter().flatten() {
            timer.abort();
        }
    }
}

impl Drop for CancellationCoordinator {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::SIGINT;

    #[test]
    fn test_select_strategy() {
        use InterruptMode::*;
        assert_eq!(InterruptStrategy::select(Auto, true), InterruptStrategy::SharedMemory);
        assert_eq!(InterruptStrategy::select(Auto, false), InterruptStrategy::Message);
        assert_eq!(InterruptStrategy::select(SharedMemory, true), InterruptStrategy::SharedMemory);
        assert_eq!(InterruptStrategy::select(SharedMemory, false), InterruptStrategy::Message);
        assert_eq!(InterruptStrategy::select(Message, true), InterruptStrategy::Message);
    }

    #[test]
    fn test_shared_memory_request_signals_buffer() {
        let mut coordinator = CancellationCoordinator::new(InterruptStrategy::SharedMemory);
        let buffer = coordinator.buffer().cloned().unwrap();
        let id = CorrelationId::new("a");

        assert!(!coordinator.request(&id));
        assert_eq!(buffer.load(), SIGINT);
        assert!(coordinator.is_awaiting(&id));

        coordinator.prepare_execution();
        assert!(!buffer.is_signaled());
    }

    #[test]
    fn test_message_request_needs_envelope() {
        let mut coordinator = CancellationCoordinator::new(InterruptStrategy::Message);
        assert!(coordinator.buffer().is_none());
        assert!(coordinator.request(&CorrelationId::new("a")));
        assert!(coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_acknowledge_disarms_timers() {
        let mut coordinator = CancellationCoordinator::new(InterruptStrategy::Message);
        let id = CorrelationId::new("a");
        coordinator.request(&id);

        let (alive, stopped) = tokio::sync::oneshot::channel::<()>();
        coordinator.arm_watchdog(tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await;
        }));

        assert!(!coordinator.acknowledge(&CorrelationId::new("other")));
        assert!(coordinator.acknowledge(&id));
        assert!(!coordinator.is_busy());

        // Aborting the timer drops its sender.
        assert!(stopped.await.is_err());
    }
}
