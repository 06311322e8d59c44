//! Host side of the execution unit.
//!
//! [`ExecutionHost`] owns exactly one unit at a time and composes four parts:
//!
//! - **Supervisor** - spawns the unit, runs the init handshake with a timeout,
//!   and tears the unit down on crash, terminate or watchdog expiry.
//! - **Router** - maps correlation ids to in-flight executions and resolves
//!   each one at most once.
//! - **Collector** - accumulates output fragments and reports them to an
//!   optional callback.
//! - **Cancellation coordinator** - signals interrupts through shared memory
//!   or the message fallback, and arms the watchdog.
//!
//! # Concurrency
//!
//! All mutable state lives behind one `std::sync::Mutex` that is never held
//! across an `.await`. Unit events are pumped by a reader task per unit
//! generation; timers are plain tokio tasks holding a `Weak` back-reference so
//! that dropping the last host handle tears everything down. Callbacks and
//! result delivery happen after the lock is released.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cellrun_core::{ExecutionHost, HostConfig, ScriptInterpreter, ThreadSpawner};
//!
//! # async fn demo() -> cellrun_core::Result<()> {
//! let host = ExecutionHost::new(
//!     Arc::new(ThreadSpawner::new(ScriptInterpreter::new)),
//!     HostConfig::default(),
//! );
//! host.initialize().await?;
//!
//! let result = host.submit("print hello").await;
//! assert_eq!(result.output, vec!["hello\n"]);
//! # Ok(())
//! # }
//! ```

mod cancel;
mod collector;
mod result;
mod router;
mod supervisor;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::ipc::{CorrelationId, HostMessage, INIT_ID, IdGenerator, UnitMessage};
use crate::state::{ExecutionEvent, ExecutionState, UnitLifecycleState};
use crate::unit::{UnitEvent, UnitEventReceiver, UnitSpawner};

use cancel::CancellationCoordinator;
use collector::{Delivery, OutputCollector, Terminal};
use router::{Dispatch, PendingExecution, Router};
use supervisor::Supervisor;

pub use cancel::{InterruptStatus, InterruptStrategy};
pub use collector::OutputCallback;
pub use result::{
    BUSY, CancellationOutcome, ExecutionResult, HOST_DROPPED, INTERRUPTED, NOT_READY,
    PendingResult, RESET, TERMINATED,
};

use result::{crash_message, timeout_message};

/// Handle to a supervised execution unit.
///
/// Cheap to clone; all clones drive the same unit. The unit is destroyed when
/// the last clone is dropped.
#[derive(Clone)]
pub struct ExecutionHost {
    shared: Arc<Shared>,
}

struct Shared {
    config: HostConfig,
    strategy: InterruptStrategy,
    ids: IdGenerator,
    state: Mutex<HostState>,
}

struct HostState {
    supervisor: Supervisor,
    router: Router,
    cancel: CancellationCoordinator,
    current: Option<CorrelationId>,
    execution: ExecutionState,
}

impl ExecutionHost {
    /// Create a host for units produced by `spawner`. Nothing is spawned until
    /// [`initialize`](Self::initialize).
    pub fn new(spawner: Arc<dyn UnitSpawner>, config: HostConfig) -> Self {
        let strategy =
            InterruptStrategy::select(config.interrupt_mode, spawner.supports_shared_memory());
        tracing::debug!("Interrupt strategy for {}: {}", spawner.describe(), strategy);

        let state = HostState {
            supervisor: Supervisor::new(spawner),
            router: Router::new(),
            cancel: CancellationCoordinator::new(strategy),
            current: None,
            execution: ExecutionState::Idle,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                strategy,
                ids: IdGenerator::new(),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// How interrupts reach the unit.
    pub fn strategy(&self) -> InterruptStrategy {
        self.shared.strategy
    }

    pub fn lifecycle(&self) -> UnitLifecycleState {
        self.shared.lock().supervisor.lifecycle()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle() == UnitLifecycleState::Ready
    }

    /// State of the current or most recent execution.
    pub fn execution_state(&self) -> ExecutionState {
        self.shared.lock().execution
    }

    /// Correlation id of the execution occupying the unit, if any.
    pub fn current_execution(&self) -> Option<CorrelationId> {
        self.shared.lock().current.clone()
    }

    /// The error that put the unit into `Errored`.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.lock().supervisor.last_error().cloned()
    }

    /// Number of units spawned or torn down so far; changes on every recreate.
    pub fn generation(&self) -> u64 {
        self.shared.lock().supervisor.generation()
    }

    /// Spawn the unit and wait for its init handshake.
    ///
    /// Returns immediately if the unit is already ready, joins an init that is
    /// already in progress, and returns the stored error if the unit failed.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            match state.supervisor.lifecycle() {
                UnitLifecycleState::Ready => return Ok(()),
                UnitLifecycleState::Errored => return Err(state.failure()),
                UnitLifecycleState::Initializing => {}
                UnitLifecycleState::Uninitialized | UnitLifecycleState::Terminated => {
                    self.shared.start_unit(&mut state)?;
                }
            }
        }
        self.wait_ready().await
    }

    /// Wait until the unit is ready, e.g. after a watchdog reset.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut lifecycle = self.shared.lock().supervisor.subscribe();
        loop {
            let current = *lifecycle.borrow_and_update();
            match current {
                UnitLifecycleState::Ready => return Ok(()),
                UnitLifecycleState::Errored => return Err(self.shared.lock().failure()),
                UnitLifecycleState::Uninitialized => return Err(Error::NotReady),
                UnitLifecycleState::Terminated => return Err(Error::Shutdown),
                UnitLifecycleState::Initializing => {}
            }
            if lifecycle.changed().await.is_err() {
                return Err(Error::Shutdown);
            }
        }
    }

    /// Submit code for execution. Must be called within a tokio runtime.
    ///
    /// Rejected submissions (unit not ready, or another execution in flight)
    /// resolve immediately with an error and empty output.
    pub fn submit(&self, code: impl Into<String>) -> PendingResult {
        self.shared.submit(code.into(), None)
    }

    /// Like [`submit`](Self::submit), reporting output to `callback` as it streams.
    pub fn submit_with<C>(&self, code: impl Into<String>, callback: C) -> PendingResult
    where
        C: OutputCallback + 'static,
    {
        self.shared.submit(code.into(), Some(Arc::new(callback)))
    }

    /// Ask the running execution to stop. Never blocks.
    pub fn interrupt_current(&self) -> InterruptStatus {
        self.shared.interrupt()
    }

    /// Destroy the unit. In-flight executions fail; a later
    /// [`initialize`](Self::initialize) spawns a fresh unit.
    pub fn terminate(&self) {
        self.shared.stop(UnitLifecycleState::Uninitialized, TERMINATED);
    }

    /// Terminate and initialize a fresh unit.
    pub async fn reset(&self) -> Result<()> {
        self.terminate();
        self.initialize().await
    }

    /// Destroy the unit for good. `initialize()` may still be called again.
    pub fn shutdown(&self) {
        self.shared
            .stop(UnitLifecycleState::Terminated, "Execution host has been shut down");
    }
}

impl fmt::Debug for ExecutionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ExecutionHost")
            .field("lifecycle", &state.supervisor.lifecycle())
            .field("execution", &state.execution)
            .field("strategy", &self.shared.strategy)
            .field("pending", &state.router.len())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `action` after `delay` unless the host is gone by then.
    fn schedule<F>(self: &Arc<Self>, delay: Duration, action: F) -> JoinHandle<()>
    where
        F: FnOnce(&Arc<Shared>) + Send + 'static,
    {
        let host = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = host.upgrade() {
                action(&shared);
            }
        })
    }

    fn start_unit(self: &Arc<Self>, state: &mut HostState) -> Result<()> {
        state.cancel = CancellationCoordinator::new(self.strategy);
        state.current = None;

        let (generation, events) = state.supervisor.spawn()?;
        let reader = tokio::spawn(pump_events(Arc::downgrade(self), generation, events));
        state.supervisor.attach_reader(reader);

        let budget = self.config.init_timeout();
        let timer = self.schedule(budget, move |shared| shared.on_init_timeout(generation, budget));
        state.supervisor.attach_init_timer(timer);
        Ok(())
    }

    fn submit(self: &Arc<Self>, code: String, callback: Option<Arc<dyn OutputCallback>>) -> PendingResult {
        let mut deliveries = Vec::new();
        let pending = {
            let mut state = self.lock();
            if state.supervisor.lifecycle() != UnitLifecycleState::Ready {
                return PendingResult::rejected(NOT_READY);
            }
            if state.current.is_some() || state.cancel.is_busy() {
                return PendingResult::rejected(BUSY);
            }

            let id = self.ids.next_id();
            let generation = state.supervisor.generation();
            state.cancel.prepare_execution();

            let (tx, rx) = oneshot::channel();
            let budget = self.config.execution_timeout();
            let timer_id = id.clone();
            let timeout = self.schedule(budget, move |shared| {
                shared.on_execution_timeout(generation, &timer_id, budget)
            });
            let execution =
                PendingExecution::new(OutputCollector::new(callback), tx).with_timeout(timeout);
            if let Err(e) = state.router.register(id.clone(), execution) {
                return PendingResult::rejected(e.to_string());
            }

            state.execution = state
                .execution
                .transition(ExecutionEvent::Submit)
                .unwrap_or(ExecutionState::Running);
            state.current = Some(id.clone());

            tracing::debug!("Submitting execution {}", id);
            if let Err(e) = state.supervisor.post(HostMessage::execute(id.clone(), code)) {
                tracing::error!("Failed to send execution {}: {}", id, e);
                deliveries.extend(state.resolve(&id, Terminal::Failed(e.to_string())));
            }
            PendingResult::waiting(id, rx)
        };
        deliver(deliveries);
        pending
    }

    fn interrupt(self: &Arc<Self>) -> InterruptStatus {
        let mut state = self.lock();
        let Some(id) = state.current.clone() else {
            return InterruptStatus::Idle;
        };
        match state.execution.transition(ExecutionEvent::CancelRequested) {
            Ok(next) => state.execution = next,
            Err(_) => return InterruptStatus::AlreadyStopping,
        }

        tracing::info!("Interrupting execution {} via {}", id, self.strategy);
        let generation = state.supervisor.generation();
        if state.cancel.request(&id) {
            if let Err(e) = state.supervisor.post(HostMessage::interrupt_fallback()) {
                tracing::warn!("Failed to send interrupt envelope: {}", e);
            }
            let grace_id = id.clone();
            let grace = self.schedule(self.config.fallback_grace(), move |shared| {
                shared.on_grace(generation, &grace_id)
            });
            state.cancel.arm_grace(grace);
        }

        let watchdog = self.schedule(self.config.watchdog(), move |shared| {
            shared.on_watchdog(generation, &id)
        });
        state.cancel.arm_watchdog(watchdog);
        InterruptStatus::Signaled(self.strategy)
    }

    fn stop(&self, lifecycle: UnitLifecycleState, reason: &str) {
        let deliveries = {
            let mut state = self.lock();
            let deliveries = state.abandon_all(reason);
            state.supervisor.stop(lifecycle);
            state.execution = ExecutionState::Idle;
            deliveries
        };
        deliver(deliveries);
    }

    fn on_event(&self, generation: u64, event: UnitEvent) {
        let deliveries: Vec<Delivery> = {
            let mut state = self.lock();
            if !state.supervisor.is_current(generation) {
                tracing::debug!("Ignoring event from retired unit generation {}", generation);
                return;
            }
            match event {
                UnitEvent::Message(message) => state.on_message(message).into_iter().collect(),
                UnitEvent::Exited { reason } => state.on_exit(&reason),
            }
        };
        deliver(deliveries);
    }

    fn on_init_timeout(&self, generation: u64, budget: Duration) {
        let mut state = self.lock();
        if state.supervisor.is_current(generation)
            && state.supervisor.lifecycle() == UnitLifecycleState::Initializing
        {
            state.supervisor.fail(Error::Initialization(format!(
                "unit did not become ready within {} ms",
                budget.as_millis()
            )));
        }
    }

    fn on_execution_timeout(&self, generation: u64, id: &CorrelationId, budget: Duration) {
        let delivery = {
            let mut state = self.lock();
            if !state.supervisor.is_current(generation) {
                return;
            }
            let delivery = state.resolve(id, Terminal::Failed(timeout_message(budget)));
            if delivery.is_some() {
                tracing::warn!("Execution {} timed out after {:?}", id, budget);
            }
            delivery
        };
        deliver(delivery);
    }

    fn on_grace(&self, generation: u64, id: &CorrelationId) {
        let delivery = {
            let mut state = self.lock();
            if !state.supervisor.is_current(generation)
                || state.execution != ExecutionState::Stopping
                || state.current.as_ref() != Some(id)
            {
                return;
            }
            tracing::debug!("No acknowledgment yet, assuming {} cancelled", id);
            state.resolve(id, Terminal::Cancelled(CancellationOutcome::Assumed))
        };
        deliver(delivery);
    }

    fn on_watchdog(self: &Arc<Self>, generation: u64, id: &CorrelationId) {
        let deliveries = {
            let mut state = self.lock();
            if !state.supervisor.is_current(generation) || !state.cancel.is_awaiting(id) {
                return;
            }
            tracing::warn!(
                "Execution unit did not acknowledge interrupt of {} within {} ms, recreating it",
                id,
                self.config.watchdog_ms
            );

            let mut deliveries: Vec<Delivery> = state
                .resolve(id, Terminal::Cancelled(CancellationOutcome::Forced))
                .into_iter()
                .collect();
            deliveries.extend(state.abandon_all(RESET));
            state.supervisor.teardown();
            if let Err(e) = self.start_unit(&mut state) {
                tracing::error!("Failed to recreate execution unit: {}", e);
            }
            deliveries
        };
        deliver(deliveries);
    }
}

impl HostState {
    fn failure(&self) -> Error {
        self.supervisor
            .last_error()
            .cloned()
            .unwrap_or_else(|| Error::Initialization("execution unit errored".to_string()))
    }

    fn on_message(&mut self, message: UnitMessage) -> Option<Delivery> {
        match &message {
            UnitMessage::Ready { id } if id.as_str() == INIT_ID => {
                self.on_ready();
                return None;
            }
            UnitMessage::Error { id, error } if id.as_str() == INIT_ID => {
                if self.supervisor.lifecycle() == UnitLifecycleState::Initializing {
                    self.supervisor.fail(Error::Initialization(error.clone()));
                } else {
                    tracing::warn!("Ignoring late init error: {}", error);
                }
                return None;
            }
            _ => {}
        }

        if message.is_terminal() && self.cancel.acknowledge(message.id()) {
            tracing::debug!("Interrupt of {} acknowledged with {}", message.id(), message.kind());
        }

        match self.router.dispatch(message) {
            Dispatch::Progress(delivery) => delivery,
            Dispatch::Resolved {
                id,
                pending,
                terminal,
            } => Some(self.settle(&id, pending, terminal)),
            Dispatch::Dropped(message) => {
                tracing::debug!(
                    "No handler for {} envelope '{}', dropping",
                    message.kind(),
                    message.id()
                );
                None
            }
        }
    }

    fn on_ready(&mut self) {
        if self.supervisor.lifecycle() != UnitLifecycleState::Initializing {
            tracing::warn!("Ignoring unexpected ready envelope");
            return;
        }
        self.supervisor.mark_ready();
        if let Some(buffer) = self.cancel.buffer().cloned() {
            if let Err(e) = self.supervisor.post(HostMessage::set_interrupt_buffer(buffer)) {
                tracing::warn!("Failed to share interrupt segment: {}", e);
            }
        }
    }

    fn on_exit(&mut self, reason: &str) -> Vec<Delivery> {
        let error = if self.supervisor.lifecycle() == UnitLifecycleState::Initializing {
            Error::Initialization(reason.to_string())
        } else {
            Error::UnitCrashed(reason.to_string())
        };
        let deliveries = self.abandon_all(&crash_message(reason));
        self.supervisor.fail(error);
        deliveries
    }

    /// Resolve `id` if it is still pending.
    fn resolve(&mut self, id: &CorrelationId, terminal: Terminal) -> Option<Delivery> {
        let pending = self.router.remove(id)?;
        Some(self.settle(id, pending, terminal))
    }

    fn settle(&mut self, id: &CorrelationId, pending: PendingExecution, terminal: Terminal) -> Delivery {
        if self.current.as_ref() == Some(id) {
            let event = match &terminal {
                Terminal::Complete => ExecutionEvent::Completed,
                Terminal::Failed(_) => ExecutionEvent::Failed,
                Terminal::Cancelled(CancellationOutcome::Acknowledged) => {
                    ExecutionEvent::CancelAcknowledged
                }
                Terminal::Cancelled(_) => ExecutionEvent::CancelForced,
            };
            self.execution = self.execution.transition(event).unwrap_or_else(|e| {
                tracing::warn!("{}", e);
                terminal.state()
            });
            self.current = None;
        }
        tracing::debug!("Execution {} finished as {}", id, terminal.state());
        pending.finish(terminal)
    }

    /// Fail every pending execution with `reason` and forget any interrupt.
    fn abandon_all(&mut self, reason: &str) -> Vec<Delivery> {
        self.cancel.disarm();
        let drained = self.router.drain();
        let deliveries: Vec<Delivery> = drained
            .into_iter()
            .map(|(id, pending)| self.settle(&id, pending, Terminal::Failed(reason.to_string())))
            .collect();
        self.current = None;
        deliveries
    }
}

async fn pump_events(host: Weak<Shared>, generation: u64, mut events: UnitEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(shared) = host.upgrade() else {
            return;
        };
        shared.on_event(generation, event);
    }
}

fn deliver(deliveries: impl IntoIterator<Item = Delivery>) {
    for delivery in deliveries {
        delivery.deliver();
    }
}
