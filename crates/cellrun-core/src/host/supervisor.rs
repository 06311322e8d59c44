//! Ownership of the execution unit and its lifecycle.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::ipc::HostMessage;
use crate::state::UnitLifecycleState;
use crate::unit::{UnitEventReceiver, UnitHandle, UnitSpawner};

/// Owns the current unit, its reader task and init timer.
///
/// Every spawn bumps the generation. Events and timers tagged with an older
/// generation belong to a unit that no longer exists and must be ignored.
pub(crate) struct Supervisor {
    spawner: Arc<dyn UnitSpawner>,
    lifecycle: watch::Sender<UnitLifecycleState>,
    generation: u64,
    unit: Option<Box<dyn UnitHandle>>,
    reader: Option<JoinHandle<()>>,
    init_timer: Option<JoinHandle<()>>,
    last_error: Option<Error>,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn UnitSpawner>) -> Self {
        let (lifecycle, _) = watch::channel(UnitLifecycleState::Uninitialized);
        Self {
            spawner,
            lifecycle,
            generation: 0,
            unit: None,
            reader: None,
            init_timer: None,
            last_error: None,
        }
    }

    pub fn lifecycle(&self) -> UnitLifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnitLifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn set_lifecycle(&self, state: UnitLifecycleState) {
        let previous = self.lifecycle.send_replace(state);
        if previous != state {
            tracing::debug!("Unit lifecycle {} -> {}", previous, state);
        }
    }

    /// Create a unit and send it the init envelope.
    ///
    /// Returns the new generation and the unit's event stream.
    pub fn spawn(&mut self) -> Result<(u64, UnitEventReceiver)> {
        self.teardown();
        self.generation += 1;
        self.last_error = None;
        self.set_lifecycle(UnitLifecycleState::Initializing);

        let (events_tx, events) = mpsc::unbounded_channel();
        let spawned = self
            .spawner
            .spawn(events_tx)
            .and_then(|mut unit| {
                unit.post(HostMessage::init())?;
                Ok(unit)
            });
        match spawned {
            Ok(unit) => {
                tracing::info!(
                    "Started {} (generation {})",
                    self.spawner.describe(),
                    self.generation
                );
                self.unit = Some(unit);
                Ok((self.generation, events))
            }
            Err(e) => {
                let error = Error::Initialization(e.to_string());
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    pub fn attach_reader(&mut self, reader: JoinHandle<()>) {
        if let Some(old) = self.reader.replace(reader) {
            old.abort();
        }
    }

    pub fn attach_init_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.init_timer.replace(timer) {
            old.abort();
        }
    }

    pub fn post(&mut self, message: HostMessage) -> Result<()> {
        match self.unit.as_mut() {
            Some(unit) => unit.post(message),
            None => Err(Error::NotReady),
        }
    }

    /// The unit answered the init handshake.
    pub fn mark_ready(&mut self) {
        if let Some(timer) = self.init_timer.take() {
            timer.abort();
        }
        self.set_lifecycle(UnitLifecycleState::Ready);
        tracing::info!("Execution unit ready (generation {})", self.generation);
    }

    /// Record a fatal unit error and destroy the unit.
    pub fn fail(&mut self, error: Error) {
        tracing::error!("Execution unit failed: {}", error);
        self.teardown();
        self.last_error = Some(error);
        self.set_lifecycle(UnitLifecycleState::Errored);
    }

    /// Destroy the unit and stop its tasks. The lifecycle is left to the caller.
    ///
    /// Bumps the generation so that anything still in flight for the old unit
    /// is ignored.
    pub fn teardown(&mut self) {
        let had_unit = self.unit.is_some();
        if let Some(mut unit) = self.unit.take() {
            unit.terminate();
        }
        for task in [self.reader.take(), self.init_timer.take()].into_iter().flatten() {
            task.abort();
        }
        if had_unit {
            self.generation += 1;
            tracing::debug!("Execution unit torn down");
        }
    }

    /// Tear down and settle in `state` (`Uninitialized` or `Terminated`).
    pub fn stop(&mut self, state: UnitLifecycleState) {
        self.teardown();
        self.last_error = None;
        self.set_lifecycle(state);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}
