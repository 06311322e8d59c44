//! In-process unit running on a dedicated thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::thread;

use super::{UnitEvent, UnitEventSender, UnitHandle, UnitSpawner};
use crate::error::{Error, Result};
use crate::ipc::{HostMessage, UnitMessage};
use crate::runtime::{EventSink, Interpreter, UnitRuntime};

type InterpreterFactory = dyn Fn() -> Box<dyn Interpreter> + Send + Sync;

/// Spawns units that host an interpreter on their own OS thread.
///
/// Commands travel over a channel drained by the unit thread, so an envelope
/// sent while code is running waits until the run returns, exactly like a
/// worker's message queue. Only the shared interrupt byte reaches a busy run.
#[derive(Clone)]
pub struct ThreadSpawner {
    factory: Arc<InterpreterFactory>,
    shared_memory: bool,
}

impl ThreadSpawner {
    /// Create a spawner building a fresh interpreter for every unit.
    pub fn new<F, I>(factory: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Interpreter + 'static,
    {
        Self {
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Interpreter>),
            shared_memory: true,
        }
    }

    /// Pretend shared memory is unavailable, forcing the message fallback.
    pub fn without_shared_memory(mut self) -> Self {
        self.shared_memory = false;
        self
    }
}

impl UnitSpawner for ThreadSpawner {
    fn spawn(&self, events: UnitEventSender) -> Result<Box<dyn UnitHandle>> {
        let (tx, rx) = mpsc::channel::<HostMessage>();
        let interpreter = (self.factory)();
        let exit_events = events.clone();

        let join = thread::Builder::new()
            .name("cellrun-unit".to_string())
            .spawn(move || {
                let runtime = UnitRuntime::new(interpreter, ChannelSink(events));
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.run(rx)));
                let reason = match outcome {
                    Ok(Ok(())) => "unit thread exited".to_string(),
                    Ok(Err(e)) => format!("unit thread failed: {}", e),
                    Err(payload) => format!("interpreter panicked: {}", panic_message(&*payload)),
                };
                let _ = exit_events.send(UnitEvent::Exited { reason });
            })
            .map_err(|e| Error::Ipc(format!("Failed to spawn unit thread: {}", e)))?;

        tracing::debug!("Spawned unit thread {:?}", join.thread().id());
        Ok(Box::new(ThreadUnit {
            commands: Some(tx),
            _join: join,
        }))
    }

    fn supports_shared_memory(&self) -> bool {
        self.shared_memory
    }

    fn describe(&self) -> String {
        "in-process thread".to_string()
    }
}

/// Handle to a unit thread.
struct ThreadUnit {
    commands: Option<mpsc::Sender<HostMessage>>,
    /// Never joined: a wedged interpreter must not block teardown.
    _join: thread::JoinHandle<()>,
}

impl UnitHandle for ThreadUnit {
    fn post(&mut self, message: HostMessage) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::Ipc("Unit has been terminated".to_string()))?;
        commands
            .send(message)
            .map_err(|_| Error::Ipc("Unit thread is gone".to_string()))
    }

    fn terminate(&mut self) {
        // Dropping the sender ends the command loop once the current run returns.
        // A run that never yields keeps its thread; it is abandoned, not joined.
        self.commands = None;
    }
}

impl Drop for ThreadUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Event sink forwarding to the host's unbounded channel.
struct ChannelSink(UnitEventSender);

impl EventSink for ChannelSink {
    fn emit(&self, message: UnitMessage) -> Result<()> {
        self.0
            .send(UnitEvent::Message(message))
            .map_err(|_| Error::Ipc("Host stopped listening".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutionIo, RunError, ScriptInterpreter};
    use tokio::sync::mpsc::unbounded_channel;

    struct Panicky;

    impl Interpreter for Panicky {
        fn run(&mut self, _: &str, _: &mut ExecutionIo<'_>) -> std::result::Result<(), RunError> {
            panic!("segfault in native extension");
        }
    }

    #[tokio::test]
    async fn test_thread_unit_handshake() {
        let (tx, mut rx) = unbounded_channel();
        let spawner = ThreadSpawner::new(ScriptInterpreter::new);
        assert!(spawner.supports_shared_memory());

        let mut unit = spawner.spawn(tx).unwrap();
        unit.post(HostMessage::init()).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            UnitEvent::Message(UnitMessage::Ready {
                id: crate::ipc::CorrelationId::init()
            })
        );

        unit.terminate();
        assert!(unit.post(HostMessage::init()).is_err());
    }

    #[tokio::test]
    async fn test_panic_reported_as_exit() {
        let (tx, mut rx) = unbounded_channel();
        let mut unit = ThreadSpawner::new(|| Panicky).spawn(tx).unwrap();
        unit.post(HostMessage::init()).unwrap();
        unit.post(HostMessage::execute("a".into(), "boom")).unwrap();

        let mut exit_reason = None;
        while let Some(event) = rx.recv().await {
            if let UnitEvent::Exited { reason } = event {
                exit_reason = Some(reason);
                break;
            }
        }
        let reason = exit_reason.unwrap();
        assert!(reason.contains("segfault in native extension"), "{}", reason);
    }

    #[test]
    fn test_without_shared_memory() {
        let spawner = ThreadSpawner::new(ScriptInterpreter::new).without_shared_memory();
        assert!(!spawner.supports_shared_memory());
    }
}
