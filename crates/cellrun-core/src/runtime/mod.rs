//! Unit-side runtime.
//!
//! Everything in this module runs *inside* the execution unit: the message
//! loop that answers the host's envelopes and the interface to the embedded
//! interpreter, which is treated as an opaque black box.
//!
//! ```text
//! HostMessage ──> UnitRuntime ──run()──> Interpreter
//!                     │                      │
//!                     │              ExecutionIo::stdout/stderr
//!                     │              ExecutionIo::check_interrupt ──> InterruptBuffer
//!                     └──────────── UnitMessage (via EventSink)
//! ```

mod script;
mod stdio;

use std::sync::mpsc::Receiver;

use crate::error::Result;
use crate::ipc::{CorrelationId, HostMessage, InterruptBuffer, UnitMessage};

pub use script::ScriptInterpreter;
pub use stdio::{StdoutSink, serve_stdio};

/// Why an interpreter run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// The run observed an interrupt request.
    #[error("KeyboardInterrupt")]
    Interrupted,

    /// User code raised an error; the message is reported verbatim.
    #[error("{0}")]
    Raised(String),
}

/// An embedded language engine.
pub trait Interpreter: Send {
    /// One-time startup, answered with `ready` or `error`.
    fn initialize(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Run `code` to completion.
    ///
    /// Long-running code must call [`ExecutionIo::check_interrupt`] at its own
    /// checkpoints; that poll is the only way a busy run can be cancelled
    /// without tearing the unit down.
    fn run(&mut self, code: &str, io: &mut ExecutionIo<'_>) -> std::result::Result<(), RunError>;
}

impl Interpreter for Box<dyn Interpreter> {
    fn initialize(&mut self) -> std::result::Result<(), String> {
        (**self).initialize()
    }

    fn run(&mut self, code: &str, io: &mut ExecutionIo<'_>) -> std::result::Result<(), RunError> {
        (**self).run(code, io)
    }
}

/// Destination for envelopes leaving the unit.
pub trait EventSink: Send {
    fn emit(&self, message: UnitMessage) -> Result<()>;

    /// Whether the host side has gone away.
    fn is_closed(&self) -> bool {
        false
    }
}

/// I/O surface handed to the interpreter for one execution.
pub struct ExecutionIo<'a> {
    id: &'a CorrelationId,
    sink: &'a dyn EventSink,
    interrupt: &'a InterruptBuffer,
    detached: bool,
}

impl<'a> ExecutionIo<'a> {
    fn new(id: &'a CorrelationId, sink: &'a dyn EventSink, interrupt: &'a InterruptBuffer) -> Self {
        Self {
            id,
            sink,
            interrupt,
            detached: false,
        }
    }

    /// Correlation id of the running execution.
    pub fn id(&self) -> &CorrelationId {
        self.id
    }

    /// Emit a standard output fragment.
    pub fn stdout(&mut self, text: impl Into<String>) {
        let message = UnitMessage::Stdout {
            id: self.id.clone(),
            value: text.into(),
        };
        self.send(message);
    }

    /// Emit a standard error fragment.
    pub fn stderr(&mut self, text: impl Into<String>) {
        let message = UnitMessage::Stderr {
            id: self.id.clone(),
            value: text.into(),
        };
        self.send(message);
    }

    fn send(&mut self, message: UnitMessage) {
        if self.detached {
            return;
        }
        if let Err(e) = self.sink.emit(message) {
            tracing::debug!("Host no longer listening for {}: {}", self.id, e);
            self.detached = true;
        }
    }

    /// Whether an interrupt is pending (or the host has detached from this unit).
    pub fn is_interrupt_requested(&self) -> bool {
        self.interrupt.is_signaled() || self.detached || self.sink.is_closed()
    }

    /// Interrupt checkpoint.
    pub fn check_interrupt(&self) -> std::result::Result<(), RunError> {
        if self.is_interrupt_requested() {
            Err(RunError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Message loop inside the execution unit.
pub struct UnitRuntime<I, S> {
    interpreter: I,
    sink: S,
    /// Segment installed by the host with `setInterruptBuffer`.
    shared: Option<InterruptBuffer>,
    /// Unit-local byte polled when no segment was installed.
    local: InterruptBuffer,
    /// Whether the runtime clears `local` itself before each execution.
    owns_local: bool,
    initialized: bool,
}

impl<I: Interpreter, S: EventSink> UnitRuntime<I, S> {
    pub fn new(interpreter: I, sink: S) -> Self {
        Self {
            interpreter,
            sink,
            shared: None,
            local: InterruptBuffer::new(),
            owns_local: true,
            initialized: false,
        }
    }

    /// Use `buffer` as the unit-local interrupt byte.
    ///
    /// Transports that can observe a fallback `interrupt` envelope while an
    /// execution is running signal this byte from their reader. The transport
    /// then also clears it, in stream order, whenever it forwards an `execute`.
    pub fn with_local_interrupt(mut self, buffer: InterruptBuffer) -> Self {
        self.local = buffer;
        self.owns_local = false;
        self
    }

    /// Process commands until the host closes the channel.
    pub fn run(mut self, commands: Receiver<HostMessage>) -> Result<()> {
        while let Ok(message) = commands.recv() {
            self.handle(message)?;
        }
        tracing::debug!("Command channel closed, unit runtime exiting");
        Ok(())
    }

    /// Process a single host envelope.
    pub fn handle(&mut self, message: HostMessage) -> Result<()> {
        match message {
            HostMessage::Init { id } => {
                let reply = match self.interpreter.initialize() {
                    Ok(()) => {
                        self.initialized = true;
                        UnitMessage::Ready { id }
                    }
                    Err(error) => UnitMessage::Error { id, error },
                };
                self.sink.emit(reply)
            }
            HostMessage::SetInterruptBuffer { buffer, .. } => {
                tracing::debug!("Shared interrupt segment installed");
                self.shared = Some(buffer);
                Ok(())
            }
            HostMessage::Execute { id, code } => self.execute(id, &code),
            HostMessage::Interrupt { .. } => {
                // Messages are only seen between executions, so there is nothing to stop.
                tracing::debug!("Fallback interrupt received while idle");
                Ok(())
            }
        }
    }

    fn execute(&mut self, id: CorrelationId, code: &str) -> Result<()> {
        if !self.initialized {
            return self.sink.emit(UnitMessage::Error {
                id,
                error: "Interpreter is not initialized".to_string(),
            });
        }

        let interrupt = match &self.shared {
            Some(buffer) => buffer.clone(),
            None => {
                if self.owns_local {
                    self.local.reset();
                }
                self.local.clone()
            }
        };

        let outcome = {
            let mut io = ExecutionIo::new(&id, &self.sink, &interrupt);
            self.interpreter.run(code, &mut io)
        };

        let terminal = match outcome {
            Ok(()) => UnitMessage::Complete { id },
            Err(RunError::Interrupted) => UnitMessage::Cancelled { id },
            Err(RunError::Raised(error)) => UnitMessage::Error { id, error },
        };
        self.sink.emit(terminal)
    }
}
