//! Execution unit transports.
//!
//! A unit is reachable only through asynchronous message passing. Two
//! transports are provided:
//!
//! - **`ThreadSpawner`** - the interpreter runs on a dedicated OS thread in the
//!   host process. Shared memory is available, so the interrupt byte can
//!   preempt a busy run.
//! - **`ProcessSpawner`** - the interpreter runs in a child process speaking
//!   JSON lines over stdio. No shared memory: interrupts use the message
//!   fallback, and teardown kills the process.
//!
//! # Architecture
//!
//! ```text
//! ExecutionHost
//!     │
//!     └── UnitSpawner::spawn(events) ──> Box<dyn UnitHandle>
//!             │                              │
//!             │                              ├── post(HostMessage)
//!             │                              └── terminate()
//!             │
//!             └── events: UnitEvent::{Message, Exited} ──> host reader task
//! ```

mod process;
mod thread;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::ipc::{HostMessage, UnitMessage};

pub use process::{ProcessSpawner, find_worker_binary};
pub use thread::ThreadSpawner;

/// Something a unit reports to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    /// An envelope from the unit.
    Message(UnitMessage),
    /// The unit went away (process exit, thread panic, closed stream).
    Exited { reason: String },
}

/// Sending half of a unit's event stream.
pub type UnitEventSender = mpsc::UnboundedSender<UnitEvent>;

/// Receiving half of a unit's event stream.
pub type UnitEventReceiver = mpsc::UnboundedReceiver<UnitEvent>;

/// Factory for execution units, reused whenever the host recreates its unit.
pub trait UnitSpawner: Send + Sync {
    /// Start a new unit that reports to `events`.
    ///
    /// Must be called from within a tokio runtime.
    fn spawn(&self, events: UnitEventSender) -> Result<Box<dyn UnitHandle>>;

    /// Whether units from this spawner can read a shared interrupt segment.
    fn supports_shared_memory(&self) -> bool;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Host-side handle to one running unit.
pub trait UnitHandle: Send {
    /// Queue an envelope for the unit.
    fn post(&mut self, message: HostMessage) -> Result<()>;

    /// Destroy the unit. Idempotent.
    fn terminate(&mut self);
}
