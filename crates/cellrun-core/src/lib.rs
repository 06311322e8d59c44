//! Core engine for cellrun.
//!
//! This crate provides:
//! - The envelope protocol spoken with an execution unit
//! - Unit-side runtime hosting an opaque interpreter
//! - In-thread and process-isolated execution units
//! - The host: supervisor, request router, output collector and
//!   cancellation coordinator
//! - Execution state tracking

pub mod config;
pub mod error;
pub mod host;
pub mod ipc;
pub mod runtime;
pub mod state;
pub mod unit;

pub use config::{HostConfig, InterruptMode};
pub use error::{Error, Result};
pub use host::{
    CancellationOutcome, ExecutionHost, ExecutionResult, InterruptStatus, InterruptStrategy,
    OutputCallback, PendingResult,
};
pub use ipc::{CorrelationId, HostMessage, InterruptBuffer, UnitMessage};
pub use runtime::{ExecutionIo, Interpreter, RunError, ScriptInterpreter, UnitRuntime};
pub use state::{ExecutionState, UnitLifecycleState};
pub use unit::{ProcessSpawner, ThreadSpawner, UnitEvent, UnitHandle, UnitSpawner};
