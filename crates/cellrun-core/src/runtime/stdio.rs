//! Stdio driver for process-isolated units.
//!
//! The host writes one envelope per line to the unit's stdin and reads one
//! envelope per line from its stdout. A dedicated reader thread keeps draining
//! stdin while code runs, so a fallback `interrupt` envelope can flip the
//! unit-local interrupt byte even though the runtime itself is busy.

use std::io::{self, Stdout};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use super::{EventSink, Interpreter, UnitRuntime};
use crate::error::{Error, Result};
use crate::ipc::{HostMessage, InterruptBuffer, UnitMessage, read_message, write_message};

/// Sink writing envelopes as JSON lines to stdout.
pub struct StdoutSink {
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StdoutSink {
    fn emit(&self, message: UnitMessage) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        write_message(&mut *out, &message)
    }
}

/// Serve the envelope protocol on stdin/stdout until stdin closes.
pub fn serve_stdio<I: Interpreter>(interpreter: I) -> Result<()> {
    let local = InterruptBuffer::new();
    let (tx, rx) = mpsc::channel();

    let reader_interrupt = local.clone();
    thread::Builder::new()
        .name("cellrun-stdin".to_string())
        .spawn(move || forward_stdin(io::stdin().lock(), &reader_interrupt, &tx))
        .map_err(|e| Error::Ipc(format!("Failed to start stdin reader: {}", e)))?;

    UnitRuntime::new(interpreter, StdoutSink::new())
        .with_local_interrupt(local)
        .run(rx)
}

/// Read envelopes from `reader` and forward them to the runtime.
fn forward_stdin<R: io::BufRead>(
    mut reader: R,
    interrupt: &InterruptBuffer,
    tx: &mpsc::Sender<HostMessage>,
) {
    loop {
        let message = match read_message::<_, HostMessage>(&mut reader) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("Host closed stdin");
                return;
            }
            Err(Error::Serialization(e)) => {
                tracing::warn!("Skipping malformed envelope: {}", e);
                continue;
            }
            Err(e) => {
                tracing::error!("Stdin reader stopped: {}", e);
                return;
            }
        };

        match &message {
            // Clear leftovers from an interrupt that arrived while idle.
            HostMessage::Execute { .. } => interrupt.reset(),
            HostMessage::Interrupt { .. } => {
                tracing::debug!("Fallback interrupt received");
                interrupt.signal();
            }
            HostMessage::SetInterruptBuffer { .. } => {
                tracing::warn!("Shared interrupt segments cannot cross a process boundary, ignoring");
                continue;
            }
            HostMessage::Init { .. } => {}
        }

        if tx.send(message).is_err() {
            return;
        }
    }
}
