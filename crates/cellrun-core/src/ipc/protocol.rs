//! Envelope protocol between the host and an execution unit.
//!
//! Every envelope is a JSON object discriminated by its `type` field and tagged
//! with an `id`. On stdio transports one envelope is written per line.

use std::fmt;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::interrupt::InterruptBuffer;
use crate::error::{Error, Result};

/// Reserved id for the init handshake.
pub const INIT_ID: &str = "init";

/// Reserved id for the shared interrupt segment hand-off.
pub const INTERRUPT_BUFFER_ID: &str = "interrupt-buffer";

/// Reserved id for the message-based interrupt.
pub const INTERRUPT_FALLBACK_ID: &str = "interrupt-fallback";

/// Upper bound for one encoded envelope (100MB).
const MAX_LINE_BYTES: usize = 100 * 1024 * 1024;

/// Opaque token tagging every envelope of one logical execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn init() -> Self {
        Self::new(INIT_ID)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is one of the reserved control ids.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.0.as_str(),
            INIT_ID | INTERRUPT_BUFFER_ID | INTERRUPT_FALLBACK_ID
        )
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Generator for execution ids.
///
/// Ids combine a per-generator sequence number with random bits, so an id is
/// never handed out twice by one generator.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CorrelationId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let random = uuid::Uuid::new_v4().simple().to_string();
        CorrelationId(format!("exec-{}-{}", seq, &random[..12]))
    }
}

/// Envelope sent from the host to the unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Start the interpreter.
    Init { id: CorrelationId },

    /// Hand over the shared interrupt segment.
    ///
    /// The segment lives in process memory and is never serialized; stdio
    /// transports do not receive this envelope.
    SetInterruptBuffer {
        id: CorrelationId,
        #[serde(skip)]
        buffer: InterruptBuffer,
    },

    /// Run source code.
    Execute { id: CorrelationId, code: String },

    /// Best-effort interrupt for units without shared memory.
    Interrupt { id: CorrelationId },
}

impl HostMessage {
    pub fn init() -> Self {
        Self::Init {
            id: CorrelationId::init(),
        }
    }

    pub fn set_interrupt_buffer(buffer: InterruptBuffer) -> Self {
        Self::SetInterruptBuffer {
            id: CorrelationId::new(INTERRUPT_BUFFER_ID),
            buffer,
        }
    }

    pub fn execute(id: CorrelationId, code: impl Into<String>) -> Self {
        Self::Execute {
            id,
            code: code.into(),
        }
    }

    pub fn interrupt_fallback() -> Self {
        Self::Interrupt {
            id: CorrelationId::new(INTERRUPT_FALLBACK_ID),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        match self {
            Self::Init { id }
            | Self::SetInterruptBuffer { id, .. }
            | Self::Execute { id, .. }
            | Self::Interrupt { id } => id,
        }
    }

    /// Envelope type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::SetInterruptBuffer { .. } => "setInterruptBuffer",
            Self::Execute { .. } => "execute",
            Self::Interrupt { .. } => "interrupt",
        }
    }
}

/// Envelope sent from the unit to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UnitMessage {
    /// Init handshake succeeded.
    Ready { id: CorrelationId },

    /// Standard output fragment.
    #[serde(rename = "out")]
    Stdout { id: CorrelationId, value: String },

    /// Standard error fragment.
    #[serde(rename = "err")]
    Stderr { id: CorrelationId, value: String },

    /// Execution finished normally.
    Complete { id: CorrelationId },

    /// Execution (or init) failed.
    Error { id: CorrelationId, error: String },

    /// Execution observed an interrupt.
    Cancelled { id: CorrelationId },
}

impl UnitMessage {
    pub fn id(&self) -> &CorrelationId {
        match self {
            Self::Ready { id }
            | Self::Stdout { id, .. }
            | Self::Stderr { id, .. }
            | Self::Complete { id }
            | Self::Error { id, .. }
            | Self::Cancelled { id } => id,
        }
    }

    /// Whether this envelope ends an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }

    /// Envelope type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Stdout { .. } => "out",
            Self::Stderr { .. } => "err",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Encode an envelope as a single JSON line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode envelope: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line into an envelope.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_BYTES {
        return Err(Error::Ipc(format!("Envelope too large: {} bytes", line.len())));
    }
    serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Serialization(format!("Failed to decode envelope: {}", e)))
}

/// Write an envelope to a blocking writer and flush it.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let line = encode_line(message)?;
    writer
        .write_all(line.as_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write envelope: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))
}

/// Read the next envelope from a blocking reader.
///
/// Blank lines are skipped. Returns `Ok(None)` at end of stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::Ipc(format!("Failed to read envelope: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return decode_line(&line).map(Some);
        }
    }
}
