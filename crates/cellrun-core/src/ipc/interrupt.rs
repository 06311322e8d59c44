//! One-byte interrupt segment shared between the host and the unit.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Value meaning "no signal".
pub const NO_SIGNAL: u8 = 0;

/// Value meaning "interrupt requested" (the conventional SIGINT number).
pub const SIGINT: u8 = 2;

/// Handle to a shared interrupt byte.
///
/// Clones share the same byte. The host side writes (reset before every
/// execution, set to [`SIGINT`] to cancel) and the runtime reads it at its own
/// interrupt checkpoints. A stale read only delays cancellation by one poll.
#[derive(Clone, Default)]
pub struct InterruptBuffer {
    byte: Arc<AtomicU8>,
}

impl InterruptBuffer {
    /// Allocate a fresh, zeroed segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt.
    pub fn signal(&self) {
        self.byte.store(SIGINT, Ordering::Release);
    }

    /// Clear any pending signal.
    pub fn reset(&self) {
        self.byte.store(NO_SIGNAL, Ordering::Release);
    }

    /// Read the raw byte.
    pub fn load(&self) -> u8 {
        self.byte.load(Ordering::Acquire)
    }

    /// Whether an interrupt is currently requested.
    pub fn is_signaled(&self) -> bool {
        self.load() == SIGINT
    }

    /// Whether two handles refer to the same segment.
    pub fn same_segment(&self, other: &InterruptBuffer) -> bool {
        Arc::ptr_eq(&self.byte, &other.byte)
    }
}

impl fmt::Debug for InterruptBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptBuffer")
            .field("value", &self.load())
            .finish()
    }
}

impl PartialEq for InterruptBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.same_segment(other)
    }
}
