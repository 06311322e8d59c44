//! Communication with execution units.
//!
//! This module provides the envelope protocol and the shared interrupt
//! segment used to signal a unit that is busy running code.

mod interrupt;
pub mod protocol;

pub use interrupt::{InterruptBuffer, NO_SIGNAL, SIGINT};
pub use protocol::{
    CorrelationId, HostMessage, INIT_ID, INTERRUPT_BUFFER_ID, INTERRUPT_FALLBACK_ID, IdGenerator,
    UnitMessage, decode_line, encode_line, read_message, write_message,
};
