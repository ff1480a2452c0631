#![forbid(unsafe_code)]

//! Syscall Bureau — engine side.
//!
//! What an engine implements (or consumes) to delegate syscalls:
//! the memory oracle it exposes, the actions it applies afterwards,
//! and a reference in-memory state with symbolic bytes.

pub mod actions;
pub mod memory;
pub mod sim;

pub use actions::{apply_actions, Action, ActionSink};
pub use memory::{ByteMatch, MemoryOracle, OracleError};
pub use sim::{MemoryImage, SimState, SimValue, SymByte};
