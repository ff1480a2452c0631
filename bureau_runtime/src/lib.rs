#![forbid(unsafe_code)]

//! Syscall Bureau — runtime.
//!
//! Lets an external agent execute syscalls on behalf of a symbolic
//! engine. The engine thread blocks in `Bureau::invoke_syscall` while the
//! agent runs the call, reading and writing the engine's memory through
//! the bridge. Memory that is still symbolic is refused, never guessed.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod invocation;
pub mod messages;
pub mod proto_types;
pub mod registry;
pub mod session;
pub mod transport;

pub use bridge::Bureau;
pub use config::BridgeConfig;
pub use error::{BridgeError, ProtocolError, Result};
pub use messages::{MemoryReply, Message, MessageKind};
pub use registry::SessionId;
