/// Syscall Bureau — Deferred Actions
///
/// Actions are pure data produced by a delegated syscall. The engine
/// applies them in order once the whole call has resolved.

use serde::{Deserialize, Serialize};

/// A deferred effect of a delegated syscall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Write `bytes` at `addr` in the calling process.
    WriteMemory { addr: u64, bytes: Vec<u8> },
    /// Set the syscall return value. Always the last action of a call.
    SyscallReturn { retval: i64 },
}

impl Action {
    pub fn is_return(&self) -> bool {
        matches!(self, Action::SyscallReturn { .. })
    }
}

/// Engine-side receiver of actions.
pub trait ActionSink {
    fn set_return_value(&mut self, retval: i64);
    fn write_memory(&mut self, addr: u64, bytes: &[u8]);
}

/// Apply actions in order. Returns the syscall return value, if present.
pub fn apply_actions<S: ActionSink + ?Sized>(sink: &mut S, actions: &[Action]) -> Option<i64> {
    let mut retval = None;
    for action in actions {
        match action {
            Action::WriteMemory { addr, bytes } => sink.write_memory(*addr, bytes),
            Action::SyscallReturn { retval: rv } => {
                sink.set_return_value(*rv);
                retval = Some(*rv);
            }
        }
    }
    retval
}
