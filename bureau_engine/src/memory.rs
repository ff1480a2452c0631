//! Memory oracle — the query surface the bridge uses to look at engine memory.
//!
//! The engine owns its address space. The bridge only borrows an oracle for
//! the duration of one delegated syscall and never writes through it; writes
//! come back as actions (see `actions.rs`).

use thiserror::Error;

/// Failures raised by an engine while answering a memory query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The region cannot be evaluated to concrete bytes.
    #[error("region at {addr:#x} (+{size}) is symbolic")]
    SymbolicRead { addr: u64, size: u64 },

    /// The requested range does not fit in the address space.
    #[error("range at {addr:#x} (+{size}) overflows the address space")]
    OutOfRange { addr: u64, size: u64 },

    /// Engine-specific failure.
    #[error("memory oracle failure: {0}")]
    Engine(String),
}

/// Result of a forward byte scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteMatch<R> {
    /// Position of the match. Symbolic when the position is uncertain.
    pub region: R,
    /// Candidate offsets of the needle, relative to the scan start.
    pub indices: Vec<u64>,
}

impl<R> ByteMatch<R> {
    /// Largest candidate offset, if any candidate was found.
    pub fn max_index(&self) -> Option<u64> {
        self.indices.iter().copied().max()
    }
}

/// Read-only view over an engine state's memory.
pub trait MemoryOracle {
    /// Engine representation of a loaded byte range.
    type Region;

    /// Load `size` bytes starting at `addr`.
    fn load(&self, addr: u64, size: u64) -> Result<Self::Region, OracleError>;

    /// Whether any part of `region` is unresolved.
    fn is_symbolic(&self, region: &Self::Region) -> bool;

    /// Concrete bytes of `region`. Callers check `is_symbolic` first.
    fn eval_concrete(&self, region: &Self::Region) -> Result<Vec<u8>, OracleError>;

    /// Scan forward from `addr` for `needle`, looking at no more than
    /// `max_scan` bytes and tolerating at most `max_symbolic` symbolic bytes.
    fn find_byte(
        &self,
        addr: u64,
        needle: u8,
        max_scan: u64,
        max_symbolic: u64,
    ) -> Result<ByteMatch<Self::Region>, OracleError>;
}
