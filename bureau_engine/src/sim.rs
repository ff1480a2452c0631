/// Syscall Bureau — Reference Engine State
///
/// A sparse byte-addressed memory where every byte is either concrete
/// or symbolic. Unmapped bytes are symbolic, the same way an engine
/// treats uninitialised memory.
///
/// Used by tests and by the CLI; real engines implement `MemoryOracle`
/// and `ActionSink` on their own state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::actions::ActionSink;
use crate::memory::{ByteMatch, MemoryOracle, OracleError};

// ── Values ─────────────────────────────────────────────────────────

/// One byte of simulated memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymByte {
    Concrete(u8),
    Symbolic,
}

/// A loaded range of bytes, or a 64-bit value such as a match position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimValue {
    pub addr: u64,
    pub bytes: Vec<SymByte>,
}

impl SimValue {
    /// A concrete little-endian 64-bit value.
    pub fn from_u64(addr: u64, value: u64) -> Self {
        Self {
            addr,
            bytes: value.to_le_bytes().iter().map(|b| SymByte::Concrete(*b)).collect(),
        }
    }

    /// A fully unconstrained 64-bit value.
    pub fn unknown_u64(addr: u64) -> Self {
        Self {
            addr,
            bytes: vec![SymByte::Symbolic; 8],
        }
    }

    pub fn is_symbolic(&self) -> bool {
        self.bytes.iter().any(|b| *b == SymByte::Symbolic)
    }

    /// Concrete bytes, or `None` if any byte is symbolic.
    pub fn concrete(&self) -> Option<Vec<u8>> {
        self.bytes
            .iter()
            .map(|b| match b {
                SymByte::Concrete(v) => Some(*v),
                SymByte::Symbolic => None,
            })
            .collect()
    }
}

// ── Memory image ───────────────────────────────────────────────────

/// Serialized initial memory contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryImage {
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Ranges made symbolic after all segments are mapped.
    #[serde(default)]
    pub symbolic: Vec<SymbolicRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Segment {
    pub addr: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolicRange {
    pub addr: u64,
    pub len: u64,
}

// ── State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SimState {
    concrete: BTreeMap<u64, u8>,
    return_value: Option<i64>,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: &MemoryImage) -> Self {
        let mut state = Self::new();
        for seg in &image.segments {
            state.map(seg.addr, &seg.data);
        }
        for range in &image.symbolic {
            state.make_symbolic(range.addr, range.len);
        }
        state
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let image: MemoryImage = serde_json::from_str(json)?;
        Ok(Self::from_image(&image))
    }

    /// Store concrete bytes at `addr`. Bytes past the end of the
    /// address space are dropped.
    pub fn map(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            match addr.checked_add(i as u64) {
                Some(a) => {
                    self.concrete.insert(a, *b);
                }
                None => break,
            }
        }
    }

    pub fn make_symbolic(&mut self, addr: u64, len: u64) {
        let end = addr.saturating_add(len);
        let keys: Vec<u64> = self.concrete.range(addr..end).map(|(k, _)| *k).collect();
        for k in keys {
            self.concrete.remove(&k);
        }
    }

    pub fn byte(&self, addr: u64) -> SymByte {
        match self.concrete.get(&addr) {
            Some(b) => SymByte::Concrete(*b),
            None => SymByte::Symbolic,
        }
    }

    /// Concrete bytes of a range, or `None` if any byte is symbolic.
    pub fn read_concrete(&self, addr: u64, len: u64) -> Option<Vec<u8>> {
        self.load(addr, len).ok()?.concrete()
    }

    pub fn return_value(&self) -> Option<i64> {
        self.return_value
    }
}

impl MemoryOracle for SimState {
    type Region = SimValue;

    fn load(&self, addr: u64, size: u64) -> Result<SimValue, OracleError> {
        let out_of_range = || OracleError::OutOfRange { addr, size };
        if size > 0 {
            addr.checked_add(size - 1).ok_or_else(out_of_range)?;
        }
        let len = usize::try_from(size).map_err(|_| out_of_range())?;
        let mut bytes = Vec::with_capacity(len);
        for i in 0..size {
            bytes.push(self.byte(addr + i));
        }
        Ok(SimValue { addr, bytes })
    }

    fn is_symbolic(&self, region: &SimValue) -> bool {
        region.is_symbolic()
    }

    fn eval_concrete(&self, region: &SimValue) -> Result<Vec<u8>, OracleError> {
        region.concrete().ok_or(OracleError::SymbolicRead {
            addr: region.addr,
            size: region.bytes.len() as u64,
        })
    }

    /// Candidates are every symbolic byte seen before the first concrete
    /// match, plus that match. The position is symbolic unless the only
    /// candidate is a concrete match.
    fn find_byte(
        &self,
        addr: u64,
        needle: u8,
        max_scan: u64,
        max_symbolic: u64,
    ) -> Result<ByteMatch<SimValue>, OracleError> {
        let mut indices = Vec::new();
        let mut symbolic_seen = 0u64;
        let mut found_concrete = false;

        for offset in 0..max_scan {
            let Some(a) = addr.checked_add(offset) else {
                break;
            };
            match self.byte(a) {
                SymByte::Concrete(b) if b == needle => {
                    indices.push(offset);
                    found_concrete = true;
                    break;
                }
                SymByte::Concrete(_) => {}
                SymByte::Symbolic => {
                    if symbolic_seen == max_symbolic {
                        break;
                    }
                    symbolic_seen += 1;
                    indices.push(offset);
                }
            }
        }

        let region = if found_concrete && symbolic_seen == 0 {
            let offset = indices[0];
            SimValue::from_u64(addr, addr.wrapping_add(offset))
        } else {
            SimValue::unknown_u64(addr)
        };
        Ok(ByteMatch { region, indices })
    }
}

impl ActionSink for SimState {
    fn set_return_value(&mut self, retval: i64) {
        self.return_value = Some(retval);
    }

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) {
        self.map(addr, bytes);
    }
}
