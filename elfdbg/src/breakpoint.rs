use std::collections::BTreeMap;

use crate::{
    error::{DebuggerError, Result},
    memory::WORD_SIZE,
};

pub const INT3_OPCODE: u8 = 0xCC;

/// A software breakpoint: the address and the machine word that lived there
/// before the trap opcode was patched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    addr: u64,
    original_word: u64,
}

impl Breakpoint {
    pub fn new(addr: u64, original_word: u64) -> Breakpoint {
        Breakpoint {
            addr,
            original_word,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn original_word(&self) -> u64 {
        self.original_word
    }

    pub fn original_byte(&self) -> u8 {
        (self.original_word & 0xFF) as u8
    }

    /// The word with its lowest byte replaced by the trap opcode.
    pub fn patched_word(&self) -> u64 {
        (self.original_word & !0xFF) | INT3_OPCODE as u64
    }
}

/// Active breakpoints keyed by address. Pure bookkeeping, never touches
/// the tracee.
#[derive(Debug)]
pub struct BreakpointTable {
    breakpoints: BTreeMap<u64, Breakpoint>,
    limit: usize,
}

impl BreakpointTable {
    pub fn new(limit: usize) -> BreakpointTable {
        BreakpointTable {
            breakpoints: BTreeMap::new(),
            limit,
        }
    }

    /// Records a breakpoint. An address that is already recorded keeps its
    /// first entry, since only that one saw the unpatched word.
    pub fn insert(&mut self, breakpoint: Breakpoint) -> Result<&Breakpoint> {
        if !self.breakpoints.contains_key(&breakpoint.addr) && self.breakpoints.len() >= self.limit
        {
            return Err(DebuggerError::BreakpointLimit(self.limit));
        }
        Ok(&*self
            .breakpoints
            .entry(breakpoint.addr)
            .or_insert(breakpoint))
    }

    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.breakpoints.contains_key(&addr)
    }

    pub fn remove(&mut self, addr: u64) -> Option<Breakpoint> {
        self.breakpoints.remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Breakpoints in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    fn in_range(&self, start: u64, len: usize) -> impl Iterator<Item = &Breakpoint> {
        let end = start.saturating_add(len as u64);
        self.breakpoints.range(start..end).map(|(_, bp)| bp)
    }

    /// Replaces trap bytes of recorded breakpoints inside `bytes` (read from
    /// `start`) with the bytes they displaced.
    pub fn mask_traps(&self, start: u64, bytes: &mut [u8]) {
        for bp in self.in_range(start, bytes.len()) {
            bytes[(bp.addr - start) as usize] = bp.original_byte();
        }
    }

    /// Same as [`mask_traps`](Self::mask_traps) for one little-endian word.
    pub fn mask_word(&self, start: u64, word: u64) -> u64 {
        let mut bytes = word.to_le_bytes();
        self.mask_traps(start, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// The word that must be resident at `start`: `word` with a trap byte at
    /// every recorded breakpoint it covers.
    pub fn overlay_traps(&self, start: u64, word: u64) -> u64 {
        let mut bytes = word.to_le_bytes();
        for bp in self.in_range(start, WORD_SIZE) {
            bytes[(bp.addr - start) as usize] = INT3_OPCODE;
        }
        u64::from_le_bytes(bytes)
    }
}
