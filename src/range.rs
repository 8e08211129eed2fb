//! Address ranges: module bounds, the dedicated stack, and opt-in recording
//! sub-ranges.

use crate::result::{Error, Result};

pub type Address = u64;

/// A `base <= end` address range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceRange {
    pub base: Address,
    pub end: Address,
}

impl TraceRange {
    pub fn new(base: Address, end: Address) -> Result<TraceRange> {
        if base > end {
            return Err(Error::InvalidRange { base, end });
        }
        Ok(TraceRange { base, end })
    }

    pub fn size(&self) -> u64 {
        self.end - self.base
    }

    /// Half-open containment, used for recording sub-ranges and the stack.
    pub fn contains(&self, addr: Address) -> bool {
        self.base <= addr && addr < self.end
    }

    /// Inclusive-bounds containment, used for module membership.
    pub fn contains_inclusive(&self, addr: Address) -> bool {
        self.base <= addr && addr <= self.end
    }
}

/// Loaded bounds of the target module. Resolved once at attach time and
/// immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRange {
    pub range: TraceRange,
    pub name: String,
}

impl ModuleRange {
    pub fn contains(&self, addr: Address) -> bool {
        self.range.contains_inclusive(addr)
    }

    pub fn size(&self) -> u64 {
        self.range.size()
    }
}

/// Opt-in "record only within these sub-ranges" filter. With no sub-ranges
/// registered everything is recorded.
#[derive(Debug, Default)]
pub struct RecordRanges {
    ranges: Vec<TraceRange>,
}

impl RecordRanges {
    pub fn add(&mut self, range: TraceRange) {
        self.ranges.push(range);
    }

    pub fn is_recorded(&self, addr: Address) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
