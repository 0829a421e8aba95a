//! Register model for the stub generators.
//!
//! A fixed machine-independent register file: sixteen general-purpose
//! registers and sixteen floating-point registers, with bitfield sets for
//! O(1) membership testing. The frame and stack pointers and the link
//! register are not part of the numbered file; the emitter addresses them
//! through dedicated operations.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// General-purpose register in the stub register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All 16 general-purpose registers in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::R0,
        Gpr::R1,
        Gpr::R2,
        Gpr::R3,
        Gpr::R4,
        Gpr::R5,
        Gpr::R6,
        Gpr::R7,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Get the encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Convert from encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        if enc < 16 { Some(Gpr::ALL[enc as usize]) } else { None }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.encoding())
    }
}

// =============================================================================
// Floating-Point Registers
// =============================================================================

/// Floating-point register in the stub register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Fpr {
    F0 = 0,
    F1 = 1,
    F2 = 2,
    F3 = 3,
    F4 = 4,
    F5 = 5,
    F6 = 6,
    F7 = 7,
    F8 = 8,
    F9 = 9,
    F10 = 10,
    F11 = 11,
    F12 = 12,
    F13 = 13,
    F14 = 14,
    F15 = 15,
}

impl Fpr {
    /// All 16 floating-point registers in encoding order.
    pub const ALL: [Fpr; 16] = [
        Fpr::F0,
        Fpr::F1,
        Fpr::F2,
        Fpr::F3,
        Fpr::F4,
        Fpr::F5,
        Fpr::F6,
        Fpr::F7,
        Fpr::F8,
        Fpr::F9,
        Fpr::F10,
        Fpr::F11,
        Fpr::F12,
        Fpr::F13,
        Fpr::F14,
        Fpr::F15,
    ];

    /// Get the encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Fpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.encoding())
    }
}

// =============================================================================
// Register Sets
// =============================================================================

/// Bitfield set of general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprSet(u16);

impl GprSet {
    /// Empty register set.
    pub const EMPTY: GprSet = GprSet(0);

    /// All 16 registers.
    pub const ALL: GprSet = GprSet(0xFFFF);

    /// Create a set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: Gpr) -> Self {
        GprSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        GprSet(bits)
    }

    /// Get the raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check if the set contains a register.
    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Add a register to the set.
    #[inline(always)]
    pub const fn insert(self, reg: Gpr) -> Self {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register from the set.
    #[inline(always)]
    pub const fn remove(self, reg: Gpr) -> Self {
        GprSet(self.0 & !(1 << reg.encoding()))
    }

    /// Union of two sets.
    #[inline(always)]
    pub const fn union(self, other: GprSet) -> Self {
        GprSet(self.0 | other.0)
    }

    /// Difference (self - other).
    #[inline(always)]
    pub const fn difference(self, other: GprSet) -> Self {
        GprSet(self.0 & !other.0)
    }

    /// Count the number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the registers in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        Gpr::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

/// Bitfield set of floating-point registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FprSet(u16);

impl FprSet {
    /// Empty register set.
    pub const EMPTY: FprSet = FprSet(0);

    /// All 16 registers.
    pub const ALL: FprSet = FprSet(0xFFFF);

    /// Check if the set contains a register.
    #[inline(always)]
    pub const fn contains(self, reg: Fpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Add a register to the set.
    #[inline(always)]
    pub const fn insert(self, reg: Fpr) -> Self {
        FprSet(self.0 | (1 << reg.encoding()))
    }

    /// Count the number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the registers in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Fpr> {
        Fpr::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

// =============================================================================
// Stub Conventions
// =============================================================================

/// Fixed register roles shared by every stub.
pub mod conv {
    use super::{Gpr, GprSet};

    /// Object / primary result register.
    pub const RESULT: Gpr = Gpr::R0;
    /// First explicit call-out argument.
    pub const ARG1: Gpr = Gpr::R1;
    /// Second explicit call-out argument.
    pub const ARG2: Gpr = Gpr::R2;
    /// Third explicit call-out argument.
    pub const ARG3: Gpr = Gpr::R3;

    /// Incoming exception oop for the dispatch stubs.
    pub const EXC_OOP: Gpr = Gpr::R0;
    /// Incoming exception pc for the dispatch stubs.
    pub const EXC_PC: Gpr = Gpr::R3;

    /// Incoming class word for the allocation stubs.
    pub const KLASS: Gpr = Gpr::R3;
    /// Incoming array length for the array allocation stubs; doubles as
    /// the rank for multi-dimensional allocation.
    pub const ARRAY_LENGTH: Gpr = Gpr::R4;
    /// Incoming dimension-block stack address for multi-dimensional
    /// allocation.
    pub const MULTI_DIMS: Gpr = Gpr::R5;

    /// Scratch registers: never carry references across a call-out and are
    /// excluded from GC descriptors.
    pub const SCRATCH1: Gpr = Gpr::R8;
    pub const SCRATCH2: Gpr = Gpr::R9;

    /// The scratch set, for descriptor filtering.
    pub const SCRATCHES: GprSet =
        GprSet::singleton(SCRATCH1).union(GprSet::singleton(SCRATCH2));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let s = GprSet::EMPTY.insert(Gpr::R0).insert(Gpr::R9);
        assert!(s.contains(Gpr::R0));
        assert!(s.contains(Gpr::R9));
        assert!(!s.contains(Gpr::R1));
        assert_eq!(s.count(), 2);
        assert_eq!(s.remove(Gpr::R0).count(), 1);
    }

    #[test]
    fn test_scratches_excluded_from_difference() {
        let live = GprSet::ALL.difference(conv::SCRATCHES);
        assert!(!live.contains(conv::SCRATCH1));
        assert!(!live.contains(conv::SCRATCH2));
        assert_eq!(live.count(), 14);
    }

    #[test]
    fn test_encoding_round_trip() {
        for reg in Gpr::ALL {
            assert_eq!(Gpr::from_encoding(reg.encoding()), Some(reg));
        }
        assert_eq!(Gpr::from_encoding(16), None);
    }
}
