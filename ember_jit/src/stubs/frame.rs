//! Register save-area layout.
//!
//! Stubs that can reach a collection point save the entire register file
//! into a save area laid out once at startup: every floating-point register
//! gets a slot in encoding order starting at offset zero, then every
//! general-purpose register. Save and restore both consume this table; the
//! GC descriptors name slots from it, so using two different layouts for
//! one stub is a programming defect, not a recoverable error.

use crate::regs::{Fpr, Gpr};

/// Word offsets of every register within the save area.
#[derive(Debug, Clone)]
pub struct RegisterSaveLayout {
    fpr_words: [usize; 16],
    gpr_words: [usize; 16],
    frame_size_words: usize,
}

impl RegisterSaveLayout {
    /// Compute the canonical layout: FPRs first in encoding order, then
    /// GPRs. Computed once at startup and passed by reference to every
    /// generator.
    pub fn compute() -> RegisterSaveLayout {
        let mut fpr_words = [0usize; 16];
        let mut gpr_words = [0usize; 16];
        let mut next = 0;
        for f in Fpr::ALL {
            fpr_words[f.encoding() as usize] = next;
            next += 1;
        }
        for g in Gpr::ALL {
            gpr_words[g.encoding() as usize] = next;
            next += 1;
        }
        RegisterSaveLayout { fpr_words, gpr_words, frame_size_words: next }
    }

    /// Save-area word offset of a floating-point register.
    #[inline]
    pub fn fpr_slot(&self, reg: Fpr) -> usize {
        self.fpr_words[reg.encoding() as usize]
    }

    /// Save-area word offset of a general-purpose register.
    #[inline]
    pub fn gpr_slot(&self, reg: Gpr) -> usize {
        self.gpr_words[reg.encoding() as usize]
    }

    /// Total save-area size in words.
    #[inline]
    pub fn frame_size_words(&self) -> usize {
        self.frame_size_words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fprs_precede_gprs() {
        let layout = RegisterSaveLayout::compute();
        assert_eq!(layout.fpr_slot(Fpr::F0), 0);
        assert_eq!(layout.fpr_slot(Fpr::F15), 15);
        assert_eq!(layout.gpr_slot(Gpr::R0), 16);
        assert_eq!(layout.gpr_slot(Gpr::R15), 31);
        assert_eq!(layout.frame_size_words(), 32);
    }

    #[test]
    fn test_slots_are_disjoint() {
        let layout = RegisterSaveLayout::compute();
        let mut seen = [false; 32];
        for f in Fpr::ALL {
            assert!(!seen[layout.fpr_slot(f)]);
            seen[layout.fpr_slot(f)] = true;
        }
        for g in Gpr::ALL {
            assert!(!seen[layout.gpr_slot(g)]);
            seen[layout.gpr_slot(g)] = true;
        }
    }
}
