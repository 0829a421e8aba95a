//! GC call-site descriptors.
//!
//! Every call-out from a register-saving stub gets a descriptor recording
//! which save-area slots hold values the collector must treat as possible
//! references at that point. Scratch registers never carry references
//! across a call-out and are excluded; floating-point slots are never
//! reference-holding and do not appear at all.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::emitter::CodeOffset;
use crate::regs::{conv, Gpr, GprSet};
use crate::stubs::frame::RegisterSaveLayout;

/// One save-area slot the collector must visit, and the register whose
/// value it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSlot {
    pub slot: usize,
    pub reg: Gpr,
}

/// The collector's view of one call-out.
#[derive(Debug, Clone)]
pub struct CallSiteDescriptor {
    pub offset: CodeOffset,
    pub live: SmallVec<[LiveSlot; 16]>,
}

/// Build the live-slot list for a call site where `saved` registers were
/// written to the save area.
pub fn live_slots(layout: &RegisterSaveLayout, saved: GprSet) -> SmallVec<[LiveSlot; 16]> {
    saved
        .difference(conv::SCRATCHES)
        .iter()
        .map(|reg| LiveSlot { slot: layout.gpr_slot(reg), reg })
        .collect()
}

/// Offset-keyed descriptor table owned by a generated stub for process
/// lifetime.
#[derive(Debug, Default)]
pub struct DescriptorSet {
    map: FxHashMap<CodeOffset, CallSiteDescriptor>,
}

impl DescriptorSet {
    pub fn new() -> DescriptorSet {
        DescriptorSet::default()
    }

    /// Record a call-site descriptor. Two descriptors at one offset is a
    /// generation defect.
    pub fn insert(&mut self, descriptor: CallSiteDescriptor) {
        let prev = self.map.insert(descriptor.offset, descriptor);
        assert!(prev.is_none(), "duplicate call-site descriptor");
    }

    #[inline]
    pub fn get(&self, offset: CodeOffset) -> Option<&CallSiteDescriptor> {
        self.map.get(&offset)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallSiteDescriptor> {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratches_never_appear() {
        let layout = RegisterSaveLayout::compute();
        let live = live_slots(&layout, GprSet::ALL);
        assert!(live.iter().all(|s| s.reg != conv::SCRATCH1 && s.reg != conv::SCRATCH2));
        assert_eq!(live.len(), 14);
    }

    #[test]
    fn test_slots_match_layout() {
        let layout = RegisterSaveLayout::compute();
        let live = live_slots(&layout, GprSet::singleton(Gpr::R5));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].slot, layout.gpr_slot(Gpr::R5));
    }

    #[test]
    fn test_duplicate_offset_is_a_defect() {
        let layout = RegisterSaveLayout::compute();
        let mut set = DescriptorSet::new();
        let d = CallSiteDescriptor {
            offset: CodeOffset(4),
            live: live_slots(&layout, GprSet::singleton(Gpr::R0)),
        };
        set.insert(d.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| set.insert(d)));
        assert!(result.is_err());
    }
}
