//! The shared runtime stubs.
//!
//! Compiled method code does not call the engine directly: every slow path
//! funnels through one of the stubs generated here, once, at startup. Each
//! stub owns its program and its GC descriptors for process lifetime.
//!
//! # Architecture
//!
//! ```text
//!   compiled code
//!        |
//!        v
//!   +-----------+     +-------------+     +----------------+
//!   | StubSet   | --> | StubCode    | --> | machine (tests |
//!   | (by id)   |     | + GC descrs |     |  / test tier)  |
//!   +-----------+     +-------------+     +----------------+
//!        |
//!        v
//!   RuntimeServices (engine slow paths)
//! ```

pub mod builder;
pub mod descriptor;
pub mod exception;
pub mod frame;

use ember_runtime::AllocPolicy;
use rustc_hash::FxHashMap;

use crate::emitter::StubCode;
use crate::stubs::descriptor::DescriptorSet;
use crate::stubs::frame::RegisterSaveLayout;

// =============================================================================
// Stub Identifiers
// =============================================================================

/// Every stub the subsystem generates. The set is closed: dispatch over it
/// is a total match and an unknown id cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubId {
    ForwardException,
    ThrowDiv0,
    ThrowNullPointer,
    ThrowClassCast,
    ThrowIncompatibleClassChange,
    ThrowRangeCheck,
    NewInstance,
    FastNewInstance,
    FastNewInstanceInitCheck,
    NewTypeArray,
    NewObjectArray,
    NewMultiArray,
    RegisterFinalizer,
    SlowSubtypeCheck,
    MonitorEnter,
    MonitorEnterNoFpu,
    MonitorExit,
    MonitorExitNoFpu,
    UnwindException,
    AccessFieldPatching,
    LoadKlassPatching,
    LoadMirrorPatching,
    HandleException,
    HandleExceptionNoFpu,
    HandleExceptionFromCallee,
}

impl StubId {
    /// All stub ids, for generation and completeness checks.
    pub const ALL: [StubId; 25] = [
        StubId::ForwardException,
        StubId::ThrowDiv0,
        StubId::ThrowNullPointer,
        StubId::ThrowClassCast,
        StubId::ThrowIncompatibleClassChange,
        StubId::ThrowRangeCheck,
        StubId::NewInstance,
        StubId::FastNewInstance,
        StubId::FastNewInstanceInitCheck,
        StubId::NewTypeArray,
        StubId::NewObjectArray,
        StubId::NewMultiArray,
        StubId::RegisterFinalizer,
        StubId::SlowSubtypeCheck,
        StubId::MonitorEnter,
        StubId::MonitorEnterNoFpu,
        StubId::MonitorExit,
        StubId::MonitorExitNoFpu,
        StubId::UnwindException,
        StubId::AccessFieldPatching,
        StubId::LoadKlassPatching,
        StubId::LoadMirrorPatching,
        StubId::HandleException,
        StubId::HandleExceptionNoFpu,
        StubId::HandleExceptionFromCallee,
    ];
}

// =============================================================================
// Stub Set
// =============================================================================

/// One generated stub: its program and the GC descriptors for its
/// call-outs.
pub struct GeneratedStub {
    pub code: StubCode,
    pub descriptors: DescriptorSet,
}

/// The complete generated stub table, built once at startup.
pub struct StubSet {
    stubs: FxHashMap<StubId, GeneratedStub>,
    layout: RegisterSaveLayout,
    policy: AllocPolicy,
}

impl StubSet {
    /// Generate every stub. Panics if any generator produces an empty
    /// body; the table must be complete before compiled code runs.
    pub fn generate(layout: &RegisterSaveLayout, policy: &AllocPolicy) -> StubSet {
        let mut stubs = FxHashMap::default();
        for id in StubId::ALL {
            let generated = builder::generate_code_for(id, layout, policy);
            assert!(!generated.code.is_empty(), "stub {id:?} generated no code");
            stubs.insert(id, generated);
        }
        tracing::debug!(count = stubs.len(), "stub table generated");
        StubSet { stubs, layout: layout.clone(), policy: *policy }
    }

    #[inline]
    pub fn get(&self, id: StubId) -> &GeneratedStub {
        // The table is complete by construction.
        &self.stubs[&id]
    }

    #[inline]
    pub fn code(&self, id: StubId) -> &StubCode {
        &self.get(id).code
    }

    #[inline]
    pub fn descriptors(&self, id: StubId) -> &DescriptorSet {
        &self.get(id).descriptors
    }

    #[inline]
    pub fn layout(&self) -> &RegisterSaveLayout {
        &self.layout
    }

    #[inline]
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_stub_generates() {
        let layout = RegisterSaveLayout::compute();
        let set = StubSet::generate(&layout, &AllocPolicy::default());
        for id in StubId::ALL {
            assert!(!set.code(id).is_empty(), "{id:?} has an empty body");
        }
    }

    #[test]
    fn test_register_saving_stubs_carry_descriptors() {
        let layout = RegisterSaveLayout::compute();
        let set = StubSet::generate(&layout, &AllocPolicy::default());
        // Every stub that saves registers and calls out must describe the
        // call site to the collector.
        for id in [
            StubId::NewInstance,
            StubId::NewTypeArray,
            StubId::NewObjectArray,
            StubId::NewMultiArray,
            StubId::MonitorEnter,
            StubId::AccessFieldPatching,
            StubId::LoadKlassPatching,
            StubId::LoadMirrorPatching,
        ] {
            assert!(!set.descriptors(id).is_empty(), "{id:?} has no call-site descriptors");
        }
    }
}
