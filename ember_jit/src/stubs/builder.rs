//! Stub body generators.
//!
//! One generator per stub family; `generate_code_for` dispatches over the
//! closed id set with a total match, so a stub without a generator cannot
//! compile.
//!
//! Allocation stubs carry an optional fast path ahead of their frame:
//! bump-allocate from the thread buffer, refill once on exhaustion, fall
//! back to one direct shared-area allocation, and only then enter the
//! framed slow path. The fast path is emitted only when the allocation
//! policy enables it; the slow path alone is always complete.

use ember_runtime::{AllocPolicy, InitState};

use crate::emitter::{
    ArrayKind, KlassMetaField, Label, Op, ServiceRoutine, StubEmitter, StubFrame,
};
use crate::patching;
use crate::regs::{conv, Gpr, GprSet};
use crate::stubs::descriptor::{live_slots, CallSiteDescriptor, DescriptorSet};
use crate::stubs::exception;
use crate::stubs::frame::RegisterSaveLayout;
use crate::stubs::{GeneratedStub, StubId};
use ember_runtime::PatchKind;

/// Generate the body and descriptors for one stub.
pub fn generate_code_for(
    id: StubId,
    layout: &RegisterSaveLayout,
    policy: &AllocPolicy,
) -> GeneratedStub {
    let mut e = StubEmitter::new(id);
    let mut descriptors = DescriptorSet::new();
    match id {
        StubId::ForwardException
        | StubId::HandleException
        | StubId::HandleExceptionNoFpu
        | StubId::HandleExceptionFromCallee => {
            exception::generate_handle_exception(&mut e, layout, &mut descriptors);
        }
        StubId::UnwindException => exception::generate_unwind_exception(&mut e),
        StubId::ThrowDiv0 => exception::generate_exception_throw(
            &mut e,
            ServiceRoutine::ThrowDiv0,
            &[],
            layout,
            &mut descriptors,
        ),
        StubId::ThrowNullPointer => exception::generate_exception_throw(
            &mut e,
            ServiceRoutine::ThrowNullPointer,
            &[],
            layout,
            &mut descriptors,
        ),
        StubId::ThrowClassCast => exception::generate_exception_throw(
            &mut e,
            ServiceRoutine::ThrowClassCast,
            &[conv::ARG1],
            layout,
            &mut descriptors,
        ),
        StubId::ThrowIncompatibleClassChange => exception::generate_exception_throw(
            &mut e,
            ServiceRoutine::ThrowIncompatibleClassChange,
            &[],
            layout,
            &mut descriptors,
        ),
        StubId::ThrowRangeCheck => exception::generate_exception_throw(
            &mut e,
            ServiceRoutine::ThrowRangeCheck,
            &[conv::ARG1],
            layout,
            &mut descriptors,
        ),
        StubId::NewInstance => {
            generate_new_instance(&mut e, layout, &mut descriptors, policy, InstanceFast::None)
        }
        StubId::FastNewInstance => {
            generate_new_instance(&mut e, layout, &mut descriptors, policy, InstanceFast::Plain)
        }
        StubId::FastNewInstanceInitCheck => generate_new_instance(
            &mut e,
            layout,
            &mut descriptors,
            policy,
            InstanceFast::InitCheck,
        ),
        StubId::NewTypeArray => generate_new_array(
            &mut e,
            layout,
            &mut descriptors,
            policy,
            ArrayKind::Primitive,
            ServiceRoutine::NewTypeArray,
        ),
        StubId::NewObjectArray => generate_new_array(
            &mut e,
            layout,
            &mut descriptors,
            policy,
            ArrayKind::Object,
            ServiceRoutine::NewObjectArray,
        ),
        StubId::NewMultiArray => generate_new_multi_array(&mut e, layout, &mut descriptors),
        StubId::RegisterFinalizer => generate_register_finalizer(&mut e, layout, &mut descriptors),
        StubId::SlowSubtypeCheck => generate_slow_subtype_check(&mut e),
        StubId::MonitorEnter => {
            generate_monitor(&mut e, layout, &mut descriptors, ServiceRoutine::MonitorEnter, true)
        }
        StubId::MonitorEnterNoFpu => {
            generate_monitor(&mut e, layout, &mut descriptors, ServiceRoutine::MonitorEnter, false)
        }
        StubId::MonitorExit => {
            generate_monitor(&mut e, layout, &mut descriptors, ServiceRoutine::MonitorExit, true)
        }
        StubId::MonitorExitNoFpu => {
            generate_monitor(&mut e, layout, &mut descriptors, ServiceRoutine::MonitorExit, false)
        }
        StubId::AccessFieldPatching => {
            patching::generate_patching(&mut e, PatchKind::AccessField, layout, &mut descriptors)
        }
        StubId::LoadKlassPatching => {
            patching::generate_patching(&mut e, PatchKind::LoadKlass, layout, &mut descriptors)
        }
        StubId::LoadMirrorPatching => {
            patching::generate_patching(&mut e, PatchKind::LoadMirror, layout, &mut descriptors)
        }
    }
    GeneratedStub { code: e.finish(), descriptors }
}

// =============================================================================
// Allocation
// =============================================================================

#[derive(PartialEq, Eq)]
enum InstanceFast {
    /// Slow path only.
    None,
    /// Fast path without an initialization check: only for classes proven
    /// initialized at compile time.
    Plain,
    /// Fast path that re-checks class initialization first.
    InitCheck,
}

/// Emit the fast allocation ladder: thread buffer, one refill, one direct
/// shared-area attempt, then `slow`. `init` formats the object and each
/// successful arm returns without entering a frame.
fn emit_alloc_ladder(
    e: &mut StubEmitter,
    size: Gpr,
    slow: Label,
    init: impl Fn(&mut StubEmitter),
) {
    let refill = e.label();
    let retry = e.label();
    let direct = e.label();

    e.emit(Op::TlabAllocate { dst: conv::RESULT, size, slow: refill });
    init(e);
    e.emit(Op::Ret);

    e.bind(refill);
    e.emit(Op::TlabRefill { retry, fallback: direct });

    e.bind(retry);
    e.emit(Op::TlabAllocate { dst: conv::RESULT, size, slow });
    init(e);
    e.emit(Op::Ret);

    e.bind(direct);
    e.emit(Op::DirectAllocate { dst: conv::RESULT, size, slow });
    init(e);
    e.emit(Op::Ret);
}

fn generate_new_instance(
    e: &mut StubEmitter,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
    policy: &AllocPolicy,
    fast: InstanceFast,
) {
    // Class word arrives in the klass register, the object leaves in the
    // result register.
    if fast != InstanceFast::None && policy.fast_path_enabled() {
        let slow = e.label();
        if fast == InstanceFast::InitCheck {
            e.emit(Op::LoadKlassMeta {
                dst: conv::SCRATCH1,
                klass: conv::KLASS,
                field: KlassMetaField::InitState,
            });
            e.emit(Op::BranchIfNeImm {
                reg: conv::SCRATCH1,
                imm: InitState::FullyInitialized as u64,
                target: slow,
            });
        }
        e.emit(Op::LoadKlassMeta {
            dst: conv::SCRATCH1,
            klass: conv::KLASS,
            field: KlassMetaField::FastPathAllowed,
        });
        e.emit(Op::BranchIfZero { reg: conv::SCRATCH1, target: slow });
        e.emit(Op::LoadKlassMeta {
            dst: conv::SCRATCH2,
            klass: conv::KLASS,
            field: KlassMetaField::InstanceSizeBytes,
        });
        emit_alloc_ladder(e, conv::SCRATCH2, slow, |e| {
            e.emit(Op::InitObject { obj: conv::RESULT, klass: conv::KLASS, size: conv::SCRATCH2 });
        });
        e.bind(slow);
    }

    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu: true });
    let call = f.call_service(Some(conv::RESULT), None, ServiceRoutine::NewInstance, &[conv::KLASS]);
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });
    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::singleton(conv::RESULT) });
}

fn generate_new_array(
    e: &mut StubEmitter,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
    policy: &AllocPolicy,
    kind: ArrayKind,
    routine: ServiceRoutine,
) {
    // Class word in the klass register, element count in the length
    // register.
    if policy.fast_path_enabled() {
        let slow = e.label();
        // The class must really be an array class of the expected element
        // kind; a stale class word takes the slow path, which sorts it out.
        e.emit(Op::CheckArrayKind { klass: conv::KLASS, expect: kind, slow });
        e.emit(Op::BranchIfAboveImm {
            reg: conv::ARRAY_LENGTH,
            imm: policy.max_fast_array_length,
            target: slow,
        });
        e.emit(Op::ComputeArraySize {
            dst: conv::SCRATCH2,
            klass: conv::KLASS,
            length: conv::ARRAY_LENGTH,
        });
        emit_alloc_ladder(e, conv::SCRATCH2, slow, |e| {
            e.emit(Op::InitArray {
                obj: conv::RESULT,
                klass: conv::KLASS,
                length: conv::ARRAY_LENGTH,
                size: conv::SCRATCH2,
            });
        });
        e.bind(slow);
    }

    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu: true });
    let call = f.call_service(
        Some(conv::RESULT),
        None,
        routine,
        &[conv::KLASS, conv::ARRAY_LENGTH],
    );
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });
    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::singleton(conv::RESULT) });
}

fn generate_new_multi_array(
    e: &mut StubEmitter,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
) {
    // Class word, rank, and the stack address of the dimension block.
    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu: true });
    let call = f.call_service(
        Some(conv::RESULT),
        None,
        ServiceRoutine::NewMultiArray,
        &[conv::KLASS, conv::ARRAY_LENGTH, conv::MULTI_DIMS],
    );
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });
    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::singleton(conv::RESULT) });
}

// =============================================================================
// Finalizer / Subtype / Monitors
// =============================================================================

fn generate_register_finalizer(
    e: &mut StubEmitter,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
) {
    // The freshly constructed object arrives in the result register.
    // Most classes have no finalizer: return before touching a frame.
    let enroll = e.label();
    e.emit(Op::LoadObjKlass { dst: conv::SCRATCH1, obj: conv::RESULT });
    e.emit(Op::LoadKlassMeta {
        dst: conv::SCRATCH1,
        klass: conv::SCRATCH1,
        field: KlassMetaField::HasFinalizer,
    });
    e.emit(Op::BranchIfNonZero { reg: conv::SCRATCH1, target: enroll });
    e.emit(Op::Ret);
    e.bind(enroll);

    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu: true });
    let call = f.call_service(None, None, ServiceRoutine::RegisterFinalizer, &[conv::RESULT]);
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });
    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::EMPTY });
}

fn generate_slow_subtype_check(e: &mut StubEmitter) {
    // Stack protocol: the caller pushed the super class word, then the sub
    // class word. The verdict replaces the sub-class slot; no register is
    // disturbed. No call-out, no frame.
    e.emit(Op::PushReg { src: conv::SCRATCH1 });
    e.emit(Op::PushReg { src: conv::SCRATCH2 });
    e.emit(Op::LoadStackSlot { dst: conv::SCRATCH1, index: 2 });
    e.emit(Op::LoadStackSlot { dst: conv::SCRATCH2, index: 3 });
    e.emit(Op::IsSubtype { dst: conv::SCRATCH1, sub: conv::SCRATCH1, sup: conv::SCRATCH2 });
    e.emit(Op::StoreStackSlot { src: conv::SCRATCH1, index: 2 });
    e.emit(Op::PopReg { dst: conv::SCRATCH2 });
    e.emit(Op::PopReg { dst: conv::SCRATCH1 });
    e.emit(Op::Ret);
}

fn generate_monitor(
    e: &mut StubEmitter,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
    routine: ServiceRoutine,
    save_fpu: bool,
) {
    // The compiled caller pushed the object, then its lock record address.
    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu });
    f.load_argument(1, conv::ARG1); // object
    f.load_argument(0, conv::ARG2); // lock record address
    let call = f.call_service(None, None, routine, &[conv::ARG1, conv::ARG2]);
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });
    f.emit(Op::RestoreRegisters { save_fpu, except: GprSet::EMPTY });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(id: StubId, policy: &AllocPolicy) -> GeneratedStub {
        let layout = RegisterSaveLayout::compute();
        generate_code_for(id, &layout, policy)
    }

    #[test]
    fn test_fast_path_disabled_leaves_slow_path_only() {
        let policy = AllocPolicy { use_tlab: false, ..AllocPolicy::default() };
        let stub = generate(StubId::FastNewInstance, &policy);
        assert!(!stub.code.ops().iter().any(|op| matches!(op, Op::TlabAllocate { .. })));
        assert!(stub.code.ops().iter().any(|op| matches!(op, Op::CallService { .. })));
    }

    #[test]
    fn test_init_check_variant_guards_on_init_state() {
        let policy = AllocPolicy::default();
        let with = generate(StubId::FastNewInstanceInitCheck, &policy);
        let without = generate(StubId::FastNewInstance, &policy);
        let guard = |stub: &GeneratedStub| {
            stub.code.ops().iter().any(|op| {
                matches!(op, Op::LoadKlassMeta { field: KlassMetaField::InitState, .. })
            })
        };
        assert!(guard(&with));
        assert!(!guard(&without));
    }

    #[test]
    fn test_array_fast_path_checks_kind_and_length() {
        let policy = AllocPolicy::default();
        let stub = generate(StubId::NewTypeArray, &policy);
        assert!(stub
            .code
            .ops()
            .iter()
            .any(|op| matches!(op, Op::CheckArrayKind { expect: ArrayKind::Primitive, .. })));
        assert!(stub
            .code
            .ops()
            .iter()
            .any(|op| matches!(op, Op::BranchIfAboveImm { .. })));
    }

    #[test]
    fn test_ladder_refills_once_then_goes_direct() {
        let policy = AllocPolicy::default();
        let stub = generate(StubId::FastNewInstance, &policy);
        let refills = stub
            .code
            .ops()
            .iter()
            .filter(|op| matches!(op, Op::TlabRefill { .. }))
            .count();
        let directs = stub
            .code
            .ops()
            .iter()
            .filter(|op| matches!(op, Op::DirectAllocate { .. }))
            .count();
        assert_eq!(refills, 1);
        assert_eq!(directs, 1);
    }

    #[test]
    fn test_monitor_nofpu_skips_fpu_save() {
        let policy = AllocPolicy::default();
        let stub = generate(StubId::MonitorEnterNoFpu, &policy);
        assert!(stub
            .code
            .ops()
            .iter()
            .any(|op| matches!(op, Op::SaveRegisters { save_fpu: false })));
    }

    #[test]
    fn test_subtype_check_touches_no_frame() {
        let policy = AllocPolicy::default();
        let stub = generate(StubId::SlowSubtypeCheck, &policy);
        assert!(!stub.code.ops().iter().any(|op| matches!(op, Op::Enter)));
        assert!(!stub.code.ops().iter().any(|op| matches!(op, Op::CallService { .. })));
    }

    #[test]
    fn test_finalizer_early_exit_precedes_frame() {
        let policy = AllocPolicy::default();
        let stub = generate(StubId::RegisterFinalizer, &policy);
        let first_ret = stub.code.ops().iter().position(|op| matches!(op, Op::Ret)).unwrap();
        let enter = stub.code.ops().iter().position(|op| matches!(op, Op::Enter)).unwrap();
        assert!(first_ret < enter);
    }
}
