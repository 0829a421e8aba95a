//! Exception dispatch stubs.
//!
//! One generator covers the four dispatch entries, which differ only in
//! how the exception pair reaches the dispatcher and what has been saved:
//!
//! - `ForwardException`: a call-out found a pending exception. Control
//!   arrives from inside another stub's frame with the full save area
//!   intact; the exception oop comes from the pending slot and the issuing
//!   pc from the frame's return-address slot.
//! - `HandleException` / `HandleExceptionNoFpu`: compiled code raises with
//!   the pair already in the dispatch registers; all registers may be live
//!   and must be saved here.
//! - `HandleExceptionFromCallee`: the pair is in the dispatch registers
//!   and everything else is dead; only a bare frame is pushed. After the
//!   frame pop this entry additionally restores the stack pointer from
//!   the frame pointer when the handler sits at a method-handle call
//!   site, like the unwind stub.
//!
//! All four stash the pair in the thread, overwrite the return-address
//! slot twice (first with the issuing pc so stack walks see the raise
//! site, then with the computed handler), reload the pair for the handler,
//! and return — the patched return address transfers straight into the
//! handler.

use smallvec::SmallVec;

use crate::emitter::{
    LeafRoutine, Op, ServiceRoutine, StubEmitter, StubFrame, ThreadField,
};
use crate::regs::{conv, GprSet};
use crate::stubs::descriptor::{live_slots, CallSiteDescriptor, DescriptorSet};
use crate::stubs::frame::RegisterSaveLayout;
use crate::stubs::StubId;

/// Generate one of the four dispatch entries.
pub fn generate_handle_exception(
    e: &mut StubEmitter,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
) {
    let id = e.stub();
    let save_fpu = id != StubId::HandleExceptionNoFpu;
    match id {
        StubId::ForwardException => {
            // Runs in the frame of the stub whose call-out raised; that
            // stub's save area is live below the stack pointer.
            e.set_has_frame(true);
            e.emit(Op::LoadThreadField { dst: conv::EXC_OOP, field: ThreadField::PendingException });
            e.emit(Op::StoreThreadField { field: ThreadField::PendingException, src: None });
            // Arriving here without a pending exception is a defect.
            let have_exception = e.label();
            e.emit(Op::BranchIfNonZero { reg: conv::EXC_OOP, target: have_exception });
            e.emit(Op::Unreachable);
            e.bind(have_exception);
            e.emit(Op::LoadReturnAddress { dst: conv::EXC_PC });
            // The interrupted call-out never delivered its results.
            e.emit(Op::StoreThreadField { field: ThreadField::VmResult, src: None });
            e.emit(Op::StoreThreadField { field: ThreadField::VmResult2, src: None });
        }
        StubId::HandleException | StubId::HandleExceptionNoFpu => {
            e.emit(Op::Enter);
            e.set_has_frame(true);
            e.emit(Op::SaveRegisters { save_fpu });
        }
        StubId::HandleExceptionFromCallee => {
            e.emit(Op::Enter);
            e.set_has_frame(true);
        }
        other => panic!("{other:?} is not an exception dispatch entry"),
    }

    // Stash the pair. A pair already present means an exception arrived
    // while another was being dispatched: fatal.
    e.emit(Op::AssertThreadFieldEmpty { field: ThreadField::ExceptionOop });
    e.emit(Op::AssertThreadFieldEmpty { field: ThreadField::ExceptionPc });
    e.emit(Op::StoreThreadField { field: ThreadField::ExceptionOop, src: Some(conv::EXC_OOP) });
    e.emit(Op::StoreThreadField { field: ThreadField::ExceptionPc, src: Some(conv::EXC_PC) });

    // First overwrite: the issuing pc.
    e.emit(Op::StoreReturnAddress { src: conv::EXC_PC });

    let call = e.call_service(Some(conv::SCRATCH1), None, ServiceRoutine::ExceptionHandlerForPc, &[]);
    let live = match id {
        StubId::HandleExceptionFromCallee => SmallVec::new(),
        _ => live_slots(layout, GprSet::ALL),
    };
    descriptors.insert(CallSiteDescriptor { offset: call, live });

    // Second overwrite: return straight into the handler.
    e.emit(Op::StoreReturnAddress { src: conv::SCRATCH1 });

    // Hand the pair to the handler in registers and clear the fields.
    e.emit(Op::LoadThreadField { dst: conv::EXC_OOP, field: ThreadField::ExceptionOop });
    e.emit(Op::LoadThreadField { dst: conv::EXC_PC, field: ThreadField::ExceptionPc });
    e.emit(Op::StoreThreadField { field: ThreadField::ExceptionOop, src: None });
    e.emit(Op::StoreThreadField { field: ThreadField::ExceptionPc, src: None });

    match id {
        StubId::HandleExceptionFromCallee => {}
        _ => {
            let except = GprSet::singleton(conv::EXC_OOP).insert(conv::EXC_PC);
            e.emit(Op::RestoreRegisters { save_fpu, except });
        }
    }
    e.emit(Op::Leave);
    if id == StubId::HandleExceptionFromCallee {
        // A method-handle call site keeps the true stack pointer in the
        // frame pointer; restore it before returning into the handler.
        // Runs after the frame pop, when the frame pointer is the caller's.
        let no_restore = e.label();
        e.emit(Op::LoadThreadField {
            dst: conv::SCRATCH1,
            field: ThreadField::IsMethodHandleReturn,
        });
        e.emit(Op::BranchIfZero { reg: conv::SCRATCH1, target: no_restore });
        e.emit(Op::ResetSpFromFp);
        e.bind(no_restore);
    }
    e.emit(Op::Ret);
    e.set_has_frame(false);
}

/// Generate the unwind stub: an exception is propagating out of the
/// current compiled frame, which has already been popped. Runs frameless
/// as a leaf; must not allocate or stop for a collection.
pub fn generate_unwind_exception(e: &mut StubEmitter) {
    // Entered with the exception oop in the dispatch register and the
    // caller's resume position in the link register.
    e.emit(Op::AssertThreadFieldEmpty { field: ThreadField::PendingException });
    e.emit(Op::AssertThreadFieldEmpty { field: ThreadField::ExceptionOop });

    e.emit(Op::MovFromLr { dst: conv::ARG1 });
    e.emit(Op::CallLeaf {
        routine: LeafRoutine::ExceptionHandlerForReturnAddress,
        arg: conv::ARG1,
        dst: conv::SCRATCH1,
    });

    // Method-handle call sites keep the true stack pointer in the frame
    // pointer; restore it before entering the handler.
    let no_restore = e.label();
    e.emit(Op::LoadThreadField { dst: conv::SCRATCH2, field: ThreadField::IsMethodHandleReturn });
    e.emit(Op::BranchIfZero { reg: conv::SCRATCH2, target: no_restore });
    e.emit(Op::ResetSpFromFp);
    e.bind(no_restore);

    e.emit(Op::MovFromLr { dst: conv::EXC_PC });
    e.emit(Op::JumpReg { reg: conv::SCRATCH1 });
}

/// Generate a throw stub: save everything, call the raising routine, and
/// let the call-out's pending-exception path carry control to the
/// dispatcher. Falling through the call is impossible.
pub fn generate_exception_throw(
    e: &mut StubEmitter,
    routine: ServiceRoutine,
    args: &[crate::regs::Gpr],
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
) {
    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu: true });
    let call = f.call_service(None, None, routine, args);
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });
    f.emit(Op::Unreachable);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(id: StubId) -> (crate::emitter::StubCode, DescriptorSet) {
        let layout = RegisterSaveLayout::compute();
        let mut descriptors = DescriptorSet::new();
        let mut e = StubEmitter::new(id);
        generate_handle_exception(&mut e, &layout, &mut descriptors);
        (e.finish(), descriptors)
    }

    #[test]
    fn test_dispatch_overwrites_return_address_twice() {
        for id in [
            StubId::ForwardException,
            StubId::HandleException,
            StubId::HandleExceptionNoFpu,
            StubId::HandleExceptionFromCallee,
        ] {
            let (code, _) = generate(id);
            let overwrites = code
                .ops()
                .iter()
                .filter(|op| matches!(op, Op::StoreReturnAddress { .. }))
                .count();
            assert_eq!(overwrites, 2, "{id:?}");
        }
    }

    #[test]
    fn test_dispatch_asserts_fields_empty_before_stash() {
        let (code, _) = generate(StubId::HandleException);
        let first_assert = code
            .ops()
            .iter()
            .position(|op| matches!(op, Op::AssertThreadFieldEmpty { .. }))
            .unwrap();
        let first_store = code
            .ops()
            .iter()
            .position(|op| {
                matches!(op, Op::StoreThreadField { field: ThreadField::ExceptionOop, src: Some(_) })
            })
            .unwrap();
        assert!(first_assert < first_store);
    }

    #[test]
    fn test_from_callee_saves_nothing() {
        let (code, descriptors) = generate(StubId::HandleExceptionFromCallee);
        assert!(!code.ops().iter().any(|op| matches!(op, Op::SaveRegisters { .. })));
        assert!(descriptors.iter().all(|d| d.live.is_empty()));
    }

    #[test]
    fn test_from_callee_checks_method_handle_return_after_frame_pop() {
        let (code, _) = generate(StubId::HandleExceptionFromCallee);
        let leave = code.ops().iter().position(|op| matches!(op, Op::Leave)).unwrap();
        let reset = code.ops().iter().position(|op| matches!(op, Op::ResetSpFromFp)).unwrap();
        // The reset must read the caller's frame pointer, not the stub's.
        assert!(leave < reset);

        // The other entries return with the raiser's stack intact.
        for id in [
            StubId::ForwardException,
            StubId::HandleException,
            StubId::HandleExceptionNoFpu,
        ] {
            let (code, _) = generate(id);
            assert!(!code.ops().iter().any(|op| matches!(op, Op::ResetSpFromFp)), "{id:?}");
        }
    }

    #[test]
    fn test_nofpu_variant_skips_fpu_save() {
        let (code, _) = generate(StubId::HandleExceptionNoFpu);
        assert!(code
            .ops()
            .iter()
            .any(|op| matches!(op, Op::SaveRegisters { save_fpu: false })));
    }

    #[test]
    fn test_unwind_is_frameless_and_leaf() {
        let mut e = StubEmitter::new(StubId::UnwindException);
        generate_unwind_exception(&mut e);
        let code = e.finish();
        assert!(!code.ops().iter().any(|op| matches!(op, Op::Enter)));
        assert!(!code.ops().iter().any(|op| matches!(op, Op::CallService { .. })));
        assert!(code.ops().iter().any(|op| matches!(op, Op::CallLeaf { .. })));
    }
}
