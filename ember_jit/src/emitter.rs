//! Abstract stub-code emitter.
//!
//! Stub bodies are recorded as programs over a coarse operation vocabulary
//! at the macro-assembler level: frame push/pop, register save/restore,
//! moves, compare-and-branch, thread-field access, allocation steps, and
//! service calls. Encoding these operations for a real instruction set is
//! the backend's concern; here a program is a `Vec<Op>` with label fixups
//! resolved at `finish()`, and the interpreter in `machine` gives the
//! operations their meaning.
//!
//! # Call-out protocol
//!
//! `call_service` emits the full compiled-to-engine transition:
//!
//! ```text
//!   shuffle args into the parameter registers (stack-mediated on conflict)
//!   record last-native-frame
//!   call
//!   clear last-native-frame
//!   if pending exception: route to forward-exception (or assert
//!       unreachable when already inside it)
//!   else: copy + clear the scratch result slots
//! ```

use ember_runtime::PatchKind;

use crate::regs::{conv, Gpr, GprSet};
use crate::stubs::StubId;

// =============================================================================
// Operand Vocabulary
// =============================================================================

/// Per-thread fields addressable from stub code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadField {
    PendingException,
    VmResult,
    VmResult2,
    ExceptionOop,
    ExceptionPc,
    /// Loads as 0/1.
    IsMethodHandleReturn,
}

/// Class-record fields the allocation fast paths read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlassMetaField {
    /// Initialization state byte.
    InitState,
    /// Fixed instance allocation size in bytes.
    InstanceSizeBytes,
    /// Has-finalizer flag (0 or 1).
    HasFinalizer,
    /// Whether fast-path allocation is permitted for the class (0 or 1).
    FastPathAllowed,
}

/// Expected element kind for the array-allocation tag check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    Primitive,
    Object,
}

/// Engine routines reachable through a full call-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRoutine {
    NewInstance,
    NewTypeArray,
    NewObjectArray,
    NewMultiArray,
    RegisterFinalizer,
    MonitorEnter,
    MonitorExit,
    ThrowDiv0,
    ThrowNullPointer,
    ThrowClassCast,
    ThrowIncompatibleClassChange,
    ThrowRangeCheck,
    ExceptionHandlerForPc,
    /// Resolve-and-patch for a deferred constant site. Leaves the
    /// deoptimization flag in the object-result slot.
    PatchCode(PatchKind),
}

/// Engine routines called without a frame transition (no allocation, no
/// safepoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRoutine {
    ExceptionHandlerForReturnAddress,
}

/// Terminal transfers out of stub code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalTarget {
    /// Deoptimization entry that re-executes the interrupted instruction.
    DeoptReexecute,
    /// Deoptimization entry that takes over an exception carried in the
    /// thread's exception fields.
    DeoptExceptionInTls,
}

// =============================================================================
// Operations
// =============================================================================

/// A forward-referenceable position in a stub program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Offset of an operation within a stub program; keys GC descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeOffset(pub usize);

/// One stub operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // --- frames ---
    Enter,
    Leave,
    Ret,
    /// Control must never reach this operation.
    Unreachable,

    // --- register save area ---
    SaveRegisters { save_fpu: bool },
    RestoreRegisters { save_fpu: bool, except: GprSet },

    // --- moves and stack ---
    MovRR { dst: Gpr, src: Gpr },
    MovRI { dst: Gpr, imm: u64 },
    PushReg { src: Gpr },
    PopReg { dst: Gpr },
    MovFromLr { dst: Gpr },
    /// Restore the stack pointer from the frame pointer (method-handle
    /// return sites keep the true sp there).
    ResetSpFromFp,
    /// Load an incoming stack argument (`fp + 2 + index` words).
    LoadStackArg { dst: Gpr, index: u32 },
    /// Load a word `index` words above the current stack pointer.
    LoadStackSlot { dst: Gpr, index: u32 },
    /// Store a word `index` words above the current stack pointer.
    StoreStackSlot { src: Gpr, index: u32 },
    LoadReturnAddress { dst: Gpr },
    StoreReturnAddress { src: Gpr },

    // --- thread fields ---
    LoadThreadField { dst: Gpr, field: ThreadField },
    /// `None` clears the field.
    StoreThreadField { field: ThreadField, src: Option<Gpr> },
    /// Fatal if the field is non-empty (double-fault detection).
    AssertThreadFieldEmpty { field: ThreadField },
    SetLastNativeFrame,
    ClearLastNativeFrame,

    // --- control flow ---
    BranchIfZero { reg: Gpr, target: Label },
    BranchIfNonZero { reg: Gpr, target: Label },
    BranchIfNeImm { reg: Gpr, imm: u64, target: Label },
    BranchIfAboveImm { reg: Gpr, imm: u64, target: Label },
    Jump { target: Label },
    /// Transfer to another stub's entry.
    JumpStub { stub: StubId },
    /// Transfer to the code position held in a register.
    JumpReg { reg: Gpr },
    /// Terminal transfer out of the subsystem.
    JumpExternal { target: ExternalTarget },

    // --- object model ---
    LoadObjKlass { dst: Gpr, obj: Gpr },
    LoadKlassMeta { dst: Gpr, klass: Gpr, field: KlassMetaField },
    /// `dst = aligned array size` for the class in `klass` and length in
    /// `length`.
    ComputeArraySize { dst: Gpr, klass: Gpr, length: Gpr },
    /// Branch to `slow` when the class in `klass` is not an array class of
    /// the expected element kind.
    CheckArrayKind { klass: Gpr, expect: ArrayKind, slow: Label },
    /// `dst = services.is_subtype_of(sub, sup)` as 0/1.
    IsSubtype { dst: Gpr, sub: Gpr, sup: Gpr },

    // --- allocation ---
    /// Bump-allocate from the thread buffer; branch to `slow` on exhaustion.
    TlabAllocate { dst: Gpr, size: Gpr, slow: Label },
    /// Refill the thread buffer; branch to `retry` on success, `fallback`
    /// when the young region cannot supply a chunk.
    TlabRefill { retry: Label, fallback: Label },
    /// Allocate directly from the shared area; branch to `slow` on failure.
    DirectAllocate { dst: Gpr, size: Gpr, slow: Label },
    InitObject { obj: Gpr, klass: Gpr, size: Gpr },
    InitArray { obj: Gpr, klass: Gpr, length: Gpr, size: Gpr },

    // --- calls ---
    CallService { routine: ServiceRoutine },
    CallLeaf { routine: LeafRoutine, arg: Gpr, dst: Gpr },
}

// =============================================================================
// Stub Programs
// =============================================================================

/// A finished stub program with all labels resolved.
pub struct StubCode {
    pub stub: StubId,
    ops: Vec<Op>,
    labels: Vec<usize>,
}

impl StubCode {
    #[inline]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Resolve a label to its operation index.
    #[inline]
    pub fn target(&self, label: Label) -> usize {
        self.labels[label.0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// =============================================================================
// Emitter
// =============================================================================

/// Records operations for one stub.
pub struct StubEmitter {
    stub: StubId,
    ops: Vec<Op>,
    labels: Vec<Option<usize>>,
    has_frame: bool,
}

impl StubEmitter {
    pub fn new(stub: StubId) -> StubEmitter {
        StubEmitter { stub, ops: Vec::new(), labels: Vec::new(), has_frame: false }
    }

    #[inline]
    pub fn stub(&self) -> StubId {
        self.stub
    }

    /// Append an operation; returns its offset.
    pub fn emit(&mut self, op: Op) -> CodeOffset {
        let offset = CodeOffset(self.ops.len());
        self.ops.push(op);
        offset
    }

    /// Create an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position. Binding twice is a defect.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label bound twice in {:?}", self.stub);
        *slot = Some(self.ops.len());
    }

    /// Whether an `enter` is currently open.
    #[inline]
    pub fn has_frame(&self) -> bool {
        self.has_frame
    }

    pub(crate) fn set_has_frame(&mut self, has_frame: bool) {
        self.has_frame = has_frame;
    }

    /// Finish the program, resolving labels. Unbound labels and empty
    /// bodies are generation defects.
    pub fn finish(self) -> StubCode {
        assert!(!self.ops.is_empty(), "empty stub body for {:?}", self.stub);
        let labels = self
            .labels
            .iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| panic!("label {i} unbound in {:?}", self.stub)))
            .collect();
        tracing::trace!(stub = ?self.stub, ops = self.ops.len(), "stub body recorded");
        StubCode { stub: self.stub, ops: self.ops, labels }
    }

    // =========================================================================
    // Call-out protocol
    // =========================================================================

    /// Emit a full call-out to an engine routine.
    ///
    /// `args` are moved into the parameter registers; when the in-place
    /// moves would clobber a still-needed source the arguments go through
    /// the stack instead (any conflict-free shuffle is acceptable, only the
    /// end state is specified). Returns the offset of the call operation,
    /// which is the key for the call site's GC descriptor.
    pub fn call_service(
        &mut self,
        result: Option<Gpr>,
        result2: Option<Gpr>,
        routine: ServiceRoutine,
        args: &[Gpr],
    ) -> CodeOffset {
        assert!(args.len() <= 3, "call-outs take at most three arguments");
        let params = [conv::ARG1, conv::ARG2, conv::ARG3];
        self.shuffle_args(args, &params);

        self.emit(Op::SetLastNativeFrame);
        let call_offset = self.emit(Op::CallService { routine });
        self.emit(Op::ClearLastNativeFrame);

        // Pending-exception check. Inside the dispatch stubs a further
        // exception is a double fault. Other stubs jump to the forward
        // stub with their frame and save area intact; the forward stub
        // restores from that save area and pops the frame itself.
        let no_exception = self.label();
        self.emit(Op::LoadThreadField { dst: conv::SCRATCH1, field: ThreadField::PendingException });
        self.emit(Op::BranchIfZero { reg: conv::SCRATCH1, target: no_exception });
        match self.stub {
            StubId::ForwardException
            | StubId::HandleException
            | StubId::HandleExceptionNoFpu
            | StubId::HandleExceptionFromCallee => {
                self.emit(Op::Unreachable);
            }
            _ => {
                assert!(self.has_frame, "call-outs outside the dispatch stubs require a frame");
                self.emit(Op::JumpStub { stub: StubId::ForwardException });
            }
        }
        self.bind(no_exception);

        // Copy and clear the scratch result slots.
        if let Some(dst) = result {
            self.emit(Op::LoadThreadField { dst, field: ThreadField::VmResult });
            self.emit(Op::StoreThreadField { field: ThreadField::VmResult, src: None });
        }
        if let Some(dst) = result2 {
            self.emit(Op::LoadThreadField { dst, field: ThreadField::VmResult2 });
            self.emit(Op::StoreThreadField { field: ThreadField::VmResult2, src: None });
        }
        call_offset
    }

    /// Move `args[i]` into `params[i]` without clobbering a not-yet-moved
    /// source. In-order register moves handle the common case; any aliasing
    /// falls back to pushing every argument and popping in reverse.
    fn shuffle_args(&mut self, args: &[Gpr], params: &[Gpr; 3]) {
        let in_order_is_safe = args.iter().enumerate().all(|(i, _)| {
            args.iter().skip(i + 1).all(|later| *later != params[i])
        });
        if in_order_is_safe {
            for (i, &src) in args.iter().enumerate() {
                if src != params[i] {
                    self.emit(Op::MovRR { dst: params[i], src });
                }
            }
        } else {
            for &src in args {
                self.emit(Op::PushReg { src });
            }
            for (i, _) in args.iter().enumerate().rev() {
                self.emit(Op::PopReg { dst: params[i] });
            }
        }
    }
}

// =============================================================================
// Stub Frames
// =============================================================================

/// RAII frame helper: `enter` on construction, `leave; ret` on drop.
pub struct StubFrame<'a> {
    emitter: &'a mut StubEmitter,
}

impl<'a> StubFrame<'a> {
    pub fn new(emitter: &'a mut StubEmitter) -> StubFrame<'a> {
        emitter.emit(Op::Enter);
        emitter.set_has_frame(true);
        StubFrame { emitter }
    }

    /// Load an incoming stack argument into a register. Argument `index`
    /// counts from the last value the caller pushed.
    pub fn load_argument(&mut self, index: u32, dst: Gpr) {
        self.emitter.emit(Op::LoadStackArg { dst, index });
    }
}

impl std::ops::Deref for StubFrame<'_> {
    type Target = StubEmitter;

    fn deref(&self) -> &StubEmitter {
        self.emitter
    }
}

impl std::ops::DerefMut for StubFrame<'_> {
    fn deref_mut(&mut self) -> &mut StubEmitter {
        self.emitter
    }
}

impl Drop for StubFrame<'_> {
    fn drop(&mut self) {
        self.emitter.emit(Op::Leave);
        self.emitter.emit(Op::Ret);
        self.emitter.set_has_frame(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve() {
        let mut e = StubEmitter::new(StubId::ThrowDiv0);
        let l = e.label();
        e.emit(Op::BranchIfZero { reg: Gpr::R0, target: l });
        e.emit(Op::MovRI { dst: Gpr::R0, imm: 1 });
        e.bind(l);
        e.emit(Op::Ret);
        let code = e.finish();
        assert_eq!(code.target(l), 2);
    }

    #[test]
    #[should_panic(expected = "unbound")]
    fn test_unbound_label_is_a_defect() {
        let mut e = StubEmitter::new(StubId::ThrowDiv0);
        let l = e.label();
        e.emit(Op::Jump { target: l });
        let _ = e.finish();
    }

    #[test]
    fn test_stub_frame_emits_epilogue_on_drop() {
        let mut e = StubEmitter::new(StubId::MonitorEnter);
        {
            let mut f = StubFrame::new(&mut e);
            f.load_argument(0, Gpr::R1);
        }
        let code = e.finish();
        assert_eq!(code.ops()[0], Op::Enter);
        let n = code.len();
        assert_eq!(code.ops()[n - 2], Op::Leave);
        assert_eq!(code.ops()[n - 1], Op::Ret);
    }

    #[test]
    fn test_conflict_free_args_move_in_place() {
        let mut e = StubEmitter::new(StubId::NewInstance);
        e.set_has_frame(true);
        e.call_service(Some(Gpr::R0), None, ServiceRoutine::NewInstance, &[Gpr::R3]);
        let has_push = e.ops.iter().any(|op| matches!(op, Op::PushReg { .. }));
        assert!(!has_push);
    }

    #[test]
    fn test_aliasing_args_go_through_the_stack() {
        let mut e = StubEmitter::new(StubId::MonitorEnter);
        e.set_has_frame(true);
        // arg1 wants ARG1's old value in ARG2 and vice versa.
        e.call_service(None, None, ServiceRoutine::MonitorEnter, &[conv::ARG2, conv::ARG1]);
        let pushes = e.ops.iter().filter(|op| matches!(op, Op::PushReg { .. })).count();
        let pops = e.ops.iter().filter(|op| matches!(op, Op::PopReg { .. })).count();
        assert_eq!(pushes, 2);
        assert_eq!(pops, 2);
    }

    #[test]
    fn test_framed_call_routes_pending_exception_forward() {
        let mut e = StubEmitter::new(StubId::NewInstance);
        e.set_has_frame(true);
        e.call_service(Some(Gpr::R0), None, ServiceRoutine::NewInstance, &[Gpr::R3]);
        let forwards = e
            .ops
            .iter()
            .any(|op| matches!(op, Op::JumpStub { stub: StubId::ForwardException }));
        assert!(forwards);
    }

    #[test]
    fn test_forward_exception_call_asserts_unreachable() {
        let mut e = StubEmitter::new(StubId::ForwardException);
        e.call_service(Some(Gpr::R1), None, ServiceRoutine::ExceptionHandlerForPc, &[]);
        assert!(e.ops.iter().any(|op| matches!(op, Op::Unreachable)));
        assert!(!e.ops.iter().any(|op| matches!(op, Op::JumpStub { .. })));
    }
}
