//! Abstract machine for stub programs.
//!
//! Executes `StubCode` against a thread context and a `RuntimeServices`
//! implementation, with a register file and a descending stack. This is
//! the executable meaning of the emitter's operation vocabulary: the
//! scenario tests and the engine's testing tier drive stubs through it.
//!
//! Control leaves the machine in one of four ways (`StubExit`): a plain
//! return to the caller, a transfer to an exception handler, or one of
//! the two deoptimization entries. Stub-to-stub transfers (a call-out
//! routing to the forward-exception stub) stay inside the machine.

use ember_runtime::{ArrayTag, CodePtr, KlassId, ObjRef, RuntimeServices, ThreadContext};

use crate::emitter::{
    ArrayKind, ExternalTarget, KlassMetaField, LeafRoutine, Op, ServiceRoutine, StubCode,
    ThreadField,
};
use crate::patching::{PatchController, PatchError};
use crate::regs::{conv, Fpr, Gpr};
use crate::stubs::{StubId, StubSet};

/// Return-address sentinel for entry from the (simulated) compiled caller.
pub const CALLER_RETURN: CodePtr = CodePtr(0xFFFF_FFFF_0000_0000);

/// Stack depth in words.
const STACK_WORDS: usize = 4096;

/// Op budget per run; exceeding it means a stub program is looping.
const STEP_BUDGET: usize = 1_000_000;

/// How control left the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubExit {
    /// Returned to the caller's resume position.
    Return,
    /// Transferred to an exception handler.
    Handler(CodePtr),
    /// Entered the deoptimization blob for re-execution.
    DeoptReexecute,
    /// Entered the deoptimization blob with an exception in thread state.
    DeoptExceptionInTls,
}

// =============================================================================
// Machine
// =============================================================================

/// Machine state plus the collaborators stub programs run against.
pub struct Machine<'a> {
    gpr: [u64; 16],
    fpr: [u64; 16],
    stack: Vec<u64>,
    sp: usize,
    fp: usize,
    lr: u64,
    stubs: &'a StubSet,
    services: &'a dyn RuntimeServices,
    thread: &'a mut ThreadContext,
    patcher: Option<&'a PatchController>,
}

impl<'a> Machine<'a> {
    pub fn new(
        stubs: &'a StubSet,
        services: &'a dyn RuntimeServices,
        thread: &'a mut ThreadContext,
    ) -> Machine<'a> {
        Machine {
            gpr: [0; 16],
            fpr: [0; 16],
            stack: vec![0; STACK_WORDS],
            sp: STACK_WORDS,
            fp: STACK_WORDS,
            lr: CALLER_RETURN.0,
            stubs,
            services,
            thread,
            patcher: None,
        }
    }

    /// Attach the patch controller; required before running a patching
    /// stub.
    pub fn with_patcher(mut self, patcher: &'a PatchController) -> Machine<'a> {
        self.patcher = Some(patcher);
        self
    }

    // =========================================================================
    // State access (test harness surface)
    // =========================================================================

    #[inline]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.encoding() as usize]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.encoding() as usize] = value;
    }

    #[inline]
    pub fn fpr(&self, reg: Fpr) -> u64 {
        self.fpr[reg.encoding() as usize]
    }

    #[inline]
    pub fn set_fpr(&mut self, reg: Fpr, value: u64) {
        self.fpr[reg.encoding() as usize] = value;
    }

    /// Push a word, as the compiled caller would before entering a stub
    /// with stack arguments.
    pub fn push(&mut self, value: u64) {
        self.sp -= 1;
        self.stack[self.sp] = value;
    }

    /// Pop a word off the stack.
    pub fn pop(&mut self) -> u64 {
        let value = self.stack[self.sp];
        self.sp += 1;
        value
    }

    /// Current stack pointer, as a word index usable as an address.
    #[inline]
    pub fn sp(&self) -> u64 {
        self.sp as u64
    }

    /// Read a stack word `index` words above the stack pointer.
    #[inline]
    pub fn stack_word(&self, index: usize) -> u64 {
        self.stack[self.sp + index]
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run a stub from the generated set to completion.
    pub fn run(&mut self, id: StubId) -> Result<StubExit, PatchError> {
        let stubs = self.stubs;
        self.run_code(stubs.code(id))
    }

    /// Run an arbitrary stub program to completion.
    pub fn run_code(&mut self, code: &StubCode) -> Result<StubExit, PatchError> {
        let stubs = self.stubs;
        let mut code = code;
        let mut pc = 0usize;
        for _ in 0..STEP_BUDGET {
            assert!(pc < code.len(), "fell off the end of {:?}", code.stub);
            let op = code.ops()[pc];
            pc += 1;
            match op {
                // --- frames ---
                Op::Enter => {
                    let lr = self.lr;
                    let fp = self.fp as u64;
                    self.push(lr);
                    self.push(fp);
                    self.fp = self.sp;
                }
                Op::Leave => {
                    self.sp = self.fp;
                    self.fp = self.pop() as usize;
                    self.lr = self.pop();
                }
                Op::Ret => {
                    return Ok(if self.lr == CALLER_RETURN.0 {
                        StubExit::Return
                    } else {
                        StubExit::Handler(CodePtr(self.lr))
                    });
                }
                Op::Unreachable => panic!("reached unreachable op in {:?}", code.stub),

                // --- register save area ---
                Op::SaveRegisters { save_fpu } => {
                    let layout = stubs.layout();
                    self.sp -= layout.frame_size_words();
                    for g in Gpr::ALL {
                        self.stack[self.sp + layout.gpr_slot(g)] = self.gpr(g);
                    }
                    if save_fpu {
                        for f in Fpr::ALL {
                            self.stack[self.sp + layout.fpr_slot(f)] = self.fpr(f);
                        }
                    }
                }
                Op::RestoreRegisters { save_fpu, except } => {
                    let layout = stubs.layout();
                    for g in Gpr::ALL {
                        if !except.contains(g) {
                            self.set_gpr(g, self.stack[self.sp + layout.gpr_slot(g)]);
                        }
                    }
                    if save_fpu {
                        for f in Fpr::ALL {
                            self.set_fpr(f, self.stack[self.sp + layout.fpr_slot(f)]);
                        }
                    }
                    self.sp += layout.frame_size_words();
                }

                // --- moves and stack ---
                Op::MovRR { dst, src } => self.set_gpr(dst, self.gpr(src)),
                Op::MovRI { dst, imm } => self.set_gpr(dst, imm),
                Op::PushReg { src } => {
                    let value = self.gpr(src);
                    self.push(value);
                }
                Op::PopReg { dst } => {
                    let value = self.pop();
                    self.set_gpr(dst, value);
                }
                Op::MovFromLr { dst } => self.set_gpr(dst, self.lr),
                Op::ResetSpFromFp => self.sp = self.fp,
                Op::LoadStackArg { dst, index } => {
                    self.set_gpr(dst, self.stack[self.fp + 2 + index as usize]);
                }
                Op::LoadStackSlot { dst, index } => {
                    self.set_gpr(dst, self.stack[self.sp + index as usize]);
                }
                Op::StoreStackSlot { src, index } => {
                    self.stack[self.sp + index as usize] = self.gpr(src);
                }
                Op::LoadReturnAddress { dst } => {
                    self.set_gpr(dst, self.stack[self.fp + 1]);
                }
                Op::StoreReturnAddress { src } => {
                    self.stack[self.fp + 1] = self.gpr(src);
                }

                // --- thread fields ---
                Op::LoadThreadField { dst, field } => {
                    let value = match field {
                        ThreadField::PendingException => {
                            self.thread.pending_exception().map_or(0, ObjRef::addr)
                        }
                        ThreadField::VmResult => self.thread.vm_result(),
                        ThreadField::VmResult2 => self.thread.vm_result2(),
                        ThreadField::ExceptionOop => {
                            self.thread.exception_oop().map_or(0, ObjRef::addr)
                        }
                        ThreadField::ExceptionPc => {
                            self.thread.exception_pc().map_or(0, |pc| pc.0)
                        }
                        ThreadField::IsMethodHandleReturn => {
                            self.thread.is_method_handle_return as u64
                        }
                    };
                    self.set_gpr(dst, value);
                }
                Op::StoreThreadField { field, src } => match src {
                    Some(src) => {
                        let value = self.gpr(src);
                        match field {
                            ThreadField::PendingException => {
                                self.thread.post_exception(obj(value));
                            }
                            ThreadField::VmResult => self.thread.set_vm_result(value),
                            ThreadField::VmResult2 => self.thread.set_vm_result2(value),
                            ThreadField::ExceptionOop => self.thread.set_exception_oop(obj(value)),
                            ThreadField::ExceptionPc => {
                                self.thread.set_exception_pc(CodePtr(value));
                            }
                            ThreadField::IsMethodHandleReturn => {
                                self.thread.is_method_handle_return = value != 0;
                            }
                        }
                    }
                    None => match field {
                        ThreadField::PendingException => {
                            self.thread.take_pending_exception();
                        }
                        ThreadField::VmResult => self.thread.set_vm_result(0),
                        ThreadField::VmResult2 => self.thread.set_vm_result2(0),
                        ThreadField::ExceptionOop => {
                            self.thread.take_exception_oop();
                        }
                        ThreadField::ExceptionPc => {
                            self.thread.take_exception_pc();
                        }
                        ThreadField::IsMethodHandleReturn => {
                            self.thread.is_method_handle_return = false;
                        }
                    },
                },
                Op::AssertThreadFieldEmpty { field } => {
                    let empty = match field {
                        ThreadField::PendingException => !self.thread.has_pending_exception(),
                        ThreadField::VmResult => self.thread.vm_result() == 0,
                        ThreadField::VmResult2 => self.thread.vm_result2() == 0,
                        ThreadField::ExceptionOop => self.thread.exception_oop().is_none(),
                        ThreadField::ExceptionPc => self.thread.exception_pc().is_none(),
                        ThreadField::IsMethodHandleReturn => !self.thread.is_method_handle_return,
                    };
                    assert!(empty, "{field:?} not empty in {:?}", code.stub);
                }
                Op::SetLastNativeFrame => {
                    self.thread.set_last_native_frame(self.sp as u64, self.fp as u64);
                }
                Op::ClearLastNativeFrame => self.thread.clear_last_native_frame(),

                // --- control flow ---
                Op::BranchIfZero { reg, target } => {
                    if self.gpr(reg) == 0 {
                        pc = code.target(target);
                    }
                }
                Op::BranchIfNonZero { reg, target } => {
                    if self.gpr(reg) != 0 {
                        pc = code.target(target);
                    }
                }
                Op::BranchIfNeImm { reg, imm, target } => {
                    if self.gpr(reg) != imm {
                        pc = code.target(target);
                    }
                }
                Op::BranchIfAboveImm { reg, imm, target } => {
                    if self.gpr(reg) > imm {
                        pc = code.target(target);
                    }
                }
                Op::Jump { target } => pc = code.target(target),
                Op::JumpStub { stub } => {
                    tracing::trace!(from = ?code.stub, to = ?stub, "stub-to-stub transfer");
                    code = stubs.code(stub);
                    pc = 0;
                }
                Op::JumpReg { reg } => return Ok(StubExit::Handler(CodePtr(self.gpr(reg)))),
                Op::JumpExternal { target } => {
                    return Ok(match target {
                        ExternalTarget::DeoptReexecute => StubExit::DeoptReexecute,
                        ExternalTarget::DeoptExceptionInTls => StubExit::DeoptExceptionInTls,
                    });
                }

                // --- object model ---
                Op::LoadObjKlass { dst, obj: src } => {
                    let klass = self.services.heap().klass_of(obj(self.gpr(src)));
                    self.set_gpr(dst, klass.as_word());
                }
                Op::LoadKlassMeta { dst, klass, field } => {
                    let id = KlassId::from_word(self.gpr(klass));
                    let value = match field {
                        KlassMetaField::InitState => self.services.klass_init_state(id) as u64,
                        KlassMetaField::InstanceSizeBytes => {
                            self.services.klass_layout(id).instance_size_bytes()
                        }
                        KlassMetaField::HasFinalizer => self.services.klass_has_finalizer(id) as u64,
                        KlassMetaField::FastPathAllowed => {
                            self.services.klass_layout(id).fast_path_allowed() as u64
                        }
                    };
                    self.set_gpr(dst, value);
                }
                Op::ComputeArraySize { dst, klass, length } => {
                    let layout = self.services.klass_layout(KlassId::from_word(self.gpr(klass)));
                    self.set_gpr(dst, layout.array_size_bytes(self.gpr(length)));
                }
                Op::CheckArrayKind { klass, expect, slow } => {
                    let tag = self
                        .services
                        .klass_layout(KlassId::from_word(self.gpr(klass)))
                        .array_tag();
                    let ok = matches!(
                        (tag, expect),
                        (Some(ArrayTag::Type), ArrayKind::Primitive)
                            | (Some(ArrayTag::Object), ArrayKind::Object)
                    );
                    if !ok {
                        pc = code.target(slow);
                    }
                }
                Op::IsSubtype { dst, sub, sup } => {
                    let verdict = self.services.is_subtype_of(
                        KlassId::from_word(self.gpr(sub)),
                        KlassId::from_word(self.gpr(sup)),
                    );
                    self.set_gpr(dst, verdict as u64);
                }

                // --- allocation ---
                Op::TlabAllocate { dst, size, slow } => {
                    let size = self.gpr(size);
                    match self.thread.tlab.allocate(size) {
                        Some(o) => self.set_gpr(dst, o.addr()),
                        None => pc = code.target(slow),
                    }
                }
                Op::TlabRefill { retry, fallback } => {
                    let policy = self.services.alloc_policy();
                    let heap = self.services.heap();
                    pc = if self.thread.tlab.refill(heap, policy.tlab_chunk_bytes) {
                        code.target(retry)
                    } else {
                        code.target(fallback)
                    };
                }
                Op::DirectAllocate { dst, size, slow } => {
                    match self.services.heap().alloc_raw(self.gpr(size)) {
                        Some(o) => self.set_gpr(dst, o.addr()),
                        None => pc = code.target(slow),
                    }
                }
                Op::InitObject { obj: dst, klass, size } => {
                    self.services.heap().format_instance(
                        obj(self.gpr(dst)),
                        KlassId::from_word(self.gpr(klass)),
                        self.gpr(size),
                    );
                }
                Op::InitArray { obj: dst, klass, length, size } => {
                    self.services.heap().format_array(
                        obj(self.gpr(dst)),
                        KlassId::from_word(self.gpr(klass)),
                        self.gpr(length),
                        self.gpr(size),
                    );
                }

                // --- calls ---
                Op::CallService { routine } => self.call_service(routine)?,
                Op::CallLeaf { routine, arg, dst } => match routine {
                    LeafRoutine::ExceptionHandlerForReturnAddress => {
                        let handler = self
                            .services
                            .exception_handler_for_return_address(self.thread, CodePtr(self.gpr(arg)));
                        self.set_gpr(dst, handler.0);
                    }
                },
            }
        }
        panic!("step budget exhausted in {:?}", code.stub);
    }

    fn call_service(&mut self, routine: ServiceRoutine) -> Result<(), PatchError> {
        let arg1 = self.gpr(conv::ARG1);
        let arg2 = self.gpr(conv::ARG2);
        let arg3 = self.gpr(conv::ARG3);
        let services = self.services;
        match routine {
            ServiceRoutine::NewInstance => {
                services.new_instance(self.thread, KlassId::from_word(arg1));
            }
            ServiceRoutine::NewTypeArray => {
                services.new_type_array(self.thread, KlassId::from_word(arg1), arg2);
            }
            ServiceRoutine::NewObjectArray => {
                services.new_object_array(self.thread, KlassId::from_word(arg1), arg2);
            }
            ServiceRoutine::NewMultiArray => {
                let rank = arg2 as usize;
                let base = arg3 as usize;
                let dims: Vec<u64> = self.stack[base..base + rank].to_vec();
                services.new_multi_array(self.thread, KlassId::from_word(arg1), &dims);
            }
            ServiceRoutine::RegisterFinalizer => {
                services.register_finalizer(self.thread, obj(arg1));
            }
            ServiceRoutine::MonitorEnter => {
                services.monitor_enter(self.thread, obj(arg1), arg2);
            }
            ServiceRoutine::MonitorExit => {
                services.monitor_exit(self.thread, obj(arg1), arg2);
            }
            ServiceRoutine::ThrowDiv0 => services.throw_div0(self.thread),
            ServiceRoutine::ThrowNullPointer => services.throw_null_pointer(self.thread),
            ServiceRoutine::ThrowClassCast => services.throw_class_cast(self.thread, obj(arg1)),
            ServiceRoutine::ThrowIncompatibleClassChange => {
                services.throw_incompatible_class_change(self.thread);
            }
            ServiceRoutine::ThrowRangeCheck => services.throw_range_check(self.thread, arg1),
            ServiceRoutine::ExceptionHandlerForPc => {
                let handler = services.exception_handler_for_pc(self.thread);
                self.thread.set_vm_result(handler.0);
            }
            ServiceRoutine::PatchCode(kind) => {
                let patcher = self
                    .patcher
                    .unwrap_or_else(|| panic!("patch stub run without a patch controller"));
                let deopted = patcher.patch_code(self.thread, services, kind)?;
                self.thread.set_vm_result(deopted as u64);
            }
        }
        Ok(())
    }
}

/// Interpret a register word as a non-null object reference.
#[inline]
fn obj(value: u64) -> ObjRef {
    ObjRef::from_raw(value).unwrap_or_else(|| panic!("null object reference in stub code"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::StubEmitter;
    use crate::regs::GprSet;
    use crate::stubs::frame::RegisterSaveLayout;
    use ember_runtime::engine::ExceptionKlasses;
    use ember_runtime::{
        AllocPolicy, EngineServices, Heap, KlassDesc, KlassTable, LayoutDescriptor,
    };
    use std::sync::Arc;

    fn engine() -> EngineServices {
        let mut table = KlassTable::new();
        let mut next = 100u32;
        let mut reg = |table: &mut KlassTable, name: &'static str| {
            next += 1;
            table.register(KlassDesc::new(KlassId(next), name, LayoutDescriptor::instance(8)))
        };
        let exceptions = ExceptionKlasses {
            arithmetic: reg(&mut table, "ArithmeticError"),
            null_pointer: reg(&mut table, "NullPointerError"),
            class_cast: reg(&mut table, "ClassCastError"),
            incompatible_class_change: reg(&mut table, "IncompatibleClassChangeError"),
            index_out_of_bounds: reg(&mut table, "IndexOutOfBoundsError"),
            out_of_memory: reg(&mut table, "OutOfMemoryError"),
            illegal_monitor: reg(&mut table, "IllegalMonitorStateError"),
        };
        EngineServices::new(
            table,
            Arc::new(Heap::new(64 * 1024, 8 * 1024)),
            AllocPolicy::default(),
            exceptions,
        )
    }

    #[test]
    fn test_frame_round_trip() {
        let layout = RegisterSaveLayout::compute();
        let stubs = StubSet::generate(&layout, &AllocPolicy::default());
        let engine = engine();
        let mut thread = ThreadContext::new();

        let mut e = StubEmitter::new(StubId::SlowSubtypeCheck);
        e.emit(Op::Enter);
        e.emit(Op::MovRI { dst: Gpr::R7, imm: 99 });
        e.emit(Op::Leave);
        e.emit(Op::Ret);
        let code = e.finish();

        let mut m = Machine::new(&stubs, &engine, &mut thread);
        let exit = m.run_code(&code).unwrap();
        assert_eq!(exit, StubExit::Return);
        assert_eq!(m.gpr(Gpr::R7), 99);
    }

    #[test]
    fn test_save_restore_round_trip_preserves_every_register() {
        let layout = RegisterSaveLayout::compute();
        let stubs = StubSet::generate(&layout, &AllocPolicy::default());
        let engine = engine();
        let mut thread = ThreadContext::new();

        let mut e = StubEmitter::new(StubId::SlowSubtypeCheck);
        e.emit(Op::SaveRegisters { save_fpu: true });
        // Clobber everything between save and restore.
        for g in Gpr::ALL {
            e.emit(Op::MovRI { dst: g, imm: 0xDEAD });
        }
        e.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::EMPTY });
        e.emit(Op::Ret);
        let code = e.finish();

        let mut m = Machine::new(&stubs, &engine, &mut thread);
        for g in Gpr::ALL {
            m.set_gpr(g, 0x1000 + g.encoding() as u64);
        }
        for f in Fpr::ALL {
            m.set_fpr(f, 0x2000 + f.encoding() as u64);
        }
        m.run_code(&code).unwrap();
        for g in Gpr::ALL {
            assert_eq!(m.gpr(g), 0x1000 + g.encoding() as u64, "{g}");
        }
        for f in Fpr::ALL {
            assert_eq!(m.fpr(f), 0x2000 + f.encoding() as u64, "{f}");
        }
    }

    #[test]
    fn test_ret_with_patched_return_address_exits_to_handler() {
        let layout = RegisterSaveLayout::compute();
        let stubs = StubSet::generate(&layout, &AllocPolicy::default());
        let engine = engine();
        let mut thread = ThreadContext::new();

        let mut e = StubEmitter::new(StubId::SlowSubtypeCheck);
        e.emit(Op::Enter);
        e.emit(Op::MovRI { dst: Gpr::R1, imm: 0x5000 });
        e.emit(Op::StoreReturnAddress { src: Gpr::R1 });
        e.emit(Op::Leave);
        e.emit(Op::Ret);
        let code = e.finish();

        let mut m = Machine::new(&stubs, &engine, &mut thread);
        let exit = m.run_code(&code).unwrap();
        assert_eq!(exit, StubExit::Handler(CodePtr(0x5000)));
    }
}
