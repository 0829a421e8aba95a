//! Deferred constant patching.
//!
//! Compiled code may reference constants that were unresolved at compile
//! time: field offsets, class metadata, and class mirrors. The compiler
//! plants a call to one of the patching stubs at such a site; the first
//! execution resolves the constant, rewrites the site from its copy
//! buffer, and returns to re-execute the now-complete instruction. Every
//! later execution of the site runs the patched code and never reaches
//! this module again.
//!
//! One process-wide lock serializes all patch application. The lock is
//! not held across resolution, which may run loader code; after taking
//! the lock the controller re-checks for concurrent deoptimization and
//! for a racing patch of the same site (both benign no-ops).

use std::fmt;
use std::sync::Arc;

use ember_runtime::{
    CompiledMethod, PatchKind, PatchSiteState, RelocKind, ResolvedConstant, RuntimeServices,
    ThreadContext,
};
use ember_runtime::InitState;
use parking_lot::Mutex;

use crate::emitter::{ExternalTarget, Op, ServiceRoutine, StubEmitter, StubFrame, ThreadField};
use crate::regs::{conv, GprSet};
use crate::stubs::descriptor::{live_slots, CallSiteDescriptor, DescriptorSet};
use crate::stubs::frame::RegisterSaveLayout;

// =============================================================================
// Errors
// =============================================================================

/// Patch-time defects. Expected runtime conditions (pending exception,
/// deoptimization) are not errors; they travel through the thread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// The metadata bytes before the site do not describe a valid region.
    MalformedHeader,
    /// The constant slot does not lie inside the copy buffer.
    ConstantOutOfBounds,
    /// A reference constant was patched but no relocation entry covers
    /// the site.
    MissingRelocation,
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::MalformedHeader => write!(f, "malformed patch-site header"),
            PatchError::ConstantOutOfBounds => {
                write!(f, "constant slot outside the copy buffer")
            }
            PatchError::MissingRelocation => {
                write!(f, "no relocation entry covers the patched site")
            }
        }
    }
}

impl std::error::Error for PatchError {}

// =============================================================================
// Patch Controller
// =============================================================================

/// Owns the process-wide patching lock and the scavengable-code list.
#[derive(Default)]
pub struct PatchController {
    patch_lock: Mutex<()>,
    // Separate lock: scavenge registration must not extend the window the
    // patch lock is held for.
    scavenge_list: Mutex<Vec<Arc<CompiledMethod>>>,
}

impl PatchController {
    pub fn new() -> PatchController {
        PatchController::default()
    }

    /// Methods whose code embeds young-generation references, for the
    /// collector's root scan.
    pub fn scavengable_methods(&self) -> Vec<Arc<CompiledMethod>> {
        self.scavenge_list.lock().clone()
    }

    /// Resolve and apply the patch for the site the current frame entered
    /// the patch stub from.
    ///
    /// Returns `Ok(true)` when the frame must deoptimize instead of
    /// resuming (volatile field, or concurrently deoptimized). A pending
    /// exception from resolution is left in the thread context with
    /// `Ok(false)`; the stub routes it.
    pub fn patch_code(
        &self,
        thread: &mut ThreadContext,
        services: &dyn RuntimeServices,
        kind: PatchKind,
    ) -> Result<bool, PatchError> {
        let frame = thread
            .current_frame()
            .cloned()
            .unwrap_or_else(|| panic!("patch stub entered without a compiled frame"));
        let site_id = frame
            .patch_site
            .unwrap_or_else(|| panic!("patch stub entered from a frame with no patch site"));
        let method = Arc::clone(&frame.method);

        // Resolution may run loader code and is done before the lock.
        let resolved = match services.resolve_patch(thread, kind, site_id) {
            Some(resolved) => resolved,
            None => return Ok(false),
        };

        // Compiled code at the site was generated without a memory-order
        // barrier; a volatile field cannot be patched in. Throw the whole
        // method away and deoptimize the frame.
        if let ResolvedConstant::FieldOffset { is_volatile: true, offset } = resolved {
            tracing::debug!(?site_id, offset, "volatile field at patch site, deoptimizing");
            let site = method
                .site(site_id)
                .unwrap_or_else(|| panic!("unknown patch site {site_id:?}"));
            site.transition(PatchSiteState::Unresolved, PatchSiteState::Superseded);
            method.make_not_entrant();
            frame.mark_deoptimized();
            return Ok(true);
        }

        // A class constant may not be installed until the class finishes
        // initializing; until then the site keeps calling back and the
        // barrier entry recorded in the site header handles re-entry.
        if let ResolvedConstant::Klass(klass) = resolved {
            if services.klass_init_state(klass) != InitState::FullyInitialized {
                return Ok(false);
            }
        }

        let _guard = self.patch_lock.lock();

        // The frame may have been deoptimized while resolution ran;
        // patching a frame that will never resume is pointless and the
        // method image may already be abandoned.
        if frame.is_deoptimized() {
            return Ok(true);
        }
        let site = method
            .site(site_id)
            .unwrap_or_else(|| panic!("unknown patch site {site_id:?}"));
        if method.is_not_entrant() {
            site.transition(PatchSiteState::Unresolved, PatchSiteState::Superseded);
            return Ok(false);
        }

        // Another thread may have patched the site first: benign.
        if site.state() != PatchSiteState::Unresolved {
            return Ok(false);
        }

        let header = method
            .decode_patch_header(site.offset)
            .ok_or(PatchError::MalformedHeader)?;
        if site.const_offset + 8 > header.byte_count {
            return Err(PatchError::ConstantOutOfBounds);
        }

        // A mirror in the young generation makes the method's code a
        // collection root.
        if let ResolvedConstant::Mirror(mirror) = resolved {
            if services.heap().is_scavengable(mirror) && method.try_enroll_scavengable() {
                self.scavenge_list.lock().push(Arc::clone(&method));
            }
        }

        // Reference constants must be visible to the collector through
        // the relocation metadata.
        match resolved {
            ResolvedConstant::Klass(klass) => {
                if !method.fixup_reloc(site.offset, RelocKind::Klass, klass.as_word()) {
                    return Err(PatchError::MissingRelocation);
                }
            }
            ResolvedConstant::Mirror(mirror) => {
                if !method.fixup_reloc(site.offset, RelocKind::Oop, mirror.addr()) {
                    return Err(PatchError::MissingRelocation);
                }
            }
            ResolvedConstant::FieldOffset { .. } => {}
        }

        method.apply_patch(&header, site, resolved.as_word());
        let claimed = site.transition(PatchSiteState::Unresolved, PatchSiteState::Resolved);
        assert!(claimed, "patch state changed while the patch lock was held");
        tracing::debug!(?site_id, ?kind, "patched constant site");
        Ok(false)
    }
}

// =============================================================================
// Patch Stub Bodies
// =============================================================================

/// Generate one of the three patching stubs. The body open-codes its
/// call-out: unlike every other stub, a pending exception here must reach
/// the deoptimization entry that unpacks with the exception in thread
/// state, not the forward-exception stub, because the interrupted
/// instruction cannot be re-executed as compiled code.
pub fn generate_patching(
    e: &mut StubEmitter,
    kind: PatchKind,
    layout: &RegisterSaveLayout,
    descriptors: &mut DescriptorSet,
) {
    let mut f = StubFrame::new(e);
    f.emit(Op::SaveRegisters { save_fpu: true });

    f.emit(Op::SetLastNativeFrame);
    let call = f.emit(Op::CallService { routine: ServiceRoutine::PatchCode(kind) });
    f.emit(Op::ClearLastNativeFrame);
    descriptors.insert(CallSiteDescriptor { offset: call, live: live_slots(layout, GprSet::ALL) });

    // Exception during resolution: carry it to the deopt blob in the
    // thread's exception fields and let unpacking deliver it.
    let no_exception = f.label();
    f.emit(Op::LoadThreadField { dst: conv::SCRATCH1, field: ThreadField::PendingException });
    f.emit(Op::BranchIfZero { reg: conv::SCRATCH1, target: no_exception });
    f.emit(Op::LoadThreadField { dst: conv::EXC_OOP, field: ThreadField::PendingException });
    f.emit(Op::StoreThreadField { field: ThreadField::PendingException, src: None });
    f.emit(Op::LoadReturnAddress { dst: conv::EXC_PC });
    f.emit(Op::AssertThreadFieldEmpty { field: ThreadField::ExceptionOop });
    f.emit(Op::AssertThreadFieldEmpty { field: ThreadField::ExceptionPc });
    f.emit(Op::StoreThreadField { field: ThreadField::ExceptionOop, src: Some(conv::EXC_OOP) });
    f.emit(Op::StoreThreadField { field: ThreadField::ExceptionPc, src: Some(conv::EXC_PC) });
    f.emit(Op::StoreThreadField { field: ThreadField::VmResult, src: None });
    f.emit(Op::StoreThreadField { field: ThreadField::VmResult2, src: None });
    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::EMPTY });
    f.emit(Op::Leave);
    f.emit(Op::JumpExternal { target: ExternalTarget::DeoptExceptionInTls });
    f.bind(no_exception);

    // Deoptimization flag from the controller.
    let resume = f.label();
    f.emit(Op::LoadThreadField { dst: conv::SCRATCH1, field: ThreadField::VmResult });
    f.emit(Op::StoreThreadField { field: ThreadField::VmResult, src: None });
    f.emit(Op::BranchIfZero { reg: conv::SCRATCH1, target: resume });
    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::EMPTY });
    f.emit(Op::Leave);
    f.emit(Op::JumpExternal { target: ExternalTarget::DeoptReexecute });
    f.bind(resume);

    f.emit(Op::RestoreRegisters { save_fpu: true, except: GprSet::EMPTY });
    // Frame epilogue returns to the patched site, which re-executes the
    // now-complete instruction.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::StubId;

    #[test]
    fn test_patch_stub_has_both_deopt_exits() {
        let layout = RegisterSaveLayout::compute();
        let mut descriptors = DescriptorSet::new();
        let mut e = StubEmitter::new(StubId::LoadKlassPatching);
        generate_patching(&mut e, PatchKind::LoadKlass, &layout, &mut descriptors);
        let code = e.finish();
        let exits: Vec<_> = code
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::JumpExternal { target } => Some(*target),
                _ => None,
            })
            .collect();
        assert!(exits.contains(&ExternalTarget::DeoptExceptionInTls));
        assert!(exits.contains(&ExternalTarget::DeoptReexecute));
        assert_eq!(descriptors.len(), 1);
    }

    #[test]
    fn test_patch_stub_never_routes_to_forward_exception() {
        let layout = RegisterSaveLayout::compute();
        let mut descriptors = DescriptorSet::new();
        let mut e = StubEmitter::new(StubId::AccessFieldPatching);
        generate_patching(&mut e, PatchKind::AccessField, &layout, &mut descriptors);
        let code = e.finish();
        assert!(!code.ops().iter().any(|op| matches!(op, Op::JumpStub { .. })));
    }
}
