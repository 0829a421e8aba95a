//! The slow-path service surface.
//!
//! Every routine a generated stub can call out to is a method on
//! `RuntimeServices`. Results and exceptions are never returned as Rust
//! values: object results land in the thread's scratch result slots and
//! exceptions in its pending-exception slot, because the stub side picks
//! them up with plain loads after the call returns. The only methods with
//! Rust return values are the leaf queries that compiled code consumes
//! directly in a register (handler lookup, subtype query, patch
//! resolution).

use crate::code::{CodePtr, PatchSiteId};
use crate::heap::Heap;
use crate::klass::InitState;
use crate::layout::LayoutDescriptor;
use crate::object::{KlassId, ObjRef};
use crate::thread::ThreadContext;
use crate::tlab::AllocPolicy;

// =============================================================================
// Patch Resolution Types
// =============================================================================

/// Which kind of deferred constant a patch site waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// A field offset (instance or static field access).
    AccessField,
    /// A class-metadata reference.
    LoadKlass,
    /// A class mirror object reference.
    LoadMirror,
}

/// A constant produced by resolving a patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedConstant {
    /// Resolved field offset, with the volatility the compiled code did not
    /// assume.
    FieldOffset { offset: u64, is_volatile: bool },
    Klass(KlassId),
    Mirror(ObjRef),
}

impl ResolvedConstant {
    /// The constant as the machine word that goes into the patched slot.
    #[inline]
    pub fn as_word(&self) -> u64 {
        match *self {
            ResolvedConstant::FieldOffset { offset, .. } => offset,
            ResolvedConstant::Klass(k) => k.as_word(),
            ResolvedConstant::Mirror(m) => m.addr(),
        }
    }
}

// =============================================================================
// Runtime Services
// =============================================================================

/// The engine-side routines generated stubs call into.
pub trait RuntimeServices {
    // -------------------------------------------------------------------------
    // Allocation. Results go to the thread's object-result slot; failures
    // and class errors post an exception instead.
    // -------------------------------------------------------------------------

    fn new_instance(&self, thread: &mut ThreadContext, klass: KlassId);
    fn new_type_array(&self, thread: &mut ThreadContext, klass: KlassId, length: u64);
    fn new_object_array(&self, thread: &mut ThreadContext, klass: KlassId, length: u64);
    fn new_multi_array(&self, thread: &mut ThreadContext, klass: KlassId, dims: &[u64]);

    /// Enroll an object with a finalizing class on the finalization queue.
    fn register_finalizer(&self, thread: &mut ThreadContext, obj: ObjRef);

    // -------------------------------------------------------------------------
    // Monitors. `lock_slot` is the stack address of the frame's lock record.
    // -------------------------------------------------------------------------

    fn monitor_enter(&self, thread: &mut ThreadContext, obj: ObjRef, lock_slot: u64);
    fn monitor_exit(&self, thread: &mut ThreadContext, obj: ObjRef, lock_slot: u64);

    // -------------------------------------------------------------------------
    // Exception construction. Each posts a pending exception.
    // -------------------------------------------------------------------------

    fn throw_div0(&self, thread: &mut ThreadContext);
    fn throw_null_pointer(&self, thread: &mut ThreadContext);
    fn throw_class_cast(&self, thread: &mut ThreadContext, obj: ObjRef);
    fn throw_incompatible_class_change(&self, thread: &mut ThreadContext);
    fn throw_range_check(&self, thread: &mut ThreadContext, index: u64);

    // -------------------------------------------------------------------------
    // Exception dispatch queries
    // -------------------------------------------------------------------------

    /// Find the handler for the exception stashed in the thread's exception
    /// oop/pc fields. Sets the method-handle-return flag when the catching
    /// frame requires the stack-pointer restoration. Returns the handler
    /// entry, or the deopt redirect when the holding method was
    /// invalidated.
    fn exception_handler_for_pc(&self, thread: &mut ThreadContext) -> CodePtr;

    /// Leaf variant used during unwinding: finds the handler for an
    /// exception propagating out of a frame returning to `ret_pc`. Must not
    /// allocate or safepoint.
    fn exception_handler_for_return_address(
        &self,
        thread: &mut ThreadContext,
        ret_pc: CodePtr,
    ) -> CodePtr;

    // -------------------------------------------------------------------------
    // Type system
    // -------------------------------------------------------------------------

    fn is_subtype_of(&self, sub: KlassId, sup: KlassId) -> bool;

    // -------------------------------------------------------------------------
    // Patch resolution
    // -------------------------------------------------------------------------

    /// Resolve the deferred constant for a patch site. Resolution may run
    /// loader code; on failure an exception is posted and `None` returned.
    fn resolve_patch(
        &self,
        thread: &mut ThreadContext,
        kind: PatchKind,
        site: PatchSiteId,
    ) -> Option<ResolvedConstant>;

    // -------------------------------------------------------------------------
    // Metadata queries consumed by stub generation and fast paths
    // -------------------------------------------------------------------------

    fn klass_layout(&self, klass: KlassId) -> LayoutDescriptor;
    fn klass_init_state(&self, klass: KlassId) -> InitState;
    fn klass_has_finalizer(&self, klass: KlassId) -> bool;

    fn heap(&self) -> &Heap;
    fn alloc_policy(&self) -> AllocPolicy;
}
