//! Per-thread context record.
//!
//! This is the mailbox between generated stub code and the engine's slow
//! paths. Pending exceptions, call-out results, and the in-flight exception
//! oop/pc pair all travel through fields here rather than through return
//! values, because the stub side reads them with plain loads at fixed
//! points in its control flow.
//!
//! Invariants are asserted exactly where the control flow guarantees them:
//! stashing an exception for dispatch requires both exception fields to be
//! empty (a non-empty field means an exception arrived while another was
//! being dispatched, which is a fatal double fault, not a recoverable
//! condition).

use std::sync::Arc;

use crate::code::{CodePtr, CompiledFrame};
use crate::object::ObjRef;
use crate::tlab::Tlab;

// =============================================================================
// Thread Context
// =============================================================================

/// Mutable per-thread state shared between stub code and the engine.
#[derive(Default)]
pub struct ThreadContext {
    /// The pending-exception slot. Set by slow-path routines when they
    /// throw; checked by every call-out return sequence.
    pending_exception: Option<ObjRef>,
    /// Scratch slot for an object result of a call-out. Cleared when read.
    vm_result: u64,
    /// Scratch slot for a metadata result of a call-out. Cleared when read.
    vm_result2: u64,
    /// Exception oop in flight through the dispatcher.
    exception_oop: Option<ObjRef>,
    /// Code position at which the in-flight exception was raised.
    exception_pc: Option<CodePtr>,
    /// Last compiled-frame marker `(sp, fp)` recorded around call-outs so
    /// stack walks can bridge from engine code back into compiled frames.
    last_native_frame: Option<(u64, u64)>,
    /// Set by handler lookup when the catching frame is a method-handle
    /// intermediary whose stack pointer must be restored from the frame
    /// pointer before jumping to the handler.
    pub is_method_handle_return: bool,
    /// This thread's allocation buffer.
    pub tlab: Tlab,
    /// The compiled frame currently executing on this thread, if any. The
    /// patch controller consults it to detect concurrent deoptimization.
    current_frame: Option<Arc<CompiledFrame>>,
}

impl ThreadContext {
    pub fn new() -> ThreadContext {
        ThreadContext::default()
    }

    // =========================================================================
    // Pending exception
    // =========================================================================

    /// Post an exception for the compiled caller to observe.
    pub fn post_exception(&mut self, exception: ObjRef) {
        tracing::trace!(%exception, "posting pending exception");
        self.pending_exception = Some(exception);
    }

    #[inline]
    pub fn has_pending_exception(&self) -> bool {
        self.pending_exception.is_some()
    }

    #[inline]
    pub fn pending_exception(&self) -> Option<ObjRef> {
        self.pending_exception
    }

    /// Read and clear the pending-exception slot.
    #[inline]
    pub fn take_pending_exception(&mut self) -> Option<ObjRef> {
        self.pending_exception.take()
    }

    // =========================================================================
    // Call-out result slots
    // =========================================================================

    #[inline]
    pub fn set_vm_result(&mut self, value: u64) {
        self.vm_result = value;
    }

    #[inline]
    pub fn vm_result(&self) -> u64 {
        self.vm_result
    }

    /// Read and clear the object-result slot.
    #[inline]
    pub fn take_vm_result(&mut self) -> u64 {
        std::mem::take(&mut self.vm_result)
    }

    #[inline]
    pub fn set_vm_result2(&mut self, value: u64) {
        self.vm_result2 = value;
    }

    #[inline]
    pub fn vm_result2(&self) -> u64 {
        self.vm_result2
    }

    /// Read and clear the metadata-result slot.
    #[inline]
    pub fn take_vm_result2(&mut self) -> u64 {
        std::mem::take(&mut self.vm_result2)
    }

    // =========================================================================
    // Exception dispatch fields
    // =========================================================================

    /// Store the in-flight exception oop/pc pair for the dispatcher.
    ///
    /// Both fields must be empty: dispatch is not re-entrant, and a second
    /// exception arriving mid-dispatch is a fatal double fault.
    pub fn stash_exception(&mut self, oop: ObjRef, pc: CodePtr) {
        assert!(self.exception_oop.is_none(), "exception oop already set during dispatch");
        assert!(self.exception_pc.is_none(), "exception pc already set during dispatch");
        self.exception_oop = Some(oop);
        self.exception_pc = Some(pc);
    }

    /// Set one half of the in-flight pair. The double-fault check is the
    /// caller's responsibility when the pair is written piecewise.
    #[inline]
    pub fn set_exception_oop(&mut self, oop: ObjRef) {
        self.exception_oop = Some(oop);
    }

    #[inline]
    pub fn set_exception_pc(&mut self, pc: CodePtr) {
        self.exception_pc = Some(pc);
    }

    /// Read and clear the in-flight exception oop.
    #[inline]
    pub fn take_exception_oop(&mut self) -> Option<ObjRef> {
        self.exception_oop.take()
    }

    /// Read and clear the in-flight exception pc.
    #[inline]
    pub fn take_exception_pc(&mut self) -> Option<CodePtr> {
        self.exception_pc.take()
    }

    #[inline]
    pub fn exception_oop(&self) -> Option<ObjRef> {
        self.exception_oop
    }

    #[inline]
    pub fn exception_pc(&self) -> Option<CodePtr> {
        self.exception_pc
    }

    // =========================================================================
    // Last-native-frame marker
    // =========================================================================

    /// Record the compiled frame's `(sp, fp)` before transferring to engine
    /// code.
    #[inline]
    pub fn set_last_native_frame(&mut self, sp: u64, fp: u64) {
        self.last_native_frame = Some((sp, fp));
    }

    /// Clear the marker on return to compiled code.
    #[inline]
    pub fn clear_last_native_frame(&mut self) {
        self.last_native_frame = None;
    }

    #[inline]
    pub fn last_native_frame(&self) -> Option<(u64, u64)> {
        self.last_native_frame
    }

    // =========================================================================
    // Current compiled frame
    // =========================================================================

    pub fn set_current_frame(&mut self, frame: Arc<CompiledFrame>) {
        self.current_frame = Some(frame);
    }

    pub fn clear_current_frame(&mut self) {
        self.current_frame = None;
    }

    #[inline]
    pub fn current_frame(&self) -> Option<&Arc<CompiledFrame>> {
        self.current_frame.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_slots_clear_on_read() {
        let mut ctx = ThreadContext::new();
        ctx.set_vm_result(0x1000);
        ctx.set_vm_result2(7);
        assert_eq!(ctx.take_vm_result(), 0x1000);
        assert_eq!(ctx.take_vm_result(), 0);
        assert_eq!(ctx.take_vm_result2(), 7);
        assert_eq!(ctx.take_vm_result2(), 0);
    }

    #[test]
    fn test_pending_exception_take() {
        let mut ctx = ThreadContext::new();
        assert!(!ctx.has_pending_exception());
        let exc = ObjRef::from_raw(0x40).unwrap();
        ctx.post_exception(exc);
        assert!(ctx.has_pending_exception());
        assert_eq!(ctx.take_pending_exception(), Some(exc));
        assert!(!ctx.has_pending_exception());
    }

    #[test]
    #[should_panic(expected = "exception oop already set")]
    fn test_double_stash_is_fatal() {
        let mut ctx = ThreadContext::new();
        let exc = ObjRef::from_raw(0x40).unwrap();
        ctx.stash_exception(exc, CodePtr(0x100));
        ctx.stash_exception(exc, CodePtr(0x104));
    }
}
