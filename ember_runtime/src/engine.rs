//! Reference implementation of the slow-path service surface.
//!
//! Backs the stub tests and the engine's testing tier with real behavior:
//! a class table, a heap, a lock table, a finalization queue, a handler
//! table, and the patch-target tables the resolver draws deferred
//! constants from. Production engines supply their own `RuntimeServices`;
//! this one keeps every collaborator in plain in-memory tables.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::code::{CodePtr, CompiledMethod, PatchSiteId};
use crate::heap::Heap;
use crate::klass::{InitState, KlassTable};
use crate::layout::LayoutDescriptor;
use crate::object::{KlassId, ObjRef};
use crate::services::{PatchKind, ResolvedConstant, RuntimeServices};
use crate::thread::ThreadContext;
use crate::tlab::AllocPolicy;

/// Largest representable array length; anything above it is rejected with a
/// range error before sizing arithmetic runs.
const MAX_ARRAY_LENGTH: u64 = i32::MAX as u64;

// =============================================================================
// Configuration Records
// =============================================================================

/// The exception classes the engine throws from its slow paths.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionKlasses {
    pub arithmetic: KlassId,
    pub null_pointer: KlassId,
    pub class_cast: KlassId,
    pub incompatible_class_change: KlassId,
    pub index_out_of_bounds: KlassId,
    pub out_of_memory: KlassId,
    pub illegal_monitor: KlassId,
}

/// What a patch site resolves to.
#[derive(Debug, Clone, Copy)]
pub enum PatchTarget {
    Field { offset: u64, is_volatile: bool },
    Klass(KlassId),
    /// Mirror of the named class; the mirror object is created on first
    /// resolution.
    Mirror(KlassId),
}

/// One registered exception-handler range entry.
struct HandlerEntry {
    handler: CodePtr,
    method: Option<Arc<CompiledMethod>>,
    method_handle_return: bool,
}

struct LockRecord {
    lock_slot: u64,
    depth: u32,
}

// =============================================================================
// Engine Services
// =============================================================================

/// In-memory engine backing the service surface.
pub struct EngineServices {
    klasses: KlassTable,
    heap: Arc<Heap>,
    policy: AllocPolicy,
    exceptions: ExceptionKlasses,
    locks: Mutex<FxHashMap<u64, LockRecord>>,
    finalizable: Mutex<Vec<ObjRef>>,
    handlers: Mutex<FxHashMap<CodePtr, HandlerEntry>>,
    patch_targets: Mutex<FxHashMap<PatchSiteId, PatchTarget>>,
}

impl EngineServices {
    pub fn new(
        klasses: KlassTable,
        heap: Arc<Heap>,
        policy: AllocPolicy,
        exceptions: ExceptionKlasses,
    ) -> EngineServices {
        EngineServices {
            klasses,
            heap,
            policy,
            exceptions,
            locks: Mutex::new(FxHashMap::default()),
            finalizable: Mutex::new(Vec::new()),
            handlers: Mutex::new(FxHashMap::default()),
            patch_targets: Mutex::new(FxHashMap::default()),
        }
    }

    /// Register a handler entry for exceptions raised at `pc`.
    pub fn add_handler(&self, pc: CodePtr, handler: CodePtr) {
        self.handlers.lock().insert(
            pc,
            HandlerEntry { handler, method: None, method_handle_return: false },
        );
    }

    /// Register a handler whose validity is tied to a compiled method: if
    /// the method is invalidated, lookups answer with the deopt redirect.
    pub fn add_method_handler(&self, pc: CodePtr, handler: CodePtr, method: Arc<CompiledMethod>) {
        self.handlers.lock().insert(
            pc,
            HandlerEntry { handler, method: Some(method), method_handle_return: false },
        );
    }

    /// Register a handler in a method-handle intermediary frame.
    pub fn add_method_handle_handler(&self, pc: CodePtr, handler: CodePtr) {
        self.handlers.lock().insert(
            pc,
            HandlerEntry { handler, method: None, method_handle_return: true },
        );
    }

    /// Declare what a patch site resolves to.
    pub fn add_patch_target(&self, site: PatchSiteId, target: PatchTarget) {
        self.patch_targets.lock().insert(site, target);
    }

    pub fn klasses(&self) -> &KlassTable {
        &self.klasses
    }

    /// Snapshot of the finalization queue, for tests.
    pub fn finalizable_objects(&self) -> Vec<ObjRef> {
        self.finalizable.lock().clone()
    }

    /// Whether `obj` is currently locked, for tests.
    pub fn is_locked(&self, obj: ObjRef) -> bool {
        self.locks.lock().contains_key(&obj.addr())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Build an instance outside the normal allocation paths (exception
    /// objects and class mirrors). Must not itself fail with a further
    /// allocation error, so it falls back to the permanent region when the
    /// young region is spent.
    fn allocate_special(&self, klass: KlassId) -> ObjRef {
        let size = self.klasses.get(klass).layout.instance_size_bytes();
        let obj = self
            .heap
            .alloc_raw(size)
            .or_else(|| self.heap.alloc_permanent(size))
            .unwrap_or_else(|| panic!("cannot allocate {klass} outside the ordinary paths"));
        self.heap.format_instance(obj, klass, size);
        obj
    }

    fn post(&self, thread: &mut ThreadContext, klass: KlassId) {
        let exc = self.allocate_special(klass);
        thread.post_exception(exc);
    }

    fn allocate_array(
        &self,
        thread: &mut ThreadContext,
        klass: KlassId,
        length: u64,
    ) -> Option<ObjRef> {
        if length > MAX_ARRAY_LENGTH {
            self.post(thread, self.exceptions.index_out_of_bounds);
            return None;
        }
        let layout = self.klasses.get(klass).layout;
        let size = layout.array_size_bytes(length);
        match self.heap.alloc_raw(size) {
            Some(obj) => {
                self.heap.format_array(obj, klass, length, size);
                Some(obj)
            }
            None => {
                self.post(thread, self.exceptions.out_of_memory);
                None
            }
        }
    }

    fn alloc_multi(&self, thread: &mut ThreadContext, klass: KlassId, dims: &[u64]) -> Option<ObjRef> {
        let (&length, rest) = dims.split_first()?;
        let outer = self.allocate_array(thread, klass, length)?;
        if !rest.is_empty() {
            for i in 0..length {
                let inner = self.alloc_multi(thread, klass, rest)?;
                // Object element slots are word-sized; body starts after
                // the two-word array header.
                self.heap.write_word(outer.addr() + 16 + i * 8, inner.addr());
            }
        }
        Some(outer)
    }
}

impl RuntimeServices for EngineServices {
    fn new_instance(&self, thread: &mut ThreadContext, klass: KlassId) {
        let desc = self.klasses.get(klass);
        desc.ensure_initialized();
        let size = desc.layout.instance_size_bytes();
        match self.heap.alloc_raw(size) {
            Some(obj) => {
                self.heap.format_instance(obj, klass, size);
                thread.set_vm_result(obj.addr());
            }
            None => self.post(thread, self.exceptions.out_of_memory),
        }
    }

    fn new_type_array(&self, thread: &mut ThreadContext, klass: KlassId, length: u64) {
        if let Some(obj) = self.allocate_array(thread, klass, length) {
            thread.set_vm_result(obj.addr());
        }
    }

    fn new_object_array(&self, thread: &mut ThreadContext, klass: KlassId, length: u64) {
        if let Some(obj) = self.allocate_array(thread, klass, length) {
            thread.set_vm_result(obj.addr());
        }
    }

    fn new_multi_array(&self, thread: &mut ThreadContext, klass: KlassId, dims: &[u64]) {
        if let Some(obj) = self.alloc_multi(thread, klass, dims) {
            thread.set_vm_result(obj.addr());
        }
    }

    fn register_finalizer(&self, _thread: &mut ThreadContext, obj: ObjRef) {
        let klass = self.heap.klass_of(obj);
        if self.klasses.get(klass).has_finalizer {
            self.finalizable.lock().push(obj);
        }
    }

    fn monitor_enter(&self, _thread: &mut ThreadContext, obj: ObjRef, lock_slot: u64) {
        let mut locks = self.locks.lock();
        let record = locks
            .entry(obj.addr())
            .or_insert(LockRecord { lock_slot, depth: 0 });
        record.depth += 1;
    }

    fn monitor_exit(&self, thread: &mut ThreadContext, obj: ObjRef, lock_slot: u64) {
        let mut locks = self.locks.lock();
        // Exiting through a lock record other than the one that entered is
        // as unbalanced as exiting an unlocked object.
        let balanced = match locks.get_mut(&obj.addr()) {
            Some(record) if record.lock_slot != lock_slot => false,
            Some(record) if record.depth > 1 => {
                record.depth -= 1;
                true
            }
            Some(_) => {
                locks.remove(&obj.addr());
                true
            }
            None => false,
        };
        drop(locks);
        if !balanced {
            self.post(thread, self.exceptions.illegal_monitor);
        }
    }

    fn throw_div0(&self, thread: &mut ThreadContext) {
        self.post(thread, self.exceptions.arithmetic);
    }

    fn throw_null_pointer(&self, thread: &mut ThreadContext) {
        self.post(thread, self.exceptions.null_pointer);
    }

    fn throw_class_cast(&self, thread: &mut ThreadContext, obj: ObjRef) {
        tracing::trace!(%obj, "class cast failure");
        self.post(thread, self.exceptions.class_cast);
    }

    fn throw_incompatible_class_change(&self, thread: &mut ThreadContext) {
        self.post(thread, self.exceptions.incompatible_class_change);
    }

    fn throw_range_check(&self, thread: &mut ThreadContext, index: u64) {
        tracing::trace!(index, "range check failure");
        self.post(thread, self.exceptions.index_out_of_bounds);
    }

    fn exception_handler_for_pc(&self, thread: &mut ThreadContext) -> CodePtr {
        let pc = thread
            .exception_pc()
            .unwrap_or_else(|| panic!("handler lookup without a stashed exception pc"));
        let handlers = self.handlers.lock();
        let entry = handlers
            .get(&pc)
            .unwrap_or_else(|| panic!("no handler registered for {pc}"));
        thread.is_method_handle_return = entry.method_handle_return;
        match &entry.method {
            Some(method) if method.is_not_entrant() => CodePtr::DEOPT_REDIRECT,
            _ => entry.handler,
        }
    }

    fn exception_handler_for_return_address(
        &self,
        thread: &mut ThreadContext,
        ret_pc: CodePtr,
    ) -> CodePtr {
        let handlers = self.handlers.lock();
        let entry = handlers
            .get(&ret_pc)
            .unwrap_or_else(|| panic!("no handler registered for return address {ret_pc}"));
        thread.is_method_handle_return = entry.method_handle_return;
        match &entry.method {
            Some(method) if method.is_not_entrant() => CodePtr::DEOPT_REDIRECT,
            _ => entry.handler,
        }
    }

    fn is_subtype_of(&self, sub: KlassId, sup: KlassId) -> bool {
        self.klasses.is_subtype_of(sub, sup)
    }

    fn resolve_patch(
        &self,
        thread: &mut ThreadContext,
        kind: PatchKind,
        site: PatchSiteId,
    ) -> Option<ResolvedConstant> {
        let target = match self.patch_targets.lock().get(&site) {
            Some(&target) => target,
            None => {
                self.post(thread, self.exceptions.incompatible_class_change);
                return None;
            }
        };
        let resolved = match (kind, target) {
            (PatchKind::AccessField, PatchTarget::Field { offset, is_volatile }) => {
                ResolvedConstant::FieldOffset { offset, is_volatile }
            }
            (PatchKind::LoadKlass, PatchTarget::Klass(klass)) => ResolvedConstant::Klass(klass),
            (PatchKind::LoadMirror, PatchTarget::Mirror(klass)) => {
                let desc = self.klasses.get(klass);
                let mirror = match desc.mirror() {
                    Some(mirror) => mirror,
                    None => {
                        let mirror = self.allocate_special(klass);
                        desc.set_mirror(mirror);
                        mirror
                    }
                };
                ResolvedConstant::Mirror(mirror)
            }
            (kind, target) => {
                tracing::debug!(?kind, ?target, "patch kind does not match registered target");
                self.post(thread, self.exceptions.incompatible_class_change);
                return None;
            }
        };
        tracing::trace!(?site, ?resolved, "resolved patch constant");
        Some(resolved)
    }

    fn klass_layout(&self, klass: KlassId) -> LayoutDescriptor {
        self.klasses.get(klass).layout
    }

    fn klass_init_state(&self, klass: KlassId) -> InitState {
        self.klasses.get(klass).init_state()
    }

    fn klass_has_finalizer(&self, klass: KlassId) -> bool {
        self.klasses.get(klass).has_finalizer
    }

    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn alloc_policy(&self) -> AllocPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klass::KlassDesc;
    use crate::layout::{ArrayTag, LayoutDescriptor};

    fn exception_klasses(table: &mut KlassTable, base: u32) -> ExceptionKlasses {
        let mut next = base;
        let mut reg = |name: &'static str| {
            next += 1;
            table.register(KlassDesc::new(KlassId(next), name, LayoutDescriptor::instance(8)))
        };
        ExceptionKlasses {
            arithmetic: reg("ArithmeticError"),
            null_pointer: reg("NullPointerError"),
            class_cast: reg("ClassCastError"),
            incompatible_class_change: reg("IncompatibleClassChangeError"),
            index_out_of_bounds: reg("IndexOutOfBoundsError"),
            out_of_memory: reg("OutOfMemoryError"),
            illegal_monitor: reg("IllegalMonitorStateError"),
        }
    }

    fn engine() -> EngineServices {
        let mut table = KlassTable::new();
        table.register(KlassDesc::new(KlassId(1), "Point", LayoutDescriptor::instance(16)));
        table.register(KlassDesc::new(
            KlassId(2),
            "int[]",
            LayoutDescriptor::array(ArrayTag::Type, 2),
        ));
        let exceptions = exception_klasses(&mut table, 100);
        EngineServices::new(
            table,
            Arc::new(Heap::new(64 * 1024, 8 * 1024)),
            AllocPolicy::default(),
            exceptions,
        )
    }

    #[test]
    fn test_new_instance_delivers_via_result_slot() {
        let engine = engine();
        let mut thread = ThreadContext::new();
        engine.new_instance(&mut thread, KlassId(1));
        assert!(!thread.has_pending_exception());
        let addr = thread.take_vm_result();
        let obj = ObjRef::from_raw(addr).unwrap();
        assert_eq!(engine.heap().klass_of(obj), KlassId(1));
    }

    #[test]
    fn test_oversized_array_posts_range_error() {
        let engine = engine();
        let mut thread = ThreadContext::new();
        engine.new_type_array(&mut thread, KlassId(2), MAX_ARRAY_LENGTH + 1);
        assert!(thread.has_pending_exception());
        assert_eq!(thread.take_vm_result(), 0);
    }

    #[test]
    fn test_monitor_reentry_and_exit() {
        let engine = engine();
        let mut thread = ThreadContext::new();
        let obj = engine.heap().alloc_raw(24).unwrap();
        engine.monitor_enter(&mut thread, obj, 0x80);
        engine.monitor_enter(&mut thread, obj, 0x80);
        engine.monitor_exit(&mut thread, obj, 0x80);
        assert!(engine.is_locked(obj));
        engine.monitor_exit(&mut thread, obj, 0x80);
        assert!(!engine.is_locked(obj));
        assert!(!thread.has_pending_exception());
    }

    #[test]
    fn test_unbalanced_monitor_exit_posts_error() {
        let engine = engine();
        let mut thread = ThreadContext::new();
        let obj = engine.heap().alloc_raw(24).unwrap();
        engine.monitor_exit(&mut thread, obj, 0x80);
        assert!(thread.has_pending_exception());
    }

    #[test]
    fn test_monitor_exit_through_wrong_lock_record_posts_error() {
        let engine = engine();
        let mut thread = ThreadContext::new();
        let obj = engine.heap().alloc_raw(24).unwrap();
        engine.monitor_enter(&mut thread, obj, 0x80);
        engine.monitor_exit(&mut thread, obj, 0x90);
        assert!(thread.has_pending_exception());
        // The lock held through the entering record survives.
        assert!(engine.is_locked(obj));
        thread.take_pending_exception();
        engine.monitor_exit(&mut thread, obj, 0x80);
        assert!(!engine.is_locked(obj));
    }

    #[test]
    fn test_mirror_resolution_is_stable() {
        let engine = engine();
        engine.add_patch_target(PatchSiteId(3), PatchTarget::Mirror(KlassId(1)));
        let mut thread = ThreadContext::new();
        let a = engine.resolve_patch(&mut thread, PatchKind::LoadMirror, PatchSiteId(3));
        let b = engine.resolve_patch(&mut thread, PatchKind::LoadMirror, PatchSiteId(3));
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn test_unknown_site_posts_link_error() {
        let engine = engine();
        let mut thread = ThreadContext::new();
        let r = engine.resolve_patch(&mut thread, PatchKind::LoadKlass, PatchSiteId(99));
        assert!(r.is_none());
        assert!(thread.has_pending_exception());
    }
}
