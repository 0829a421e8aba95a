//! Class metadata facade.
//!
//! The real metadata model (constant pools, field tables, vtables) is an
//! external collaborator; the stubs only need the handful of facts recorded
//! here: the layout descriptor, the initialization state, the has-finalizer
//! flag, the class mirror object, and the supertype chain for the slow
//! subtype check.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::layout::LayoutDescriptor;
use crate::object::{KlassId, ObjRef};

// =============================================================================
// Initialization State
// =============================================================================

/// Class initialization progress, as observed by the allocation fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitState {
    /// Loaded but static initializers have not run.
    Loaded = 0,
    /// Initialization in progress on some thread.
    BeingInitialized = 1,
    /// Fully initialized; fast-path allocation is permitted.
    FullyInitialized = 2,
}

impl InitState {
    /// Convert from the raw byte stored in the class record.
    #[inline]
    pub fn from_u8(value: u8) -> InitState {
        match value {
            0 => InitState::Loaded,
            1 => InitState::BeingInitialized,
            2 => InitState::FullyInitialized,
            _ => unreachable!("invalid init state byte"),
        }
    }
}

// =============================================================================
// Klass Descriptor
// =============================================================================

/// The per-class record the stubs consult.
pub struct KlassDesc {
    pub id: KlassId,
    pub name: &'static str,
    pub layout: LayoutDescriptor,
    pub has_finalizer: bool,
    /// Supertypes, nearest first. Used by the slow subtype check.
    pub supers: SmallVec<[KlassId; 4]>,
    init_state: AtomicU8,
    mirror: Mutex<Option<ObjRef>>,
}

impl KlassDesc {
    /// Create a class record in the `Loaded` state.
    pub fn new(id: KlassId, name: &'static str, layout: LayoutDescriptor) -> KlassDesc {
        KlassDesc {
            id,
            name,
            layout,
            has_finalizer: false,
            supers: SmallVec::new(),
            init_state: AtomicU8::new(InitState::Loaded as u8),
            mirror: Mutex::new(None),
        }
    }

    /// Mark the class as carrying a finalizer.
    pub fn with_finalizer(mut self) -> KlassDesc {
        self.has_finalizer = true;
        self
    }

    /// Record the supertype chain, nearest first.
    pub fn with_supers(mut self, supers: &[KlassId]) -> KlassDesc {
        self.supers = SmallVec::from_slice(supers);
        self
    }

    /// Current initialization state.
    #[inline]
    pub fn init_state(&self) -> InitState {
        InitState::from_u8(self.init_state.load(Ordering::Acquire))
    }

    /// Advance the initialization state.
    pub fn set_init_state(&self, state: InitState) {
        self.init_state.store(state as u8, Ordering::Release);
    }

    /// Run static initialization if it has not happened yet. The real engine
    /// executes initializer code here; the facade just flips the state.
    pub fn ensure_initialized(&self) {
        if self.init_state() != InitState::FullyInitialized {
            tracing::debug!(klass = self.name, "initializing class");
            self.set_init_state(InitState::FullyInitialized);
        }
    }

    /// The class mirror object, if one has been created.
    pub fn mirror(&self) -> Option<ObjRef> {
        *self.mirror.lock()
    }

    /// Install the class mirror object.
    pub fn set_mirror(&self, mirror: ObjRef) {
        *self.mirror.lock() = Some(mirror);
    }
}

// =============================================================================
// Klass Table
// =============================================================================

/// The loaded-class table. Built during engine bootstrap, read-only
/// afterwards (per-class mutable bits live inside `KlassDesc`).
#[derive(Default)]
pub struct KlassTable {
    map: FxHashMap<KlassId, KlassDesc>,
}

impl KlassTable {
    pub fn new() -> KlassTable {
        KlassTable::default()
    }

    /// Register a class. Panics on duplicate ids; class ids are unique by
    /// construction in the loader.
    pub fn register(&mut self, desc: KlassDesc) -> KlassId {
        let id = desc.id;
        let prev = self.map.insert(id, desc);
        assert!(prev.is_none(), "duplicate klass id {id}");
        id
    }

    /// Look up a class record. Panics on unknown ids: the compiled tier can
    /// only reference classes the loader has registered.
    #[inline]
    pub fn get(&self, id: KlassId) -> &KlassDesc {
        self.map.get(&id).unwrap_or_else(|| panic!("unknown klass id {id}"))
    }

    /// Whether `sub` is `sup` or one of its supertypes, by walking the
    /// recorded chain.
    pub fn is_subtype_of(&self, sub: KlassId, sup: KlassId) -> bool {
        if sub == sup {
            return true;
        }
        let mut current = sub;
        loop {
            let desc = self.get(current);
            match desc.supers.first() {
                Some(&parent) => {
                    if parent == sup || desc.supers.contains(&sup) {
                        return true;
                    }
                    current = parent;
                }
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutDescriptor;

    fn table() -> KlassTable {
        let mut t = KlassTable::new();
        let object = t.register(KlassDesc::new(KlassId(1), "Object", LayoutDescriptor::instance(0)));
        let number =
            t.register(KlassDesc::new(KlassId(2), "Number", LayoutDescriptor::instance(8)).with_supers(&[object]));
        t.register(
            KlassDesc::new(KlassId(3), "Integer", LayoutDescriptor::instance(8))
                .with_supers(&[number, object]),
        );
        t.register(KlassDesc::new(KlassId(4), "String", LayoutDescriptor::instance(16)).with_supers(&[object]));
        t
    }

    #[test]
    fn test_subtype_chain() {
        let t = table();
        assert!(t.is_subtype_of(KlassId(3), KlassId(2)));
        assert!(t.is_subtype_of(KlassId(3), KlassId(1)));
        assert!(t.is_subtype_of(KlassId(2), KlassId(2)));
        assert!(!t.is_subtype_of(KlassId(2), KlassId(3)));
        assert!(!t.is_subtype_of(KlassId(4), KlassId(2)));
    }

    #[test]
    fn test_init_state_transitions() {
        let t = table();
        let k = t.get(KlassId(2));
        assert_eq!(k.init_state(), InitState::Loaded);
        k.ensure_initialized();
        assert_eq!(k.init_state(), InitState::FullyInitialized);
    }
}
