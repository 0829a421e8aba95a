//! Object reference and class identifier newtypes.
//!
//! Object references are word-sized heap addresses. The null reference is
//! address zero and is represented as `Option<ObjRef>` everywhere a slot may
//! legitimately be empty; a raw zero never escapes into an `ObjRef`.

use std::fmt;

// =============================================================================
// Object References
// =============================================================================

/// A non-null reference to a heap object (a byte address into the heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u64);

impl ObjRef {
    /// Create from a raw heap address. Returns `None` for the null address.
    #[inline]
    pub const fn from_raw(addr: u64) -> Option<ObjRef> {
        if addr == 0 { None } else { Some(ObjRef(addr)) }
    }

    /// The raw heap address.
    #[inline]
    pub const fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj@{:#x}", self.0)
    }
}

// =============================================================================
// Class Identifiers
// =============================================================================

/// Identifier of a loaded class in the engine's metadata tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KlassId(pub u32);

impl KlassId {
    /// The identifier as a machine word, as it travels through registers
    /// and patched constant slots.
    #[inline]
    pub const fn as_word(self) -> u64 {
        self.0 as u64
    }

    /// Recover an identifier from a machine word.
    #[inline]
    pub const fn from_word(word: u64) -> KlassId {
        KlassId(word as u32)
    }
}

impl fmt::Display for KlassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "klass#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_not_an_objref() {
        assert_eq!(ObjRef::from_raw(0), None);
        assert_eq!(ObjRef::from_raw(16).map(|o| o.addr()), Some(16));
    }

    #[test]
    fn test_klass_id_word_round_trip() {
        let k = KlassId(42);
        assert_eq!(KlassId::from_word(k.as_word()), k);
    }
}
