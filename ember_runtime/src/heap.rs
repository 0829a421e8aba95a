//! Shared allocation area.
//!
//! A single fixed-size arena split into a young region (eden), from which
//! thread-local allocation buffers and direct slow-path allocations are
//! carved, and a permanent region for metadata-lifetime objects (class
//! mirrors and the like). Objects never move here; relocation is the
//! external collector's concern. The heap only provides raw carving plus
//! word-granular reads and writes for header and body initialization.

use parking_lot::Mutex;

use crate::layout::{ARRAY_HEADER_BYTES, INSTANCE_HEADER_BYTES};
use crate::object::{KlassId, ObjRef};

/// Lowest address handed out; keeps zero free for the null reference.
const HEAP_BASE: u64 = 16;

// =============================================================================
// Heap
// =============================================================================

/// The process-wide allocation area.
pub struct Heap {
    inner: Mutex<HeapInner>,
    /// First address past the young region; addresses below are scavengable.
    young_limit: u64,
    capacity: u64,
}

struct HeapInner {
    memory: Vec<u8>,
    young_top: u64,
    perm_top: u64,
}

impl Heap {
    /// Create a heap with the given young and permanent region sizes.
    pub fn new(young_bytes: u64, perm_bytes: u64) -> Heap {
        let capacity = HEAP_BASE + young_bytes + perm_bytes;
        Heap {
            inner: Mutex::new(HeapInner {
                memory: vec![0u8; capacity as usize],
                young_top: HEAP_BASE,
                perm_top: HEAP_BASE + young_bytes,
            }),
            young_limit: HEAP_BASE + young_bytes,
            capacity,
        }
    }

    /// Directly allocate `size` bytes from the shared young region.
    ///
    /// This is the slow-path fallback when a thread-local buffer cannot be
    /// refilled; returns `None` when the region is exhausted.
    pub fn alloc_raw(&self, size: u64) -> Option<ObjRef> {
        debug_assert_eq!(size % 8, 0, "allocation sizes are aligned by the layout");
        let mut inner = self.inner.lock();
        if inner.young_top + size > self.young_limit {
            return None;
        }
        let addr = inner.young_top;
        inner.young_top += size;
        ObjRef::from_raw(addr)
    }

    /// Carve a fresh thread-local allocation buffer out of the young region.
    ///
    /// Returns the `(start, end)` address pair of the new buffer.
    pub fn alloc_tlab_chunk(&self, chunk_bytes: u64) -> Option<(u64, u64)> {
        let mut inner = self.inner.lock();
        if inner.young_top + chunk_bytes > self.young_limit {
            return None;
        }
        let start = inner.young_top;
        inner.young_top += chunk_bytes;
        Some((start, start + chunk_bytes))
    }

    /// Allocate from the permanent region (class mirrors, metadata objects).
    pub fn alloc_permanent(&self, size: u64) -> Option<ObjRef> {
        let mut inner = self.inner.lock();
        if inner.perm_top + size > self.capacity {
            return None;
        }
        let addr = inner.perm_top;
        inner.perm_top += size;
        ObjRef::from_raw(addr)
    }

    /// Whether the collector would visit this object during a young-generation
    /// collection.
    #[inline]
    pub fn is_scavengable(&self, obj: ObjRef) -> bool {
        obj.addr() < self.young_limit
    }

    /// Read a word at a heap address.
    pub fn read_word(&self, addr: u64) -> u64 {
        let inner = self.inner.lock();
        let i = addr as usize;
        u64::from_le_bytes(inner.memory[i..i + 8].try_into().unwrap())
    }

    /// Write a word at a heap address.
    pub fn write_word(&self, addr: u64, value: u64) {
        let mut inner = self.inner.lock();
        let i = addr as usize;
        inner.memory[i..i + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Zero a byte range.
    pub fn zero_range(&self, addr: u64, len: u64) {
        let mut inner = self.inner.lock();
        let i = addr as usize;
        inner.memory[i..i + len as usize].fill(0);
    }

    // =========================================================================
    // Object formatting
    // =========================================================================

    /// Write an instance header and zero the body. `size` is the full
    /// allocation size including the header.
    pub fn format_instance(&self, obj: ObjRef, klass: KlassId, size: u64) {
        self.write_word(obj.addr(), klass.as_word());
        self.zero_range(obj.addr() + INSTANCE_HEADER_BYTES, size - INSTANCE_HEADER_BYTES);
    }

    /// Write an array header (klass word + length word) and zero the body.
    pub fn format_array(&self, obj: ObjRef, klass: KlassId, length: u64, size: u64) {
        self.write_word(obj.addr(), klass.as_word());
        self.write_word(obj.addr() + 8, length);
        self.zero_range(obj.addr() + ARRAY_HEADER_BYTES, size - ARRAY_HEADER_BYTES);
    }

    /// Read the klass word of an object header.
    #[inline]
    pub fn klass_of(&self, obj: ObjRef) -> KlassId {
        KlassId::from_word(self.read_word(obj.addr()))
    }

    /// Read the length word of an array header.
    #[inline]
    pub fn array_length(&self, obj: ObjRef) -> u64 {
        self.read_word(obj.addr() + 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_allocation_bumps() {
        let heap = Heap::new(4096, 1024);
        let a = heap.alloc_raw(32).unwrap();
        let b = heap.alloc_raw(32).unwrap();
        assert_eq!(b.addr(), a.addr() + 32);
    }

    #[test]
    fn test_young_exhaustion() {
        let heap = Heap::new(64, 64);
        assert!(heap.alloc_raw(64).is_some());
        assert!(heap.alloc_raw(8).is_none());
    }

    #[test]
    fn test_scavengable_regions() {
        let heap = Heap::new(4096, 1024);
        let young = heap.alloc_raw(32).unwrap();
        let perm = heap.alloc_permanent(32).unwrap();
        assert!(heap.is_scavengable(young));
        assert!(!heap.is_scavengable(perm));
    }

    #[test]
    fn test_format_array_header() {
        let heap = Heap::new(4096, 1024);
        let obj = heap.alloc_raw(40).unwrap();
        heap.format_array(obj, KlassId(7), 5, 40);
        assert_eq!(heap.klass_of(obj), KlassId(7));
        assert_eq!(heap.array_length(obj), 5);
        // Body is zeroed.
        assert_eq!(heap.read_word(obj.addr() + 16), 0);
    }
}
