//! Thread-local allocation buffers.
//!
//! Each thread owns one buffer carved from the shared young region and
//! bump-allocates from it without synchronization. When the buffer is
//! exhausted the owning stub either refills it (one attempt) or falls back
//! to a direct shared-area allocation before taking the slow path.

use crate::heap::Heap;
use crate::object::ObjRef;

// =============================================================================
// Allocation Policy
// =============================================================================

/// Process-wide allocation tuning, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct AllocPolicy {
    /// Whether thread-local buffers are used at all.
    pub use_tlab: bool,
    /// Whether stubs may refill an exhausted buffer inline (the fast-refill
    /// policy). When disabled, buffer exhaustion goes straight to the slow
    /// path.
    pub fast_refill: bool,
    /// Size of a freshly carved buffer in bytes.
    pub tlab_chunk_bytes: u64,
    /// Largest array length the fast path will allocate; longer arrays are
    /// always routed to the slow path.
    pub max_fast_array_length: u64,
}

impl Default for AllocPolicy {
    fn default() -> Self {
        AllocPolicy {
            use_tlab: true,
            fast_refill: true,
            tlab_chunk_bytes: 32 * 1024,
            max_fast_array_length: 0x00FF_FFFF,
        }
    }
}

impl AllocPolicy {
    /// Whether stub generation should emit the allocation fast path.
    #[inline]
    pub const fn fast_path_enabled(&self) -> bool {
        self.use_tlab && self.fast_refill
    }
}

// =============================================================================
// Tlab
// =============================================================================

/// One thread's allocation buffer: a `[ptr, end)` range in the young region.
///
/// Starts empty; the first allocation attempt fails and triggers a refill.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tlab {
    ptr: u64,
    end: u64,
}

impl Tlab {
    /// Bump-allocate `size` bytes, or `None` if the buffer is exhausted.
    #[inline]
    pub fn allocate(&mut self, size: u64) -> Option<ObjRef> {
        let new_ptr = self.ptr.checked_add(size)?;
        if new_ptr > self.end {
            return None;
        }
        let addr = self.ptr;
        self.ptr = new_ptr;
        ObjRef::from_raw(addr)
    }

    /// Discard the current buffer and carve a fresh one from the heap.
    /// Returns false when the young region cannot supply a new buffer.
    pub fn refill(&mut self, heap: &Heap, chunk_bytes: u64) -> bool {
        match heap.alloc_tlab_chunk(chunk_bytes) {
            Some((start, end)) => {
                self.ptr = start;
                self.end = end;
                true
            }
            None => false,
        }
    }

    /// Bytes remaining in the buffer.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.end - self.ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tlab_fails_first_allocation() {
        let mut tlab = Tlab::default();
        assert!(tlab.allocate(16).is_none());
    }

    #[test]
    fn test_refill_then_bump() {
        let heap = Heap::new(4096, 0);
        let mut tlab = Tlab::default();
        assert!(tlab.refill(&heap, 256));
        let a = tlab.allocate(32).unwrap();
        let b = tlab.allocate(32).unwrap();
        assert_eq!(b.addr(), a.addr() + 32);
        assert_eq!(tlab.remaining(), 192);
    }

    #[test]
    fn test_exhaustion_within_buffer() {
        let heap = Heap::new(4096, 0);
        let mut tlab = Tlab::default();
        assert!(tlab.refill(&heap, 64));
        assert!(tlab.allocate(64).is_some());
        assert!(tlab.allocate(8).is_none());
    }

    #[test]
    fn test_refill_fails_when_young_region_is_spent() {
        let heap = Heap::new(128, 0);
        let mut tlab = Tlab::default();
        assert!(tlab.refill(&heap, 128));
        assert!(!tlab.refill(&heap, 128));
    }
}
