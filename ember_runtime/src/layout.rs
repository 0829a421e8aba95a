//! Class layout descriptors and allocation-size arithmetic.
//!
//! The size computation for arrays (`header + (length << element_shift)`,
//! rounded up to the object alignment) is used by both the stub fast path
//! and the slow-path allocator. Both paths call the same function here so
//! the two can never disagree on an allocation size; the collector's
//! bookkeeping depends on the sizes being byte-identical.

// =============================================================================
// Constants
// =============================================================================

/// Minimum object alignment in bytes. Every allocation size is rounded up
/// to a multiple of this.
pub const OBJECT_ALIGNMENT: u64 = 8;

/// Size of the common object header (klass word) in bytes.
pub const INSTANCE_HEADER_BYTES: u64 = 8;

/// Size of the array header (klass word + length word) in bytes.
pub const ARRAY_HEADER_BYTES: u64 = 16;

// =============================================================================
// Array Tags
// =============================================================================

/// Element kind tag carried by array class layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArrayTag {
    /// Primitive element kind (int, byte, double, ...).
    Type = 1,
    /// Object-reference element kind.
    Object = 2,
}

// =============================================================================
// Layout Descriptors
// =============================================================================

/// Compact description of how instances of a class are laid out.
///
/// For instance classes this is the fixed allocation size; for array
/// classes it is the header size plus a log2 element size and the element
/// kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutDescriptor {
    /// A plain instance with a fixed size in bytes (header included).
    ///
    /// `slow_path_only` marks classes that must never be allocated on the
    /// fast path (oversized, or with allocation-time side effects).
    Instance { size_bytes: u64, slow_path_only: bool },
    /// An array class: `header_bytes + (length << elem_shift)` body.
    Array { tag: ArrayTag, header_bytes: u64, elem_shift: u32 },
}

impl LayoutDescriptor {
    /// Layout for an instance class with the given body size in bytes
    /// (excluding the header).
    pub const fn instance(body_bytes: u64) -> LayoutDescriptor {
        LayoutDescriptor::Instance {
            size_bytes: align_up(INSTANCE_HEADER_BYTES + body_bytes),
            slow_path_only: false,
        }
    }

    /// Layout for an array class with elements of `1 << elem_shift` bytes.
    pub const fn array(tag: ArrayTag, elem_shift: u32) -> LayoutDescriptor {
        LayoutDescriptor::Array { tag, header_bytes: ARRAY_HEADER_BYTES, elem_shift }
    }

    /// Whether the fast allocation path may be used for this class.
    #[inline]
    pub const fn fast_path_allowed(&self) -> bool {
        match *self {
            LayoutDescriptor::Instance { slow_path_only, .. } => !slow_path_only,
            LayoutDescriptor::Array { .. } => true,
        }
    }

    /// Allocation size for an instance of this class.
    ///
    /// Panics if called on an array layout; array sizes need a length.
    #[inline]
    pub fn instance_size_bytes(&self) -> u64 {
        match *self {
            LayoutDescriptor::Instance { size_bytes, .. } => size_bytes,
            LayoutDescriptor::Array { .. } => {
                panic!("instance size requested for an array layout")
            }
        }
    }

    /// Allocation size for an array of `length` elements: the shift-and-round
    /// shared by the fast and slow allocation paths.
    ///
    /// Panics if called on an instance layout.
    #[inline]
    pub fn array_size_bytes(&self, length: u64) -> u64 {
        match *self {
            LayoutDescriptor::Array { header_bytes, elem_shift, .. } => {
                align_up(header_bytes + (length << elem_shift))
            }
            LayoutDescriptor::Instance { .. } => {
                panic!("array size requested for an instance layout")
            }
        }
    }

    /// The array element tag, if this is an array layout.
    #[inline]
    pub const fn array_tag(&self) -> Option<ArrayTag> {
        match *self {
            LayoutDescriptor::Array { tag, .. } => Some(tag),
            LayoutDescriptor::Instance { .. } => None,
        }
    }
}

/// Round a byte size up to the object alignment.
#[inline]
pub const fn align_up(bytes: u64) -> u64 {
    (bytes + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
        assert_eq!(align_up(24), 24);
    }

    #[test]
    fn test_instance_size_includes_header() {
        let layout = LayoutDescriptor::instance(20);
        // 8-byte header + 20-byte body, rounded to 32.
        assert_eq!(layout.instance_size_bytes(), 32);
    }

    #[test]
    fn test_array_size_shift_and_round() {
        let ints = LayoutDescriptor::array(ArrayTag::Type, 2);
        // 16-byte header + 5 * 4 bytes = 36, rounded to 40.
        assert_eq!(ints.array_size_bytes(5), 40);

        let refs = LayoutDescriptor::array(ArrayTag::Object, 3);
        assert_eq!(refs.array_size_bytes(0), 16);
        assert_eq!(refs.array_size_bytes(1), 24);
    }

    #[test]
    fn test_fast_path_flag() {
        let plain = LayoutDescriptor::instance(8);
        assert!(plain.fast_path_allowed());

        let slow = LayoutDescriptor::Instance { size_bytes: 1 << 20, slow_path_only: true };
        assert!(!slow.fast_path_allowed());
    }
}
