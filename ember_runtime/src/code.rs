//! Compiled-code model: methods, frames, patch sites, and the registry.
//!
//! A compiled method is a byte image plus side tables. Patchable constant
//! sites inside the image follow a fixed convention: three metadata bytes
//! sit immediately before the site offset —
//!
//! ```text
//!   image[site - 1]  byte count of the patchable instruction region
//!   image[site - 2]  byte skip between the copy buffer and the site
//!   image[site - 3]  offset back to the initialization-barrier entry
//! ```
//!
//! and the replacement bytes wait in a copy buffer at
//! `site - byte_skip - byte_count`. Patching writes the resolved constant
//! into the copy buffer's constant slot, then copies the whole buffer over
//! the site in one step so concurrent executors only ever see the old or
//! the new instruction bytes. The constant slot's position inside the copy
//! buffer is recorded in the `PatchSite` record; locating it in a real
//! image would require instruction decoding, which is outside this
//! subsystem.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

// =============================================================================
// Code Pointers & Identifiers
// =============================================================================

/// A position in compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePtr(pub u64);

impl CodePtr {
    /// Handler-lookup result meaning "the method was invalidated; continue
    /// at the deoptimization entry instead of a real handler".
    pub const DEOPT_REDIRECT: CodePtr = CodePtr(u64::MAX);
}

impl fmt::Display for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc@{:#x}", self.0)
    }
}

/// Identifier of a compiled method in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

/// Identifier of a patchable constant site within a compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchSiteId(pub u32);

// =============================================================================
// Relocation Metadata
// =============================================================================

/// Kind of reference a relocation entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// An object reference embedded in code (a class mirror).
    Oop,
    /// A class-metadata reference embedded in code.
    Klass,
}

/// One relocation entry: the collector's view of a reference constant
/// embedded in the byte image.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    /// Patch-site offset this entry covers.
    pub site_offset: usize,
    pub kind: RelocKind,
    /// The reference value, once the site has been patched.
    pub value: Option<u64>,
}

// =============================================================================
// Patch Sites
// =============================================================================

/// Lifecycle of a patchable constant site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PatchSiteState {
    /// Constant not yet resolved; executions route to the patch stub.
    Unresolved = 0,
    /// Constant resolved and the site rewritten.
    Resolved = 1,
    /// The holding method was invalidated before the site could be
    /// rewritten; the site will never be patched.
    Superseded = 2,
}

impl PatchSiteState {
    #[inline]
    fn from_u8(value: u8) -> PatchSiteState {
        match value {
            0 => PatchSiteState::Unresolved,
            1 => PatchSiteState::Resolved,
            2 => PatchSiteState::Superseded,
            _ => unreachable!("invalid patch site state"),
        }
    }
}

/// A patchable constant site within a compiled method.
pub struct PatchSite {
    pub id: PatchSiteId,
    /// Offset of the patchable instruction region in the byte image.
    pub offset: usize,
    /// Offset of the 8-byte constant slot inside the copy buffer.
    pub const_offset: usize,
    state: AtomicU8,
}

impl PatchSite {
    #[inline]
    pub fn state(&self) -> PatchSiteState {
        PatchSiteState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition `from` to `to`; returns false if another thread got there
    /// first (the caller treats that as a benign no-op).
    pub fn transition(&self, from: PatchSiteState, to: PatchSiteState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Decoded patch-site metadata bytes.
#[derive(Debug, Clone, Copy)]
pub struct PatchHeader {
    /// Byte count of the patchable instruction region.
    pub byte_count: usize,
    /// Offset of the copy buffer in the byte image.
    pub copy_offset: usize,
    /// Offset of the initialization-barrier entry in the byte image.
    pub init_entry_offset: usize,
}

// =============================================================================
// Compiled Methods
// =============================================================================

/// A compiled method: byte image, patch sites, relocation entries, and the
/// invalidation flags the patch controller consults.
pub struct CompiledMethod {
    pub id: MethodId,
    /// Code position of the method entry, used to key frames and handlers.
    pub entry: CodePtr,
    image: Mutex<Vec<u8>>,
    sites: FxHashMap<PatchSiteId, PatchSite>,
    relocs: Mutex<Vec<RelocEntry>>,
    not_entrant: AtomicBool,
    on_scavenge_list: AtomicBool,
}

impl CompiledMethod {
    pub fn new(id: MethodId, entry: CodePtr, image: Vec<u8>) -> CompiledMethod {
        CompiledMethod {
            id,
            entry,
            image: Mutex::new(image),
            sites: FxHashMap::default(),
            relocs: Mutex::new(Vec::new()),
            not_entrant: AtomicBool::new(false),
            on_scavenge_list: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Installation (compile time)
    // =========================================================================

    /// Lay out a patch site at `site_offset`: writes the metadata bytes and
    /// the copy-buffer replacement bytes into the image and records the
    /// site. `byte_skip` is the distance between the end of the copy buffer
    /// and the site and must cover at least the three metadata bytes.
    pub fn install_patch_site(
        &mut self,
        id: PatchSiteId,
        site_offset: usize,
        byte_skip: usize,
        replacement: &[u8],
        const_offset: usize,
        init_entry_back_offset: u8,
    ) {
        let byte_count = replacement.len();
        assert!(byte_count > 0 && byte_count <= u8::MAX as usize);
        assert!(byte_skip >= 3 && byte_skip <= u8::MAX as usize);
        assert!(const_offset + 8 <= byte_count, "constant slot must lie inside the copy buffer");
        let copy_offset = site_offset - byte_skip - byte_count;

        {
            let mut image = self.image.lock();
            assert!(site_offset + byte_count <= image.len());
            image[site_offset - 1] = byte_count as u8;
            image[site_offset - 2] = byte_skip as u8;
            image[site_offset - 3] = init_entry_back_offset;
            image[copy_offset..copy_offset + byte_count].copy_from_slice(replacement);
        }

        let prev = self.sites.insert(
            id,
            PatchSite {
                id,
                offset: site_offset,
                const_offset,
                state: AtomicU8::new(PatchSiteState::Unresolved as u8),
            },
        );
        assert!(prev.is_none(), "duplicate patch site {id:?}");
    }

    /// Declare a relocation entry covering a patch site that will hold a
    /// reference constant once patched.
    pub fn add_reloc(&mut self, site_offset: usize, kind: RelocKind) {
        self.relocs.lock().push(RelocEntry { site_offset, kind, value: None });
    }

    // =========================================================================
    // Patch-time access
    // =========================================================================

    #[inline]
    pub fn site(&self, id: PatchSiteId) -> Option<&PatchSite> {
        self.sites.get(&id)
    }

    /// Decode the metadata bytes before `site_offset`. Returns `None` when
    /// the header is malformed or the derived offsets escape the image.
    pub fn decode_patch_header(&self, site_offset: usize) -> Option<PatchHeader> {
        let image = self.image.lock();
        if site_offset < 3 || site_offset >= image.len() {
            return None;
        }
        let byte_count = image[site_offset - 1] as usize;
        let byte_skip = image[site_offset - 2] as usize;
        let init_back = image[site_offset - 3] as usize;
        if byte_count == 0 || byte_skip < 3 {
            return None;
        }
        let copy_offset = site_offset.checked_sub(byte_skip + byte_count)?;
        if site_offset + byte_count > image.len() || init_back > site_offset {
            return None;
        }
        Some(PatchHeader {
            byte_count,
            copy_offset,
            init_entry_offset: site_offset - init_back,
        })
    }

    /// Write the resolved constant into the copy buffer's slot, then copy
    /// the buffer over the site in one locked step, so an executing thread
    /// observes either the old bytes or the fully patched ones.
    pub fn apply_patch(&self, header: &PatchHeader, site: &PatchSite, constant: u64) {
        let mut image = self.image.lock();
        let slot = header.copy_offset + site.const_offset;
        image[slot..slot + 8].copy_from_slice(&constant.to_le_bytes());
        image.copy_within(header.copy_offset..header.copy_offset + header.byte_count, site.offset);
    }

    /// Fill in the relocation entry covering a patched reference site.
    /// Returns false when no entry covers the site.
    pub fn fixup_reloc(&self, site_offset: usize, kind: RelocKind, value: u64) -> bool {
        let mut relocs = self.relocs.lock();
        match relocs.iter_mut().find(|r| r.site_offset == site_offset && r.kind == kind) {
            Some(entry) => {
                entry.value = Some(value);
                true
            }
            None => false,
        }
    }

    /// The relocated value at a site, if any. Used by collector bookkeeping
    /// and tests.
    pub fn reloc_value(&self, site_offset: usize) -> Option<u64> {
        self.relocs.lock().iter().find(|r| r.site_offset == site_offset).and_then(|r| r.value)
    }

    /// Read bytes out of the image.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.image.lock()[offset..offset + len].to_vec()
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Mark the method non-entrant: future entries go through recompilation.
    pub fn make_not_entrant(&self) {
        tracing::debug!(method = ?self.id, "marking method not entrant");
        self.not_entrant.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_not_entrant(&self) -> bool {
        self.not_entrant.load(Ordering::Acquire)
    }

    /// Enroll the method on the collector's scavengable-code list. Returns
    /// false if it was already enrolled.
    pub fn try_enroll_scavengable(&self) -> bool {
        !self.on_scavenge_list.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_on_scavenge_list(&self) -> bool {
        self.on_scavenge_list.load(Ordering::Acquire)
    }
}

// =============================================================================
// Compiled Frames
// =============================================================================

/// An activation of a compiled method, as seen by the patch controller and
/// the deoptimization machinery.
pub struct CompiledFrame {
    pub method: Arc<CompiledMethod>,
    /// The code position the frame is executing at.
    pub pc: CodePtr,
    /// The patch site the frame entered the patch stub from, if any.
    pub patch_site: Option<PatchSiteId>,
    deoptimized: AtomicBool,
}

impl CompiledFrame {
    pub fn new(method: Arc<CompiledMethod>, pc: CodePtr, patch_site: Option<PatchSiteId>) -> CompiledFrame {
        CompiledFrame { method, pc, patch_site, deoptimized: AtomicBool::new(false) }
    }

    /// Mark the frame for deoptimization; it will re-enter the interpreter
    /// tier instead of resuming compiled code.
    pub fn mark_deoptimized(&self) {
        self.deoptimized.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_deoptimized(&self) -> bool {
        self.deoptimized.load(Ordering::Acquire)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Shared registry of live compiled methods.
#[derive(Default)]
pub struct CompiledRegistry {
    methods: DashMap<MethodId, Arc<CompiledMethod>>,
}

impl CompiledRegistry {
    pub fn new() -> CompiledRegistry {
        CompiledRegistry::default()
    }

    pub fn register(&self, method: Arc<CompiledMethod>) {
        self.methods.insert(method.id, method);
    }

    pub fn get(&self, id: MethodId) -> Option<Arc<CompiledMethod>> {
        self.methods.get(&id).map(|m| Arc::clone(m.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method_with_site() -> CompiledMethod {
        let mut m = CompiledMethod::new(MethodId(1), CodePtr(0x100), vec![0u8; 64]);
        // 12 replacement bytes with an 8-byte constant slot at offset 4,
        // copy buffer at 32 - 4 - 12 = 16.
        let replacement = [0xAA, 0xAB, 0xAC, 0xAD, 0, 0, 0, 0, 0, 0, 0, 0];
        m.install_patch_site(PatchSiteId(9), 32, 4, &replacement, 4, 0);
        m
    }

    #[test]
    fn test_header_round_trip() {
        let m = method_with_site();
        let h = m.decode_patch_header(32).unwrap();
        assert_eq!(h.byte_count, 12);
        assert_eq!(h.copy_offset, 16);
    }

    #[test]
    fn test_apply_patch_rewrites_site() {
        let m = method_with_site();
        let site = m.site(PatchSiteId(9)).unwrap();
        let h = m.decode_patch_header(site.offset).unwrap();
        m.apply_patch(&h, site, 0xDEAD_BEEF);

        let bytes = m.read_bytes(32, 12);
        assert_eq!(&bytes[0..4], &[0xAA, 0xAB, 0xAC, 0xAD]);
        assert_eq!(u64::from_le_bytes(bytes[4..12].try_into().unwrap()), 0xDEAD_BEEF);
    }

    #[test]
    fn test_malformed_header_rejected() {
        let m = CompiledMethod::new(MethodId(2), CodePtr(0x200), vec![0u8; 16]);
        // No site installed; metadata bytes are zero.
        assert!(m.decode_patch_header(8).is_none());
    }

    #[test]
    fn test_site_state_transition_races() {
        let m = method_with_site();
        let site = m.site(PatchSiteId(9)).unwrap();
        assert_eq!(site.state(), PatchSiteState::Unresolved);
        assert!(site.transition(PatchSiteState::Unresolved, PatchSiteState::Resolved));
        assert!(!site.transition(PatchSiteState::Unresolved, PatchSiteState::Resolved));
        assert_eq!(site.state(), PatchSiteState::Resolved);
    }

    #[test]
    fn test_scavenge_enroll_once() {
        let m = method_with_site();
        assert!(m.try_enroll_scavengable());
        assert!(!m.try_enroll_scavengable());
        assert!(m.is_on_scavenge_list());
    }

    #[test]
    fn test_reloc_fixup() {
        let mut m = method_with_site();
        m.add_reloc(32, RelocKind::Klass);
        assert!(m.fixup_reloc(32, RelocKind::Klass, 0x77));
        assert!(!m.fixup_reloc(32, RelocKind::Oop, 0x77));
        assert_eq!(m.reloc_value(32), Some(0x77));
    }
}
