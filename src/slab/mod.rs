//! Per-slab state: the embedded descriptor, its in-use bitmap, and the
//! layout arithmetic a cache uses to carve a buddy block into objects.
//!
//! A slab's descriptor lives at offset 0 of its own buddy-allocated block.
//! Because every slab is naturally aligned to its own size, `p & ~(slab_size
//! - 1)` recovers the descriptor for any object pointer `p` inside it — the
//! O(1) reverse lookup the cache and the `kmalloc`/`kfree` façade rely on.

pub mod cache;

use core::mem::size_of;

use cache::Cache;

/// Sentinel used by both the slab list links and `next_free`: "no slab" /
/// "no known free slot".
pub(crate) const LIST_END: usize = usize::MAX;
pub(crate) const NO_HINT: usize = usize::MAX;

#[repr(C)]
pub(crate) struct SlabHeader {
    /// Back-reference to the owning cache; also the self-authenticating tag
    /// `kfree` uses to confirm a guessed slab boundary actually belongs to
    /// the size-class cache it's checking against.
    pub cache: *const Cache,
    pub order: u8,
    pub free_count: u32,
    /// Hint index of a free object; always re-validated against the bitmap
    /// before use, never trusted on its own.
    pub next_free: usize,
    /// Absolute address of this slab's object area (varies per-slab once
    /// color rotation is in play, so it cannot be a cache-wide constant).
    pub obj_area: usize,
    pub next: usize,
    pub prev: usize,
}

pub(crate) fn bitmap_bytes(obj_count: usize) -> usize {
    (obj_count + 7) / 8
}

/// Header size including the trailing bitmap, rounded up to 8 bytes so the
/// object area that follows starts at an 8-byte boundary.
pub(crate) fn header_size_aligned(obj_count: usize) -> usize {
    let raw = size_of::<SlabHeader>() + bitmap_bytes(obj_count);
    (raw + 7) & !7
}

unsafe fn bitmap_ptr(slab_addr: usize) -> *mut u8 {
    (slab_addr + size_of::<SlabHeader>()) as *mut u8
}

pub(crate) unsafe fn bit_get(slab_addr: usize, index: usize) -> bool {
    let byte = *bitmap_ptr(slab_addr).add(index / 8);
    (byte >> (index % 8)) & 1 != 0
}

pub(crate) unsafe fn bit_set(slab_addr: usize, index: usize) {
    let ptr = bitmap_ptr(slab_addr).add(index / 8);
    *ptr |= 1 << (index % 8);
}

pub(crate) unsafe fn bit_clear(slab_addr: usize, index: usize) {
    let ptr = bitmap_ptr(slab_addr).add(index / 8);
    *ptr &= !(1 << (index % 8));
}
