#![cfg_attr(not(any(test, feature = "std")), no_std)]
//! Two-layer kernel allocator: a binary buddy block allocator managing a
//! contiguous region of 4 KiB blocks, and a Bonwick-style slab cache manager
//! layered on top, exposed both as per-type caches (`kmem_cache_*`) and as a
//! generic `kmalloc`/`kfree` size-class façade built from power-of-two
//! caches.
//!
//! The surrounding kernel — process table, page tables, the real spinlock
//! primitive, user-copy routines — is out of scope; this crate only
//! specifies the allocator itself.

mod buddy;
mod config;
mod error;
mod registry;
mod slab;

use core::ptr::NonNull;

use spin::Mutex;

pub use buddy::BuddyAllocator;
pub use config::{
    BLOCK_SIZE, CACHE_NAME_MAX, MAX_ORDER, MIN_OBJS_PER_SLAB, MIN_ORDER, SIZE_CLASS_COUNT,
    SIZE_CLASS_MAX_SHIFT, SIZE_CLASS_MIN_SHIFT,
};
pub use error::ErrorCode;
pub use slab::cache::{Cache, Ctor, Dtor};

use registry::Registry;

static BUDDY: Mutex<BuddyAllocator> = Mutex::new(BuddyAllocator::new());
static REGISTRY: Registry = Registry::new();

/// Opaque handle to a live cache, standing in for the C `kmem_cache_t *`.
#[derive(Clone, Copy)]
pub struct CacheHandle(NonNull<Cache>);

unsafe impl Send for CacheHandle {}
unsafe impl Sync for CacheHandle {}

impl CacheHandle {
    fn cache(&self) -> &Cache {
        unsafe { self.0.as_ref() }
    }
}

/// Initializes the global buddy region backing every cache and the
/// `kmalloc` size classes. Not idempotent in the sense of preserving prior
/// state — it re-partitions whatever region it is given — but safe to call
/// exactly once at boot, which is the only supported use.
///
/// Returns the number of bytes actually placed under buddy management.
///
/// # Safety
/// `region_start` must address at least `region_size` bytes that this
/// process owns exclusively for as long as the allocator is in use; that
/// memory will be written through raw pointers by every subsequent
/// allocation.
pub unsafe fn kmem_init(region_start: usize, region_size: usize) -> usize {
    let placed = BUDDY.lock().init(region_start, region_size);
    log::info!("kmem_init: registry ready, {} bytes under buddy management", placed);
    placed
}

/// Creates a new per-type cache. `name` is truncated to `CACHE_NAME_MAX`
/// bytes; `size` is rounded up to an 8-byte multiple and must be non-zero.
pub fn kmem_cache_create(name: &str, size: usize, ctor: Option<Ctor>, dtor: Option<Dtor>) -> Option<CacheHandle> {
    let max_order = BUDDY.lock().max_order();
    REGISTRY
        .create_cache(&BUDDY, max_order, name, size, ctor, dtor)
        .map(CacheHandle)
}

pub fn kmem_cache_alloc(cache: CacheHandle) -> Option<*mut u8> {
    cache.cache().alloc(&BUDDY)
}

pub fn kmem_cache_free(cache: CacheHandle, obj: *mut u8) {
    cache.cache().free(&BUDDY, obj)
}

/// Returns the number of base blocks released, or 0 if the cache grew since
/// its last shrink (hysteresis).
pub fn kmem_cache_shrink(cache: CacheHandle) -> usize {
    cache.cache().shrink(&BUDDY)
}

/// Destroys a cache: drains every slab, running destructors on live (and,
/// for empty slabs, still-constructed) objects, and returns everything to
/// the buddy. The caller must not touch objects from this cache afterward.
pub fn kmem_cache_destroy(cache: CacheHandle) {
    REGISTRY.destroy_cache(&BUDDY, cache.0)
}

pub fn kmem_cache_info(cache: CacheHandle) {
    cache.cache().info()
}

/// Reads and clears the cache's sticky error.
pub fn kmem_cache_error(cache: CacheHandle) -> ErrorCode {
    cache.cache().error()
}

/// Allocates `n` bytes from the smallest power-of-two size class that fits.
pub fn kmalloc(n: usize) -> Option<*mut u8> {
    let max_order = BUDDY.lock().max_order();
    REGISTRY.kmalloc(&BUDDY, max_order, n)
}

/// Frees a pointer previously returned by `kmalloc`. Null-safe; logs and
/// returns if no size-class cache claims the pointer.
pub fn kfree(p: *mut u8) {
    REGISTRY.kfree(&BUDDY, p)
}
