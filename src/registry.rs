//! Global cache registry and the `kmalloc`/`kfree` size-class façade.
//!
//! Lock ordering is strict and one-directional: registry lock -> cache lock
//! -> buddy lock. The registry lock is only ever held to link or unlink a
//! cache descriptor; it is released before any buddy work happens, both
//! because cache creation re-acquires it internally (holding it across the
//! call would self-deadlock) and because the lock-ordering rule forbids
//! holding a lower lock's work under a higher one regardless.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

use crate::buddy::BuddyAllocator;
use crate::config::{SIZE_CLASS_COUNT, SIZE_CLASS_MAX_SHIFT, SIZE_CLASS_MIN_SHIFT};
use crate::slab::cache::{Cache, Ctor, Dtor};

pub struct Registry {
    cache_head: Mutex<*mut Cache>,
    /// One slot per power-of-two size class. A slot transitions from null to
    /// non-null exactly once and is never cleared thereafter: once a cache
    /// is published here, `kfree` may be scanning it from any thread without
    /// the registry lock, relying on that monotonicity.
    size_classes: [AtomicPtr<Cache>; SIZE_CLASS_COUNT],
}

// `cache_head` carries its own lock. `size_classes` entries are mutated only
// via compare-and-swap from null, so concurrent access to the array itself
// is sound without an external lock.
unsafe impl Sync for Registry {}

impl Registry {
    pub const fn new() -> Self {
        Self {
            cache_head: Mutex::new(core::ptr::null_mut()),
            size_classes: [const { AtomicPtr::new(core::ptr::null_mut()) }; SIZE_CLASS_COUNT],
        }
    }

    pub fn create_cache(
        &self,
        buddy: &Mutex<BuddyAllocator>,
        max_buddy_order: usize,
        name: &str,
        obj_size: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
    ) -> Option<NonNull<Cache>> {
        let handle = Cache::create(buddy, max_buddy_order, name, obj_size, ctor, dtor)?;

        let mut head = self.cache_head.lock();
        unsafe { handle.as_ref().set_registry_next(*head) };
        *head = handle.as_ptr();
        drop(head);

        log::info!("registry: cache '{}' created (obj_size={}B)", name, obj_size);
        Some(handle)
    }

    pub fn destroy_cache(&self, buddy: &Mutex<BuddyAllocator>, cache: NonNull<Cache>) {
        let target = cache.as_ptr();
        {
            let mut head = self.cache_head.lock();
            if *head == target {
                *head = unsafe { cache.as_ref().registry_next() };
            } else {
                let mut cur = *head;
                while !cur.is_null() {
                    let next = unsafe { (&*cur).registry_next() };
                    if next == target {
                        unsafe { (&*cur).set_registry_next(cache.as_ref().registry_next()) };
                        break;
                    }
                    cur = next;
                }
            }
        }

        unsafe { cache.as_ref().destroy(buddy) };
        buddy.lock().free(target as usize, 0);
    }

    fn index_for_size(n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let mut shift = SIZE_CLASS_MIN_SHIFT;
        while shift <= SIZE_CLASS_MAX_SHIFT {
            if (1usize << shift) >= n {
                return Some((shift - SIZE_CLASS_MIN_SHIFT) as usize);
            }
            shift += 1;
        }
        None
    }

    pub fn kmalloc(&self, buddy: &Mutex<BuddyAllocator>, max_buddy_order: usize, n: usize) -> Option<*mut u8> {
        let idx = Self::index_for_size(n)?;

        let existing = self.size_classes[idx].load(Ordering::Acquire);
        let cache_ptr = if !existing.is_null() {
            existing
        } else {
            let mut head = self.cache_head.lock();
            let still_empty = self.size_classes[idx].load(Ordering::Acquire).is_null();
            drop(head);

            if !still_empty {
                self.size_classes[idx].load(Ordering::Acquire)
            } else {
                let class_bytes = 1usize << (SIZE_CLASS_MIN_SHIFT + idx as u32);
                let mut name_buf = [0u8; 16];
                let name = format_size_class_name(&mut name_buf, class_bytes);
                let handle = self.create_cache(buddy, max_buddy_order, name, class_bytes, None, None)?;

                match self.size_classes[idx].compare_exchange(
                    core::ptr::null_mut(),
                    handle.as_ptr(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => handle.as_ptr(),
                    Err(winner) => {
                        // Lost the race to publish; the cache just built is
                        // an orphan rather than a leak, so tear it down.
                        self.destroy_cache(buddy, handle);
                        winner
                    }
                }
            }
        };

        let cache = unsafe { &*cache_ptr };
        cache.alloc(buddy)
    }

    pub fn kfree(&self, buddy: &Mutex<BuddyAllocator>, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let addr = p as usize;
        for slot in self.size_classes.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let cache = unsafe { &*ptr };
            if cache.owns(addr) {
                cache.free(buddy, p);
                return;
            }
        }
        log::warn!("kfree: no owning size-class cache found for {:#x}", addr);
    }
}

/// Formats `"size-<bytes>"` into a fixed stack buffer — no heap, so no
/// `alloc::format!`.
fn format_size_class_name(buf: &mut [u8; 16], bytes: usize) -> &str {
    use core::fmt::Write;

    struct Cursor<'a> {
        buf: &'a mut [u8],
        len: usize,
    }

    impl<'a> Write for Cursor<'a> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let b = s.as_bytes();
            let end = self.len + b.len();
            if end > self.buf.len() {
                return Err(core::fmt::Error);
            }
            self.buf[self.len..end].copy_from_slice(b);
            self.len = end;
            Ok(())
        }
    }

    let len = {
        let mut cursor = Cursor { buf, len: 0 };
        let _ = write!(cursor, "size-{}", bytes);
        cursor.len
    };
    core::str::from_utf8(&buf[..len]).unwrap_or("size-class")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;

    use crate::config::BLOCK_SIZE;

    fn make_buddy(blocks: usize) -> Mutex<BuddyAllocator> {
        let region = vec![0u8; blocks * BLOCK_SIZE].into_boxed_slice();
        let leaked: &'static mut [u8] = Box::leak(region);
        let start = leaked.as_ptr() as usize;
        let mut allocator = BuddyAllocator::new();
        unsafe {
            allocator.init(start, blocks * BLOCK_SIZE);
        }
        Mutex::new(allocator)
    }

    /// S5: size-class dispatch.
    #[test]
    fn scenario_s5_size_class_dispatch() {
        let buddy = make_buddy(64);
        let registry = Registry::new();
        let max_order = buddy.lock().max_order();

        let p = registry.kmalloc(&buddy, max_order, 50).unwrap();
        // Smallest 2^k >= 50 with k >= SIZE_CLASS_MIN_SHIFT is 64.
        let idx64 = Registry::index_for_size(64).unwrap();
        assert!(!registry.size_classes[idx64].load(Ordering::Acquire).is_null());

        registry.kfree(&buddy, p);

        let q = registry.kmalloc(&buddy, max_order, 8).unwrap();
        // Minimum class is 32 bytes.
        let idx32 = Registry::index_for_size(8).unwrap();
        assert_eq!(idx32, 0);
        assert!(!registry.size_classes[idx32].load(Ordering::Acquire).is_null());
        registry.kfree(&buddy, q);
    }

    #[test]
    fn kfree_kmalloc_round_trip_no_leak_of_last_object() {
        let buddy = make_buddy(64);
        let registry = Registry::new();
        let max_order = buddy.lock().max_order();

        let p = registry.kmalloc(&buddy, max_order, 100).unwrap();
        registry.kfree(&buddy, p);
        let q = registry.kmalloc(&buddy, max_order, 100);
        assert!(q.is_some());
    }

    #[test]
    fn index_for_size_bounds() {
        assert_eq!(Registry::index_for_size(0), None);
        assert_eq!(Registry::index_for_size(1), Some(0));
        assert_eq!(Registry::index_for_size(32), Some(0));
        assert_eq!(Registry::index_for_size(33), Some(1));
        assert_eq!(Registry::index_for_size(1 << 17), Some(SIZE_CLASS_COUNT - 1));
        assert_eq!(Registry::index_for_size((1 << 17) + 1), None);
    }
}
