//! Per-object-type cache: three slab lists, a lock, counters, color
//! rotation, and the constructor/destructor pairing a Bonwick slab
//! guarantees ("always constructed", even while free).

use core::cell::UnsafeCell;
use core::mem::size_of;

use spin::Mutex;

use crate::buddy::BuddyAllocator;
use crate::config::{BLOCK_SIZE, CACHE_NAME_MAX, MIN_OBJS_PER_SLAB};
use crate::error::ErrorCode;
use crate::slab::{
    bit_clear, bit_get, bit_set, bitmap_bytes, header_size_aligned, SlabHeader, LIST_END, NO_HINT,
};

/// Constructor/destructor hook: `(object_pointer, object_size)`. Invoked on
/// every object slot at slab creation (ctor) and at cache teardown (dtor);
/// re-invoked on an object's ctor when it is freed, to preserve the
/// "always constructed, even while free" invariant.
pub type Ctor = fn(*mut u8, usize);
pub type Dtor = fn(*mut u8, usize);

#[derive(Clone, Copy, PartialEq, Eq)]
enum List {
    Partial,
    Full,
    Free,
}

struct CacheState {
    partial: usize,
    full: usize,
    free: usize,
    slab_count: usize,
    free_objs: usize,
    alloc_count: u64,
    free_count_total: u64,
    color_next: usize,
    grown_since_shrink: bool,
    error: ErrorCode,
}

impl CacheState {
    fn head(&self, list: List) -> usize {
        match list {
            List::Partial => self.partial,
            List::Full => self.full,
            List::Free => self.free,
        }
    }

    fn set_head(&mut self, list: List, addr: usize) {
        match list {
            List::Partial => self.partial = addr,
            List::Full => self.full = addr,
            List::Free => self.free = addr,
        }
    }
}

pub struct Cache {
    name: [u8; CACHE_NAME_MAX],
    name_len: u8,
    obj_size: usize,
    ctor: Option<Ctor>,
    dtor: Option<Dtor>,
    slab_order: usize,
    obj_per_slab: usize,
    color_max: usize,
    state: Mutex<CacheState>,
    /// Link in the global cache registry. Mutated only while the registry
    /// lock is held by the caller (see `registry.rs`); never touched under
    /// `state`.
    registry_next: UnsafeCell<*mut Cache>,
}

// `registry_next` is only ever mutated by a caller already holding the
// registry lock; `state` carries its own lock for everything else.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Builds a cache descriptor inside a freshly buddy-allocated order-0
    /// block. Does not link it into any registry — that happens under the
    /// registry lock, which this call never touches (see `4.3 Creation` and
    /// the lock-ordering rule: cache creation must not hold the registry
    /// lock while doing buddy work).
    pub(crate) fn create(
        buddy: &Mutex<BuddyAllocator>,
        max_buddy_order: usize,
        name: &str,
        obj_size: usize,
        ctor: Option<Ctor>,
        dtor: Option<Dtor>,
    ) -> Option<core::ptr::NonNull<Cache>> {
        if obj_size == 0 {
            return None;
        }
        let obj_size = (obj_size + 7) & !7;
        if header_size_aligned(1) + obj_size > (BLOCK_SIZE << max_buddy_order) {
            return None;
        }
        let (slab_order, obj_per_slab, color_max) = Self::compute_layout(obj_size, max_buddy_order);

        let desc_addr = buddy.lock().alloc(0)?;

        let mut name_buf = [0u8; CACHE_NAME_MAX];
        let bytes = name.as_bytes();
        let len = bytes.len().min(CACHE_NAME_MAX);
        name_buf[..len].copy_from_slice(&bytes[..len]);

        let cache = Cache {
            name: name_buf,
            name_len: len as u8,
            obj_size,
            ctor,
            dtor,
            slab_order,
            obj_per_slab,
            color_max,
            state: Mutex::new(CacheState {
                partial: LIST_END,
                full: LIST_END,
                free: LIST_END,
                slab_count: 0,
                free_objs: 0,
                alloc_count: 0,
                free_count_total: 0,
                color_next: 0,
                grown_since_shrink: false,
                error: ErrorCode::Ok,
            }),
            registry_next: UnsafeCell::new(core::ptr::null_mut()),
        };

        unsafe {
            core::ptr::write(desc_addr as *mut Cache, cache);
            Some(core::ptr::NonNull::new_unchecked(desc_addr as *mut Cache))
        }
    }

    /// Finds the smallest `slab_order` holding at least `MIN_OBJS_PER_SLAB`
    /// objects, falling back to the smallest order holding at least one, and
    /// the resulting `(obj_per_slab, color_max)`.
    fn compute_layout(obj_size: usize, max_buddy_order: usize) -> (usize, usize, usize) {
        let mut order = 0;
        loop {
            let slab_size = BLOCK_SIZE << order;
            let n = Self::max_objects_for(slab_size, obj_size);
            if n >= MIN_OBJS_PER_SLAB || order >= max_buddy_order {
                let n = n.max(1);
                let used = header_size_aligned(n) + n * obj_size;
                let waste = slab_size.saturating_sub(used);
                return (order, n, waste / 8);
            }
            order += 1;
        }
    }

    /// Largest `n` such that `header_size_aligned(n) + n * obj_size <=
    /// slab_size`; the header size itself depends on `n` through the
    /// bitmap, so this iterates down from the naive maximum rather than
    /// solving in closed form.
    fn max_objects_for(slab_size: usize, obj_size: usize) -> usize {
        let mut n = slab_size / obj_size;
        while n > 0 {
            if header_size_aligned(n) + n * obj_size <= slab_size {
                return n;
            }
            n -= 1;
        }
        0
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("<invalid>")
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    pub fn obj_per_slab(&self) -> usize {
        self.obj_per_slab
    }

    pub fn slab_order(&self) -> usize {
        self.slab_order
    }

    pub fn slab_count(&self) -> usize {
        self.state.lock().slab_count
    }

    pub fn free_objs(&self) -> usize {
        self.state.lock().free_objs
    }

    pub fn total_objs(&self) -> usize {
        self.state.lock().slab_count * self.obj_per_slab
    }

    pub(crate) fn registry_next(&self) -> *mut Cache {
        unsafe { *self.registry_next.get() }
    }

    pub(crate) fn set_registry_next(&self, next: *mut Cache) {
        unsafe { *self.registry_next.get() = next };
    }

    fn slab_base_for(&self, addr: usize) -> usize {
        let slab_size = BLOCK_SIZE << self.slab_order;
        addr & !(slab_size - 1)
    }

    /// O(1) pointer→cache check used by `kfree`'s size-class scan: masks
    /// `addr` to this cache's slab alignment and checks whether the
    /// resulting slab's back-pointer names this cache.
    pub(crate) fn owns(&self, addr: usize) -> bool {
        let slab_addr = self.slab_base_for(addr);
        let hdr = unsafe { &*(slab_addr as *const SlabHeader) };
        core::ptr::eq(hdr.cache, self as *const Cache)
    }

    fn alloc_slab(&self, cache_ptr: *const Cache, buddy: &Mutex<BuddyAllocator>, state: &mut CacheState) -> Option<usize> {
        let addr = buddy.lock().alloc(self.slab_order)?;
        let n = self.obj_per_slab;
        let hdr_size = header_size_aligned(n);
        let color_offset = state.color_next * 8;
        let obj_area = addr + hdr_size + color_offset;
        state.color_next = (state.color_next + 1) % (self.color_max + 1);

        unsafe {
            core::ptr::write_bytes((addr + size_of::<SlabHeader>()) as *mut u8, 0, bitmap_bytes(n));
            core::ptr::write(
                addr as *mut SlabHeader,
                SlabHeader {
                    cache: cache_ptr,
                    order: self.slab_order as u8,
                    free_count: n as u32,
                    next_free: 0,
                    obj_area,
                    next: LIST_END,
                    prev: LIST_END,
                },
            );
            if let Some(ctor) = self.ctor {
                for i in 0..n {
                    ctor((obj_area + i * self.obj_size) as *mut u8, self.obj_size);
                }
            }
        }

        state.slab_count += 1;
        state.free_objs += n;
        state.grown_since_shrink = true;
        Some(addr)
    }

    unsafe fn list_push(state: &mut CacheState, list: List, slab_addr: usize) {
        let head = state.head(list);
        let hdr = &mut *(slab_addr as *mut SlabHeader);
        hdr.next = head;
        hdr.prev = LIST_END;
        if head != LIST_END {
            (&mut *(head as *mut SlabHeader)).prev = slab_addr;
        }
        state.set_head(list, slab_addr);
    }

    unsafe fn list_remove(state: &mut CacheState, list: List, slab_addr: usize) {
        let hdr = &mut *(slab_addr as *mut SlabHeader);
        if hdr.prev != LIST_END {
            (&mut *(hdr.prev as *mut SlabHeader)).next = hdr.next;
        } else {
            state.set_head(list, hdr.next);
        }
        if hdr.next != LIST_END {
            (&mut *(hdr.next as *mut SlabHeader)).prev = hdr.prev;
        }
        hdr.next = LIST_END;
        hdr.prev = LIST_END;
    }

    pub fn alloc(&self, buddy: &Mutex<BuddyAllocator>) -> Option<*mut u8> {
        let cache_ptr = self as *const Cache;
        let mut state = self.state.lock();

        let slab_addr = if state.partial != LIST_END {
            state.partial
        } else if state.free != LIST_END {
            let addr = state.free;
            unsafe {
                Self::list_remove(&mut state, List::Free, addr);
                Self::list_push(&mut state, List::Partial, addr);
            }
            addr
        } else {
            match self.alloc_slab(cache_ptr, buddy, &mut state) {
                Some(addr) => {
                    unsafe { Self::list_push(&mut state, List::Partial, addr) };
                    addr
                }
                None => {
                    state.error = ErrorCode::BuddyExhausted;
                    return None;
                }
            }
        };

        let hdr = unsafe { &mut *(slab_addr as *mut SlabHeader) };
        let mut index = hdr.next_free;
        let hint_valid = index < self.obj_per_slab && !unsafe { bit_get(slab_addr, index) };
        if !hint_valid {
            match (0..self.obj_per_slab).find(|&i| !unsafe { bit_get(slab_addr, i) }) {
                Some(i) => index = i,
                None => {
                    state.error = ErrorCode::BadFreeIndex;
                    return None;
                }
            }
        }

        unsafe { bit_set(slab_addr, index) };
        hdr.free_count -= 1;
        state.free_objs -= 1;
        state.alloc_count += 1;

        hdr.next_free = (1..=self.obj_per_slab)
            .map(|offset| (index + offset) % self.obj_per_slab)
            .find(|&i| !unsafe { bit_get(slab_addr, i) })
            .unwrap_or(NO_HINT);

        if hdr.free_count == 0 {
            unsafe {
                Self::list_remove(&mut state, List::Partial, slab_addr);
                Self::list_push(&mut state, List::Full, slab_addr);
            }
        }

        Some((hdr.obj_area + index * self.obj_size) as *mut u8)
    }

    pub fn free(&self, buddy: &Mutex<BuddyAllocator>, obj: *mut u8) {
        if obj.is_null() {
            return;
        }
        let addr = obj as usize;
        let slab_addr = self.slab_base_for(addr);

        let mut state = self.state.lock();
        let hdr = unsafe { &mut *(slab_addr as *mut SlabHeader) };

        if !core::ptr::eq(hdr.cache, self as *const Cache) {
            state.error = ErrorCode::WrongCache;
            log::warn!("cache '{}': free of object {:#x} from a different cache", self.name(), addr);
            return;
        }

        if addr < hdr.obj_area || (addr - hdr.obj_area) % self.obj_size != 0 {
            state.error = ErrorCode::DoubleOrBadFree;
            return;
        }
        let index = (addr - hdr.obj_area) / self.obj_size;
        if index >= self.obj_per_slab || !unsafe { bit_get(slab_addr, index) } {
            state.error = ErrorCode::DoubleOrBadFree;
            log::warn!("cache '{}': bad or double free at {:#x}", self.name(), addr);
            return;
        }

        let was_full = hdr.free_count == 0;
        unsafe { bit_clear(slab_addr, index) };
        hdr.free_count += 1;
        state.free_objs += 1;
        state.free_count_total += 1;
        if hdr.next_free == NO_HINT || index < hdr.next_free {
            hdr.next_free = index;
        }

        if let Some(ctor) = self.ctor {
            ctor((hdr.obj_area + index * self.obj_size) as *mut u8, self.obj_size);
        }

        if hdr.free_count as usize == self.obj_per_slab {
            unsafe {
                Self::list_remove(&mut state, List::Partial, slab_addr);
                Self::list_push(&mut state, List::Free, slab_addr);
            }
        } else if was_full {
            unsafe {
                Self::list_remove(&mut state, List::Full, slab_addr);
                Self::list_push(&mut state, List::Partial, slab_addr);
            }
        }
    }

    /// Returns 0 without draining anything if the cache grew since the last
    /// shrink (hysteresis, so a cache isn't immediately punished for the
    /// slab it just had to create). Otherwise returns every free slab to the
    /// buddy and reports how many base blocks were released.
    pub fn shrink(&self, buddy: &Mutex<BuddyAllocator>) -> usize {
        let mut state = self.state.lock();
        if state.grown_since_shrink {
            state.grown_since_shrink = false;
            return 0;
        }

        let mut freed = 0usize;
        while state.free != LIST_END {
            let slab_addr = state.free;
            unsafe { Self::list_remove(&mut state, List::Free, slab_addr) };
            self.destroy_empty_slab(slab_addr, &mut state);
            buddy.lock().free(slab_addr, self.slab_order);
            freed += 1usize << self.slab_order;
        }
        freed
    }

    pub(crate) fn destroy(&self, buddy: &Mutex<BuddyAllocator>) {
        let mut state = self.state.lock();
        while state.free != LIST_END {
            let addr = state.free;
            unsafe { Self::list_remove(&mut state, List::Free, addr) };
            self.destroy_empty_slab(addr, &mut state);
            buddy.lock().free(addr, self.slab_order);
        }
        while state.partial != LIST_END {
            let addr = state.partial;
            unsafe { Self::list_remove(&mut state, List::Partial, addr) };
            self.destroy_used_slab(addr, &mut state);
            buddy.lock().free(addr, self.slab_order);
        }
        while state.full != LIST_END {
            let addr = state.full;
            unsafe { Self::list_remove(&mut state, List::Full, addr) };
            self.destroy_used_slab(addr, &mut state);
            buddy.lock().free(addr, self.slab_order);
        }
        log::info!("cache '{}' destroyed", self.name());
    }

    /// All objects in an empty slab are free, and every one of them is
    /// still in constructed state (the ctor ran on all of them in
    /// `alloc_slab` and none has been torn down since) — run the
    /// destructor on every slot.
    fn destroy_empty_slab(&self, slab_addr: usize, state: &mut CacheState) {
        let hdr = unsafe { &*(slab_addr as *const SlabHeader) };
        if let Some(dtor) = self.dtor {
            for i in 0..self.obj_per_slab {
                dtor((hdr.obj_area + i * self.obj_size) as *mut u8, self.obj_size);
            }
        }
        state.slab_count -= 1;
        state.free_objs -= self.obj_per_slab;
    }

    /// A partial or full slab's destructor pass only covers currently
    /// allocated (bitmap-set) objects.
    fn destroy_used_slab(&self, slab_addr: usize, state: &mut CacheState) {
        let hdr = unsafe { &*(slab_addr as *const SlabHeader) };
        if let Some(dtor) = self.dtor {
            for i in 0..self.obj_per_slab {
                if unsafe { bit_get(slab_addr, i) } {
                    dtor((hdr.obj_area + i * self.obj_size) as *mut u8, self.obj_size);
                }
            }
        }
        state.slab_count -= 1;
        state.free_objs -= hdr.free_count as usize;
    }

    pub fn info(&self) {
        let state = self.state.lock();
        let total = state.slab_count * self.obj_per_slab;
        let usage_pct = if total == 0 { 0 } else { (total - state.free_objs) * 100 / total };
        log::info!(
            "cache '{}': obj_size={}B slab_size={}blk slabs={} objs/slab={} usage={}% allocs={} frees={} colors={}",
            self.name(),
            self.obj_size,
            1usize << self.slab_order,
            state.slab_count,
            self.obj_per_slab,
            usage_pct,
            state.alloc_count,
            state.free_count_total,
            self.color_max + 1,
        );
    }

    /// Returns the sticky error and clears it: a caller that has just
    /// observed a fault is assumed to have handled it, so a second
    /// unconditional read does not keep re-reporting a stale one.
    pub fn error(&self) -> ErrorCode {
        let mut state = self.state.lock();
        let err = state.error;
        if err != ErrorCode::Ok {
            log::warn!("cache '{}': {}", self.name(), err);
        }
        state.error = ErrorCode::Ok;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;

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

    fn make_cache(buddy: &Mutex<BuddyAllocator>, name: &str, size: usize, ctor: Option<Ctor>, dtor: Option<Dtor>) -> core::ptr::NonNull<Cache> {
        let max_order = buddy.lock().max_order();
        Cache::create(buddy, max_order, name, size, ctor, dtor).expect("cache create")
    }

    /// S1: basic alloc/free cycle.
    #[test]
    fn scenario_s1_basic_alloc_free_cycle() {
        let buddy = make_buddy(64);
        let cache = unsafe { make_cache(&buddy, "T", 40, None, None).as_ref() };

        let p = cache.alloc(&buddy);
        assert!(p.is_some());
        let n = cache.obj_per_slab();
        assert!(n >= 4);
        assert_eq!(cache.slab_count(), 1);
        assert_eq!(cache.free_objs(), n - 1);

        cache.free(&buddy, p.unwrap());
        assert_eq!(cache.free_objs(), n);

        // First shrink call after the growth above is hysteresis-blocked.
        assert_eq!(cache.shrink(&buddy), 0);
        assert_eq!(cache.slab_count(), 1);
        // Second call, with nothing grown since, actually drains.
        assert!(cache.shrink(&buddy) >= 1);
        assert_eq!(cache.slab_count(), 0);
    }

    /// S2: constructor invariants — objects come back pre-constructed both
    /// on first allocation and after a free/re-alloc cycle.
    #[test]
    fn scenario_s2_constructor_invariants() {
        fn ctor(ptr: *mut u8, size: usize) {
            unsafe { core::ptr::write_bytes(ptr, 0xA5, size) };
        }

        let buddy = make_buddy(16);
        let cache = unsafe { make_cache(&buddy, "C2", 7, Some(ctor), None).as_ref() };

        let p = cache.alloc(&buddy).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p, 7) };
        assert_eq!(bytes, &[0xA5u8; 7]);

        cache.free(&buddy, p);
        let p2 = cache.alloc(&buddy).unwrap();
        let bytes2 = unsafe { core::slice::from_raw_parts(p2, 7) };
        assert_eq!(bytes2, &[0xA5u8; 7]);
    }

    /// S3: wrong-cache detection.
    #[test]
    fn scenario_s3_wrong_cache_detection() {
        let buddy = make_buddy(16);
        let a = unsafe { make_cache(&buddy, "A", 16, None, None).as_ref() };
        let b = unsafe { make_cache(&buddy, "B", 64, None, None).as_ref() };

        let p = a.alloc(&buddy).unwrap();
        b.free(&buddy, p);
        assert_eq!(b.error(), ErrorCode::WrongCache);

        let a_free_before = a.free_objs();
        a.free(&buddy, p);
        assert_eq!(a.free_objs(), a_free_before + 1);
        assert_eq!(a.error(), ErrorCode::Ok);
    }

    /// S4: slab promotion/demotion across full -> partial -> free.
    #[test]
    fn scenario_s4_slab_promotion_demotion() {
        let buddy = make_buddy(16);
        let cache = unsafe { make_cache(&buddy, "S4", 64, None, None).as_ref() };
        let n = cache.obj_per_slab();

        let mut ptrs = vec![];
        for _ in 0..n {
            ptrs.push(cache.alloc(&buddy).unwrap());
        }
        assert_eq!(cache.free_objs(), 0);

        let first = ptrs.pop().unwrap();
        cache.free(&buddy, first);
        assert_eq!(cache.free_objs(), 1);

        for p in ptrs {
            cache.free(&buddy, p);
        }
        assert_eq!(cache.free_objs(), n);
        assert_eq!(cache.slab_count(), 1);
    }

    #[test]
    fn double_free_is_recorded_not_fatal() {
        let buddy = make_buddy(16);
        let cache = unsafe { make_cache(&buddy, "DF", 32, None, None).as_ref() };
        let p = cache.alloc(&buddy).unwrap();
        cache.free(&buddy, p);
        cache.free(&buddy, p);
        assert_eq!(cache.error(), ErrorCode::DoubleOrBadFree);
    }

    /// A cache whose objects force `slab_order > 0` must report shrunk
    /// memory in base blocks, not in slabs.
    #[test]
    fn shrink_reports_base_blocks_not_slab_count() {
        let buddy = make_buddy(16);
        let cache = unsafe { make_cache(&buddy, "BIG", 2000, None, None).as_ref() };
        assert_eq!(cache.slab_order(), 1);

        let p = cache.alloc(&buddy).unwrap();
        cache.free(&buddy, p);

        assert_eq!(cache.shrink(&buddy), 0); // hysteresis-blocked right after growth
        assert_eq!(cache.shrink(&buddy), 1usize << cache.slab_order());
    }

    /// An object that cannot fit in even one `max_buddy_order` slab must be
    /// rejected at creation rather than silently overrunning the slab.
    #[test]
    fn create_rejects_object_too_large_for_max_order() {
        let buddy = make_buddy(1); // max_order == 0, slab_size == BLOCK_SIZE
        let max_order = buddy.lock().max_order();
        let too_big = Cache::create(&buddy, max_order, "HUGE", 5000, None, None);
        assert!(too_big.is_none());
    }

    #[test]
    fn invariant_total_and_free_objs_consistent() {
        let buddy = make_buddy(32);
        let cache = unsafe { make_cache(&buddy, "INV", 48, None, None).as_ref() };
        let n = cache.obj_per_slab();

        let mut ptrs = vec![];
        for _ in 0..(n * 2 + 1) {
            ptrs.push(cache.alloc(&buddy).unwrap());
        }
        assert_eq!(cache.total_objs(), cache.slab_count() * n);
        for p in ptrs {
            cache.free(&buddy, p);
        }
        assert_eq!(cache.free_objs(), cache.total_objs());
    }
}
