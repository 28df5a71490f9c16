//! The allocator's closed set of sticky error codes.
//!
//! Bad frees are recorded, not raised: panicking in a kernel free path
//! cascades, so a cache's last error is set here and polled via
//! `kmem_cache_error` instead of propagated through a `Result`.

/// Sticky per-cache error status. `Ok` is the all-clear value; every other
/// variant names one of the closed set of conditions the cache detects in
/// its own alloc/free bookkeeping.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    /// No block of the requested order was available from the buddy.
    BuddyExhausted = 1,
    /// `next_free` disagreed with the bitmap and no free slot could be found.
    BadFreeIndex = 2,
    /// `kmem_cache_free` was called with an object belonging to a different cache.
    WrongCache = 3,
    /// Free index out of range, or the bitmap bit was already clear.
    DoubleOrBadFree = 4,
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Ok
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::BuddyExhausted => "buddy exhausted",
            ErrorCode::BadFreeIndex => "bad free index",
            ErrorCode::WrongCache => "wrong cache",
            ErrorCode::DoubleOrBadFree => "double or bad free",
        };
        f.write_str(s)
    }
}
