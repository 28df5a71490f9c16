//! Compile-time configuration constants.
//!
//! These are plain constants rather than a Cargo feature or build-script
//! surface: there is exactly one way to build this crate, unlike the
//! optional-subsystem feature matrix a full kernel carries.

/// Size of the smallest unit the buddy allocator manages.
pub const BLOCK_SIZE: usize = 4096;

/// Smallest buddy order. Blocks below this order are never produced.
pub const MIN_ORDER: usize = 0;

/// Largest buddy order a region may be partitioned into.
pub const MAX_ORDER: usize = 15;

/// A slab's `slab_order` is chosen so it holds at least this many objects,
/// falling back to the smallest order that holds at least one.
pub const MIN_OBJS_PER_SLAB: usize = 4;

/// `kmalloc` serves sizes from `2^SIZE_CLASS_MIN_SHIFT` bytes...
pub const SIZE_CLASS_MIN_SHIFT: u32 = 5;

/// ...up to `2^SIZE_CLASS_MAX_SHIFT` bytes.
pub const SIZE_CLASS_MAX_SHIFT: u32 = 17;

/// Number of power-of-two size classes in `[MIN_SHIFT, MAX_SHIFT]`.
pub const SIZE_CLASS_COUNT: usize = (SIZE_CLASS_MAX_SHIFT - SIZE_CLASS_MIN_SHIFT + 1) as usize;

/// Maximum length of a cache name, not counting any terminator.
pub const CACHE_NAME_MAX: usize = 31;
