//! Segregated-fit memory allocator for a growable heap region
//!
//! This crate provides a classic `malloc`-style allocator built from two
//! layers. The inner layer is [`Heap`]: a single-threaded allocator that
//! manages one contiguous [`Region`] of memory and offers the traditional
//! triple of operations (allocate, free, reallocate). The outer layer is
//! [`Allocator`], which wraps a [`Heap`] over a fixed-size [`Arena`] in a
//! spin lock and implements [`core::alloc::GlobalAlloc`], so it can serve as
//! the global allocator of a `#![no_std]` binary:
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segalloc::Allocator<65536> = segalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//!
//! # Heap layout
//! All bookkeeping lives inside the managed region itself. Every block is
//! bracketed by a 4-byte header and a 4-byte footer holding the same
//! `(size, allocated)` word, the classical *boundary tags*: the footer of a
//! block is the word directly below the header of the next one, so both
//! physical neighbors of a block can be found in constant time. Free blocks
//! additionally carry two offset words at the start of their payload,
//! threading them into one of 16 doubly-linked *segregated free lists*, one
//! per size class. The bottom of the region holds the 16 list heads; two
//! sentinel blocks (an allocated minimal block below the first real block
//! and a zero-size allocated header at the very top) spare the coalescing
//! code every boundary special case.
//!
//! All links are 32-bit offsets from the region base rather than pointers:
//! offset 0 falls into the list-head table, never on a block, and doubles as
//! the null link.
//!
//! # A short walk through the algorithm
//! 1.  An allocation request of `n` bytes is rounded up to a multiple of 8
//!     and gets 8 bytes of tag overhead. The sized-up request selects a size
//!     class, and the lists are searched from that class upwards, first fit
//!     within a class. The smallest classes hold exactly one size each, so
//!     for the common small request the "search" is just popping a head.
//! 2.  If every list misses, the region is grown (by at least 4 KiB) and
//!     the fresh bytes become a free block at the top of the heap.
//! 3.  The chosen block is split if the remainder could stand as a block of
//!     its own (16 bytes). Small requests keep the bottom of the split;
//!     requests above [`BIG_SIZE`] take the top instead, so that long-lived
//!     large blocks accumulate at the top of the heap while the small-block
//!     churn stays densely packed at the bottom.
//! 4.  Freeing a block consults the two neighbor tags and merges with
//!     whichever of them is free; the merged block is pushed (LIFO) onto the
//!     list of its class. No two adjacent free blocks ever exist, so
//!     fragmentation stays bounded by the split policy alone.
//! 5.  Reallocation avoids the copy whenever it can: shrink requests split
//!     the block in place, and growth requests first try to absorb a free
//!     successor, then to grow the region when the block sits at the top of
//!     the heap. Only a walled-in block is moved.
//!
//! # Limits
//! The heap hands out 8-byte-aligned payloads and supports no stronger
//! alignment: the [`GlobalAlloc`] implementation answers requests with
//! `align > 8` with a null pointer. Blocks are tracked with 32-bit offsets,
//! capping a region at 4 GiB. The [`Heap`] itself is strictly
//! single-threaded; only the [`Allocator`] wrapper is shareable.
#![no_std]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod heap;

#[cfg(all(feature = "sbrk", unix))]
pub use heap::region::SystemBreak;
pub use heap::region::{Arena, Region};
pub use heap::{Corruption, Heap, OutOfMemory};
pub use heap::{ALIGNMENT, BIG_SIZE, CHUNK, CLASS_COUNT, INIT_CHUNK, MIN_BLOCK, REALLOC_CHUNK};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

/// A lockable, fixed-capacity allocator suitable as `#[global_allocator]`.
///
/// This is a [`Heap`] over an [`Arena`] of `N` bytes behind a `spin::Mutex`.
/// The arena is part of the value, so a `static` allocator owns its whole
/// heap and the memory usage is bounded at compile time. Construction is
/// `const` and writes nothing; the heap sets itself up on the first
/// allocation.
///
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segalloc::Allocator<65536> = segalloc::Allocator::new();
/// ```
///
/// Requests with an alignment above 8 are not supported and answered with a
/// null pointer.
pub struct Allocator<const N: usize> {
    /// The heap, protected by a spin lock to make it usable through the
    /// shared references [`GlobalAlloc`] hands out.
    heap: spin::Mutex<Heap<Arena<N>>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// # Panics
    /// This function will panic if the arena size `N` is less than `144`
    /// (the setup overhead plus the initial free block) or not divisible
    /// by 8.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= 144, "too small heap memory: minimum size is 144");
        assert!(N % 8 == 0, "memory size has to be divisible by 8");
        Self {
            heap: spin::Mutex::new(Heap::new(Arena::new())),
        }
    }
}

// SAFETY: the implementation does not unwind, returns 8-aligned (or null)
// pointers and never hands out a block twice; layouts with a stronger
// alignment than 8 are consistently refused with null.
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT as usize {
            return ptr::null_mut();
        }
        match self.heap.lock().alloc(layout.size()) {
            Some(payload) => payload.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `GlobalAlloc` guarantees `ptr` came from `alloc` on
            // this allocator and is not used afterwards.
            unsafe { self.heap.lock().free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT as usize {
            return ptr::null_mut();
        }
        // SAFETY: `GlobalAlloc` guarantees `ptr` came from `alloc` on this
        // allocator; on failure the heap leaves the old block untouched,
        // which is what the `realloc` contract demands.
        match unsafe { self.heap.lock().realloc(NonNull::new(ptr), new_size) } {
            Some(payload) => payload.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
