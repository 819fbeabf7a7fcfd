//! The heap engine: block placement, splitting, coalescing and growth.
//!
//! A [`Heap`] manages a single [`Region`] as a run of contiguous blocks
//! bracketed by two sentinels. From the region base upwards:
//!
//! ```text
//! +------------------+---------+----------+- - - - - - - - -+----------+
//! | class-head table | padding | prologue |     blocks      | epilogue |
//! | 16 x 4 bytes     | 4 bytes | 8 bytes  | free/allocated  | 4 bytes  |
//! +------------------+---------+----------+- - - - - - - - -+----------+
//! ```
//!
//! The prologue is a permanently-allocated minimal block and the epilogue a
//! permanently-allocated header of size zero, so that coalescing never has
//! to special-case the ends of the heap. Growth moves the epilogue up and
//! turns the fresh bytes into a free block just below it.
mod buffer;
mod check;
mod free_list;
pub mod region;
mod tag;

pub use check::Corruption;
pub use free_list::CLASS_COUNT;

use buffer::{Block, HeapBuffer, DSIZE, WSIZE};
use free_list::class_of;
use region::Region;
use tag::Tag;

use core::ptr::NonNull;

/// Payloads (and block sizes) are aligned to this many bytes.
pub const ALIGNMENT: u32 = 8;
/// Smallest representable block: header, two list links, footer.
pub const MIN_BLOCK: u32 = 16;
/// Region growth used to seed the heap at initialization.
pub const INIT_CHUNK: u32 = 1 << 6;
/// Minimum region growth when an allocation misses all free lists.
pub const CHUNK: u32 = 1 << 12;
/// Minimum region growth when a reallocation grows the heap in place.
pub const REALLOC_CHUNK: u32 = 40;
/// Requests above this block size are placed at the top of a split.
///
/// Tuned empirically (as are [`REALLOC_CHUNK`] and the class cutoffs):
/// large blocks tend to be long-lived, and pushing them towards the top of
/// the heap keeps the small remainders densely packed near the bottom.
pub const BIG_SIZE: u32 = 108;

/// Byte size of the class-head table, already a multiple of [`ALIGNMENT`].
const TABLE_BYTES: u32 = align8(CLASS_COUNT as u32 * WSIZE);
/// Payload offset of the prologue sentinel.
const PROLOGUE: u32 = TABLE_BYTES + 2 * WSIZE;
/// Payload offset of the first real block; also the initial break after the
/// bootstrap growth (table, padding word, prologue, epilogue).
const FIRST_BLOCK: u32 = TABLE_BYTES + 4 * WSIZE;

/// The region could not supply the bytes needed to set up the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Round up to the next multiple of [`ALIGNMENT`].
const fn align8(size: u32) -> u32 {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// A segregated-fit heap over a growable memory [`Region`].
///
/// All four classic entry points are provided: [`init`](Self::init),
/// [`alloc`](Self::alloc), [`free`](Self::free) and
/// [`realloc`](Self::realloc). The heap itself is strictly single-threaded
/// (every operation takes `&mut self`); the crate-level
/// [`Allocator`](crate::Allocator) wraps one in a lock where a shared
/// handle is needed.
///
/// ```
/// use segalloc::{Arena, Heap};
///
/// let mut heap = Heap::new(Arena::<1024>::new());
/// let ptr = heap.alloc(24).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 8, 0);
/// // SAFETY: `ptr` came from this heap and is not used afterwards.
/// unsafe { heap.free(ptr) };
/// ```
pub struct Heap<R: Region> {
    buffer: HeapBuffer<R>,
    ready: bool,
}

impl<R: Region> Heap<R> {
    /// Create a heap over a region.
    ///
    /// The region must be untouched (its current end at zero). Nothing is
    /// written to it until [`init`](Self::init) runs, so this is a `const
    /// fn` and a heap can be a `static`.
    pub const fn new(region: R) -> Self {
        Self {
            buffer: HeapBuffer::new(region),
            ready: false,
        }
    }

    /// Set up the sentinels, the class-head table and the first free block.
    ///
    /// Runs at most once; later calls return `Ok` without touching the heap.
    /// [`alloc`](Self::alloc) and [`realloc`](Self::realloc) initialize the
    /// heap on demand, so calling this directly is only needed to observe
    /// setup failures early. After an error the heap should be considered
    /// unusable.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.ready {
            return Ok(());
        }
        debug_assert_eq!(self.buffer.len(), 0, "the region must start empty");
        self.buffer.grow(FIRST_BLOCK).ok_or(OutOfMemory)?;

        for class in 0..CLASS_COUNT {
            self.buffer.set_class_head(class, 0);
        }
        let prologue = Block(PROLOGUE);
        self.buffer.set_header(prologue, Tag::allocated(DSIZE));
        self.buffer.set_footer(prologue, Tag::allocated(DSIZE));
        self.buffer
            .set_header(self.buffer.next_block(prologue), Tag::allocated(0));
        self.ready = true;

        self.extend(INIT_CHUNK).ok_or(OutOfMemory)?;
        Ok(())
    }

    /// Allocate `size` bytes, returning an 8-byte-aligned payload pointer.
    ///
    /// Returns `None` for a zero-sized request or when the region cannot
    /// satisfy the allocation; the heap is left unchanged in that case.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.ready {
            self.init().ok()?;
        }
        if size == 0 {
            return None;
        }
        let asize = block_size(size)?;
        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => self.extend(asize.max(CHUNK))?,
        };
        let block = self.place(block, asize);
        Some(self.buffer.payload(block))
    }

    /// Release an allocation.
    ///
    /// The block is merged with any free physical neighbor before it goes
    /// back on its free list, so no two adjacent free blocks ever exist.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`alloc`](Self::alloc) or
    /// [`realloc`](Self::realloc) on this heap and not freed since. Passing
    /// any other pointer corrupts the heap.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = self.block_of(ptr);
        let header = self.buffer.header(block);
        debug_assert!(header.is_allocated(), "double or wild free");

        let tag = Tag::free(header.size());
        self.buffer.set_header(block, tag);
        self.buffer.set_footer(block, tag);
        self.coalesce(block);
    }

    /// Resize an allocation, preserving its payload.
    ///
    /// The classic contract: a `None` pointer allocates, a zero `size` frees
    /// and returns `None`. Otherwise the block is resized in place whenever
    /// the request still fits (or shrinks), grown into a free physical
    /// successor or over the heap end where possible, and only moved (with a
    /// payload copy) as a last resort. On exhaustion `None` is returned and
    /// the original allocation is left untouched.
    ///
    /// # Safety
    /// A non-`None` `ptr` must have been returned by this heap and not freed
    /// since.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.alloc(size);
        };
        if size == 0 {
            // SAFETY: live allocation per this function's contract
            unsafe { self.free(ptr) };
            return None;
        }

        let block = self.block_of(ptr);
        let old = self.buffer.header(block).size();
        let new = block_size(size)?;

        if new == old {
            return Some(ptr);
        }

        if new < old {
            // shrink in place when the cut-off can stand as a block
            if old - new >= MIN_BLOCK {
                let tag = Tag::allocated(new);
                self.buffer.set_header(block, tag);
                self.buffer.set_footer(block, tag);
                let rest = self.buffer.next_block(block);
                let tag = Tag::free(old - new);
                self.buffer.set_header(rest, tag);
                self.buffer.set_footer(rest, tag);
                self.coalesce(rest);
            }
            return Some(ptr);
        }

        let next = self.buffer.next_block(block);
        let next_tag = self.buffer.header(next);
        let tail = if next_tag.is_allocated() { 0 } else { next_tag.size() };
        let mut slack = i64::from(old) + i64::from(tail) - i64::from(new);

        // a block at the top of the heap can grow by extending the region
        let at_top = next_tag.size() == 0
            || (!next_tag.is_allocated()
                && self.buffer.header(self.buffer.next_block(next)).size() == 0);
        if slack < 0 && at_top {
            let shortfall = (-slack) as u32;
            if self.extend(shortfall.max(REALLOC_CHUNK)).is_some() {
                // the extension coalesced into the old tail, so re-read the
                // successor instead of trusting the numbers from above
                let next = self.buffer.next_block(block);
                slack = i64::from(old) + i64::from(self.buffer.header(next).size())
                    - i64::from(new);
            }
        }

        if slack >= 0 {
            let slack = slack as u32;
            let next = self.buffer.next_block(block);
            self.remove_free(next);
            if slack < MIN_BLOCK {
                let tag = Tag::allocated(new + slack);
                self.buffer.set_header(block, tag);
                self.buffer.set_footer(block, tag);
            } else {
                let tag = Tag::allocated(new);
                self.buffer.set_header(block, tag);
                self.buffer.set_footer(block, tag);
                let rest = self.buffer.next_block(block);
                let tag = Tag::free(slack);
                self.buffer.set_header(rest, tag);
                self.buffer.set_footer(rest, tag);
                self.insert_free(rest);
            }
            return Some(ptr);
        }

        // no room in place: allocate elsewhere, copy, release
        let moved = self.alloc(size)?;
        let dst = self.block_of(moved);
        self.buffer.copy_payload(block, dst, old - DSIZE);
        // SAFETY: live allocation per this function's contract
        unsafe { self.free(ptr) };
        Some(moved)
    }

    /// Borrow the underlying region, e.g. to inspect its current end.
    pub fn region(&self) -> &R {
        &self.buffer.region
    }

    /// Translate a payload pointer back into a block offset.
    fn block_of(&self, ptr: NonNull<u8>) -> Block {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.buffer.base_addr());
        debug_assert!(
            offset >= FIRST_BLOCK as usize && offset < self.buffer.len() as usize,
            "pointer does not belong to this heap"
        );
        Block(offset as u32)
    }

    /// First-fit search across the segregated lists.
    ///
    /// Starts at the smallest class that could hold `asize` and walks each
    /// list in insertion order; larger classes are only visited when every
    /// smaller one misses.
    fn find_fit(&self, asize: u32) -> Option<Block> {
        for class in class_of(asize)..CLASS_COUNT {
            let mut offset = self.buffer.class_head(class);
            while offset != 0 {
                let block = Block(offset);
                if self.buffer.header(block).size() >= asize {
                    return Some(block);
                }
                offset = self.buffer.succ(block);
            }
        }
        None
    }

    /// Grow the region and shape the new bytes into a free block.
    ///
    /// The old epilogue becomes the new block's header and a fresh epilogue
    /// is written at the top. The block is coalesced, so if the heap ended
    /// in a free block the two merge into one.
    fn extend(&mut self, size: u32) -> Option<Block> {
        let size = align8(size);
        let block = Block(self.buffer.grow(size)?);
        let tag = Tag::free(size);
        self.buffer.set_header(block, tag);
        self.buffer.set_footer(block, tag);
        self.buffer
            .set_header(self.buffer.next_block(block), Tag::allocated(0));
        Some(self.coalesce(block))
    }

    /// Carve `asize` bytes out of a free block and return the allocated part.
    ///
    /// Splits when the remainder can stand as a block of its own. Small
    /// requests take the bottom of the split and leave the remainder on top;
    /// requests above [`BIG_SIZE`] take the top instead, which segregates
    /// long-lived large blocks from the small-block churn below them.
    fn place(&mut self, block: Block, asize: u32) -> Block {
        let size = self.buffer.header(block).size();
        let remain = size - asize;
        self.remove_free(block);

        if remain < MIN_BLOCK {
            let tag = Tag::allocated(size);
            self.buffer.set_header(block, tag);
            self.buffer.set_footer(block, tag);
            block
        } else if asize > BIG_SIZE {
            let tag = Tag::free(remain);
            self.buffer.set_header(block, tag);
            self.buffer.set_footer(block, tag);
            let top = self.buffer.next_block(block);
            let tag = Tag::allocated(asize);
            self.buffer.set_header(top, tag);
            self.buffer.set_footer(top, tag);
            self.insert_free(block);
            top
        } else {
            let tag = Tag::allocated(asize);
            self.buffer.set_header(block, tag);
            self.buffer.set_footer(block, tag);
            let rest = self.buffer.next_block(block);
            let tag = Tag::free(remain);
            self.buffer.set_header(rest, tag);
            self.buffer.set_footer(rest, tag);
            self.insert_free(rest);
            block
        }
    }

    /// Merge a newly-free block with its free physical neighbors.
    ///
    /// `block` must carry a free tag and not be in any list yet. The merged
    /// block (which may start at the predecessor) is inserted into its class
    /// list and returned.
    fn coalesce(&mut self, block: Block) -> Block {
        let prev = self.buffer.prev_block(block);
        let next = self.buffer.next_block(block);
        let prev_alloc = self.buffer.header(prev).is_allocated();
        let next_alloc = self.buffer.header(next).is_allocated();

        let merged = match (prev_alloc, next_alloc) {
            (true, true) => block,
            (true, false) => {
                self.remove_free(next);
                let size = self.buffer.header(block).size() + self.buffer.header(next).size();
                let tag = Tag::free(size);
                self.buffer.set_header(block, tag);
                self.buffer.set_footer(block, tag);
                block
            }
            (false, true) => {
                self.remove_free(prev);
                let size = self.buffer.header(prev).size() + self.buffer.header(block).size();
                let tag = Tag::free(size);
                self.buffer.set_header(prev, tag);
                self.buffer.set_footer(prev, tag);
                prev
            }
            (false, false) => {
                self.remove_free(prev);
                self.remove_free(next);
                let size = self.buffer.header(prev).size()
                    + self.buffer.header(block).size()
                    + self.buffer.header(next).size();
                let tag = Tag::free(size);
                self.buffer.set_header(prev, tag);
                self.buffer.set_footer(prev, tag);
                prev
            }
        };
        self.insert_free(merged);
        merged
    }
}

/// Aligned block size (header + payload + footer) for a request.
///
/// Returns `None` when the request cannot be represented as a 32-bit block
/// size; such a request can never be satisfied, but it must also never
/// disturb the heap.
fn block_size(size: usize) -> Option<u32> {
    let padded = size.checked_add(ALIGNMENT as usize - 1)? & !(ALIGNMENT as usize - 1);
    let total = padded.checked_add(DSIZE as usize)?;
    u32::try_from(total).ok()
}
