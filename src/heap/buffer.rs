//! Raw word access to the heap region and the block codec built on it.
//!
//! Everything the allocator knows about a block is stored in-band: a 4-byte
//! header below the payload, a matching 4-byte footer at the top of the
//! block, and (in free blocks) two 4-byte list links at the start of the
//! payload. This module is the only place that touches those words directly;
//! every read and write is bounds- and alignment-checked at runtime, so the
//! rest of the crate can navigate blocks through a safe interface.

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use super::free_list::CLASS_COUNT;
use super::region::Region;
use super::tag::Tag;

/// Size of one heap word (a tag or a list link).
pub(crate) const WSIZE: u32 = 4;
/// Size of a header/footer pair, and the alignment unit of the heap.
pub(crate) const DSIZE: u32 = 8;

/// A block, identified by the offset of its payload from the region base.
///
/// The offset `0` never identifies a block (it falls into the class-head
/// table at the bottom of the region), which is why a zero link can serve as
/// the null terminator of the free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(pub(crate) u32);

/// Word-addressed view of a [`Region`].
///
/// The unsafe core of the crate: raw reads and writes happen only in
/// [`word`](Self::word) and [`set_word`](Self::set_word) (plus the payload
/// accessors below), each guarded by asserts that keep every access aligned
/// and below the current break.
pub(crate) struct HeapBuffer<R> {
    pub(crate) region: R,
}

impl<R: Region> HeapBuffer<R> {
    pub(crate) const fn new(region: R) -> Self {
        Self { region }
    }

    /// Current end of the region, as an offset usable in tag arithmetic.
    ///
    /// [`grow`](Self::grow) refuses to push the region past `u32::MAX`, so
    /// the conversion is lossless.
    pub(crate) fn len(&self) -> u32 {
        self.region.len() as u32
    }

    /// Address of the region base, for translating payload pointers back
    /// into offsets.
    pub(crate) fn base_addr(&self) -> usize {
        self.region.base() as usize
    }

    /// Grow the region by `n` bytes, returning the previous end offset.
    ///
    /// Fails (without touching the region) if the provider is exhausted or
    /// if the new end would no longer be addressable by a 32-bit offset.
    pub(crate) fn grow(&mut self, n: u32) -> Option<u32> {
        let end = self.region.len().checked_add(n as usize)?;
        if end > u32::MAX as usize {
            return None;
        }
        let previous = self.region.grow(n as usize)?;
        Some(previous as u32)
    }

    /// Read the word at `offset`.
    ///
    /// # Panics
    /// Panics if the offset is not word-aligned or reaches past the break.
    fn word(&self, offset: u32) -> u32 {
        assert!(offset % WSIZE == 0);
        assert!(offset as usize + WSIZE as usize <= self.region.len());

        // SAFETY: the asserts above keep the access in bounds of the region
        // and aligned to 4 (the base itself is aligned to 8 per the `Region`
        // contract). The word is initialized: every word below the break is
        // part of the class-head table (zeroed at init), a tag (written when
        // its block was formed), a list link (written at insert), payload,
        // or the boot padding word, and the last two are never read through
        // this function.
        unsafe {
            self.region
                .base()
                .add(offset as usize)
                .cast::<MaybeUninit<u32>>()
                .read()
                .assume_init()
        }
    }

    /// Write the word at `offset`.
    ///
    /// # Panics
    /// Panics if the offset is not word-aligned or reaches past the break.
    fn set_word(&mut self, offset: u32, value: u32) {
        assert!(offset % WSIZE == 0);
        assert!(offset as usize + WSIZE as usize <= self.region.len());

        // SAFETY: in bounds and aligned per the asserts above (see `word`);
        // writing through `MaybeUninit` never reads the old bytes, so it is
        // fine even for words that were never initialized.
        unsafe {
            self.region
                .base_mut()
                .add(offset as usize)
                .cast::<MaybeUninit<u32>>()
                .write(MaybeUninit::new(value));
        }
    }

    /// Head slot of a size-class list.
    pub(crate) fn class_head(&self, class: usize) -> u32 {
        assert!(class < CLASS_COUNT);
        self.word(class as u32 * WSIZE)
    }

    pub(crate) fn set_class_head(&mut self, class: usize, offset: u32) {
        assert!(class < CLASS_COUNT);
        self.set_word(class as u32 * WSIZE, offset);
    }

    /// The tag word just below a block's payload.
    pub(crate) fn header(&self, block: Block) -> Tag {
        Tag::from_raw(self.word(block.0 - WSIZE))
    }

    pub(crate) fn set_header(&mut self, block: Block, tag: Tag) {
        self.set_word(block.0 - WSIZE, tag.as_raw());
    }

    /// The tag word at the top of a block, as located by its header size.
    pub(crate) fn footer(&self, block: Block) -> Tag {
        Tag::from_raw(self.word(block.0 + self.header(block).size() - DSIZE))
    }

    /// Write a block's footer.
    ///
    /// The footer position is derived from the size packed in `tag`, so the
    /// same tag value must be (or have been) written to the header.
    pub(crate) fn set_footer(&mut self, block: Block, tag: Tag) {
        self.set_word(block.0 + tag.size() - DSIZE, tag.as_raw());
    }

    /// The physically following block.
    pub(crate) fn next_block(&self, block: Block) -> Block {
        Block(block.0 + self.header(block).size())
    }

    /// The physically preceding block, located through its footer.
    pub(crate) fn prev_block(&self, block: Block) -> Block {
        let size = Tag::from_raw(self.word(block.0 - DSIZE)).size();
        Block(block.0 - size)
    }

    /// Free-list predecessor link (only meaningful for free blocks).
    pub(crate) fn pred(&self, block: Block) -> u32 {
        self.word(block.0)
    }

    /// Free-list successor link (only meaningful for free blocks).
    pub(crate) fn succ(&self, block: Block) -> u32 {
        self.word(block.0 + WSIZE)
    }

    pub(crate) fn set_pred(&mut self, block: Block, offset: u32) {
        self.set_word(block.0, offset);
    }

    pub(crate) fn set_succ(&mut self, block: Block, offset: u32) {
        self.set_word(block.0 + WSIZE, offset);
    }

    /// Pointer to a block's payload, as handed to the caller.
    pub(crate) fn payload(&mut self, block: Block) -> NonNull<u8> {
        assert!((block.0 as usize) < self.region.len());

        // SAFETY: in bounds per the assert; the region base is non-null, so
        // base + offset is too.
        unsafe {
            NonNull::new_unchecked(
                self.region
                    .base_mut()
                    .add(block.0 as usize)
                    .cast::<u8>(),
            )
        }
    }

    /// Copy `bytes` payload bytes from one block to another.
    ///
    /// Used by the reallocation move path; the two payload ranges must not
    /// overlap.
    pub(crate) fn copy_payload(&mut self, src: Block, dst: Block, bytes: u32) {
        let len = self.region.len();
        assert!(src.0 as usize + bytes as usize <= len);
        assert!(dst.0 as usize + bytes as usize <= len);
        let (lo, hi) = if src.0 < dst.0 { (src.0, dst.0) } else { (dst.0, src.0) };
        assert!(
            lo as usize + bytes as usize <= hi as usize,
            "payload copy must not overlap"
        );

        // SAFETY: both ranges are in bounds and disjoint per the asserts;
        // copying `MaybeUninit<u8>` makes no claim about initialization.
        unsafe {
            let base = self.region.base_mut();
            core::ptr::copy_nonoverlapping(
                base.add(src.0 as usize),
                base.add(dst.0 as usize),
                bytes as usize,
            );
        }
    }
}
