//! Heap-consistency diagnostics.
//!
//! [`Heap::check`] walks every free list and the whole physical block chain
//! and reports the first violated invariant as a [`Corruption`] value. It is
//! meant for tests and debugging, not for the allocation path: the walk is
//! linear in the heap size and validates every link before following it, so
//! it can be run against a deliberately clobbered heap without faulting.

use super::buffer::{Block, DSIZE};
use super::free_list::{class_of, CLASS_COUNT};
use super::region::Region;
use super::tag::Tag;
use super::{Heap, ALIGNMENT, FIRST_BLOCK, MIN_BLOCK, PROLOGUE};

/// A violated heap invariant.
///
/// Offsets name the payload of the offending block, relative to the region
/// base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// Prologue or epilogue sentinel overwritten or out of place.
    BadSentinel,
    /// A block size is not a multiple of 8, is below the minimum or runs
    /// past the end of the region.
    BadBlockSize { block: u32 },
    /// Header and footer of a block disagree.
    TagMismatch { block: u32 },
    /// Two physically adjacent blocks are both free.
    EscapedCoalescing { block: u32 },
    /// A list link points outside the payload region or at a block that is
    /// not free.
    BadLink { class: usize, offset: u32 },
    /// A listed block belongs to a different size class.
    WrongClass { class: usize, block: u32 },
    /// A physically free block is missing from its size-class list.
    Unlisted { block: u32 },
    /// Neighboring list nodes disagree about their linkage.
    BrokenList { class: usize, block: u32 },
    /// The lists and the physical walk disagree about the number of free
    /// blocks (e.g. a block threaded into a list twice).
    ListCountMismatch { listed: usize, free: usize },
}

impl<R: Region> Heap<R> {
    /// Verify every structural invariant of the heap.
    ///
    /// Checks that the sentinels are intact; that the blocks tile the
    /// payload region with consistent tags, aligned payloads and no two
    /// adjacent free blocks; and that the free lists contain exactly the
    /// free blocks, each in the list its size selects, with consistent
    /// predecessor/successor links.
    ///
    /// An uninitialized heap passes trivially.
    pub fn check(&self) -> Result<(), Corruption> {
        if !self.ready {
            return Ok(());
        }

        let prologue = Block(PROLOGUE);
        if self.buffer.header(prologue) != Tag::allocated(DSIZE)
            || self.buffer.footer(prologue) != Tag::allocated(DSIZE)
        {
            return Err(Corruption::BadSentinel);
        }

        let listed = self.check_lists()?;
        let free = self.check_blocks()?;
        if listed != free {
            return Err(Corruption::ListCountMismatch { listed, free });
        }
        Ok(())
    }

    /// Number of free blocks in the heap, counted by a physical walk.
    ///
    /// Diagnostic companion to [`check`](Self::check); an uninitialized
    /// heap has none.
    pub fn free_blocks(&self) -> usize {
        if !self.ready {
            return 0;
        }
        let mut count = 0;
        let mut block = Block(FIRST_BLOCK);
        loop {
            let tag = self.buffer.header(block);
            if tag.size() == 0 {
                return count;
            }
            if !tag.is_allocated() {
                count += 1;
            }
            block = self.buffer.next_block(block);
        }
    }

    /// Walk the physical chain; returns the number of free blocks.
    fn check_blocks(&self) -> Result<usize, Corruption> {
        let len = self.buffer.len();
        let mut block = Block(FIRST_BLOCK);
        let mut free = 0;
        let mut prev_free = false;
        loop {
            let tag = self.buffer.header(block);
            if tag.size() == 0 {
                // the epilogue must be allocated and flush with the break
                if !tag.is_allocated() || block.0 != len {
                    return Err(Corruption::BadSentinel);
                }
                return Ok(free);
            }
            if tag.size() % ALIGNMENT != 0
                || tag.size() < MIN_BLOCK
                || block.0 as u64 + tag.size() as u64 > len as u64
            {
                return Err(Corruption::BadBlockSize { block: block.0 });
            }
            if self.buffer.footer(block) != tag {
                return Err(Corruption::TagMismatch { block: block.0 });
            }
            if tag.is_allocated() {
                prev_free = false;
            } else {
                if prev_free {
                    return Err(Corruption::EscapedCoalescing { block: block.0 });
                }
                if !self.in_class_list(block) {
                    return Err(Corruption::Unlisted { block: block.0 });
                }
                free += 1;
                prev_free = true;
            }
            block = self.buffer.next_block(block);
        }
    }

    /// Walk every class list; returns the total number of listed blocks.
    fn check_lists(&self) -> Result<usize, Corruption> {
        // any consistent list is shorter than this
        let node_limit = self.buffer.len() as usize / MIN_BLOCK as usize;
        let mut listed = 0;
        for class in 0..CLASS_COUNT {
            let mut offset = self.buffer.class_head(class);
            let mut pred = 0;
            let mut nodes = 0;
            while offset != 0 {
                if nodes > node_limit {
                    return Err(Corruption::BrokenList { class, block: offset });
                }
                if !self.plausible_node(offset) {
                    return Err(Corruption::BadLink { class, offset });
                }
                let block = Block(offset);
                let tag = self.buffer.header(block);
                if tag.is_allocated() {
                    return Err(Corruption::BadLink { class, offset });
                }
                if tag.size() < MIN_BLOCK {
                    return Err(Corruption::BadBlockSize { block: offset });
                }
                if class_of(tag.size()) != class {
                    return Err(Corruption::WrongClass { class, block: offset });
                }
                if self.buffer.pred(block) != pred {
                    return Err(Corruption::BrokenList { class, block: offset });
                }
                listed += 1;
                nodes += 1;
                pred = offset;
                offset = self.buffer.succ(block);
            }
        }
        Ok(listed)
    }

    /// Search the class list a free block belongs into for that block.
    fn in_class_list(&self, block: Block) -> bool {
        let class = class_of(self.buffer.header(block).size());
        let node_limit = self.buffer.len() as usize / MIN_BLOCK as usize;
        let mut offset = self.buffer.class_head(class);
        let mut nodes = 0;
        while offset != 0 && nodes <= node_limit {
            if offset == block.0 {
                return true;
            }
            if !self.plausible_node(offset) {
                return false;
            }
            offset = self.buffer.succ(Block(offset));
            nodes += 1;
        }
        false
    }

    /// Whether an offset can be dereferenced as a free-list node at all:
    /// aligned like a payload, below the break, header and both links
    /// readable.
    fn plausible_node(&self, offset: u32) -> bool {
        offset % ALIGNMENT == 0
            && offset >= FIRST_BLOCK
            && offset as u64 + DSIZE as u64 <= self.buffer.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::super::region::Arena;
    use super::super::tag::Tag;
    use super::super::{Block, Heap, FIRST_BLOCK};
    use super::Corruption;

    fn churned_heap() -> Heap<Arena<8192>> {
        let mut heap = Heap::new(Arena::<8192>::new());
        let a = heap.alloc(24).unwrap();
        let _b = heap.alloc(100).unwrap();
        let c = heap.alloc(32).unwrap();
        // SAFETY: freeing live allocations of this heap
        unsafe {
            heap.free(a);
            heap.free(c);
        }
        heap
    }

    #[test]
    fn consistent_heaps_pass() {
        let heap = Heap::new(Arena::<1024>::new());
        heap.check().unwrap();

        let mut heap = churned_heap();
        heap.check().unwrap();
        let _more = heap.alloc(48).unwrap();
        heap.check().unwrap();
    }

    #[test]
    fn detects_a_clobbered_free_header() {
        let mut heap = Heap::new(Arena::<1024>::new());
        heap.init().unwrap();
        // the initial free block, stamped "allocated" without a free
        let block = Block(FIRST_BLOCK);
        let size = heap.buffer.header(block).size();
        heap.buffer.set_header(block, Tag::allocated(size));
        heap.buffer.set_footer(block, Tag::allocated(size));

        // its list still references it
        assert!(matches!(
            heap.check(),
            Err(Corruption::BadLink { .. })
        ));
    }

    #[test]
    fn detects_a_wild_list_link() {
        let mut heap = Heap::new(Arena::<1024>::new());
        heap.init().unwrap();
        let block = Block(FIRST_BLOCK);
        heap.buffer.set_succ(block, 0xDEAD_BEEC);
        assert!(matches!(heap.check(), Err(Corruption::BadLink { .. })));
    }

    #[test]
    fn detects_a_head_pointing_at_an_allocated_block() {
        let mut heap = Heap::new(Arena::<1024>::new());
        let p = heap.alloc(24).unwrap();
        let offset = (p.as_ptr() as usize - heap.buffer.base_addr()) as u32;
        heap.buffer.set_class_head(0, offset);
        assert!(matches!(heap.check(), Err(Corruption::BadLink { .. })));
    }

    #[test]
    fn detects_a_free_block_missing_from_its_list() {
        let mut heap = Heap::new(Arena::<1024>::new());
        let p1 = heap.alloc(24).unwrap();
        let _p2 = heap.alloc(24).unwrap();
        // hand-mark p1's block free without inserting it anywhere
        let block = Block((p1.as_ptr() as usize - heap.buffer.base_addr()) as u32);
        let size = heap.buffer.header(block).size();
        heap.buffer.set_header(block, Tag::free(size));
        heap.buffer.set_footer(block, Tag::free(size));
        assert!(matches!(heap.check(), Err(Corruption::Unlisted { .. })));
    }

    #[test]
    fn detects_a_block_in_the_wrong_class() {
        let mut heap = Heap::new(Arena::<1024>::new());
        heap.init().unwrap();
        // move the initial free block's list head into another class
        let block = Block(FIRST_BLOCK);
        let class = super::class_of(heap.buffer.header(block).size());
        heap.buffer.set_class_head(class, 0);
        heap.buffer.set_class_head(class + 1, block.0);
        assert!(matches!(heap.check(), Err(Corruption::WrongClass { .. })));
    }

    #[test]
    fn detects_a_torn_epilogue() {
        let mut heap = Heap::new(Arena::<1024>::new());
        heap.init().unwrap();
        let epilogue = Block(heap.buffer.len());
        heap.buffer.set_header(epilogue, Tag::free(0));
        assert!(matches!(heap.check(), Err(Corruption::BadSentinel)));
    }
}
