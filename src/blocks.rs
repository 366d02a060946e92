use core::ptr::NonNull;

use crate::{boundary_tag::BoundaryTag, WORD_SIZE};

/// The header word of a block in the heap.
///
/// A block spans `[addr, addr + size)` and its size includes this header.
/// The payload begins one word after the header. Free blocks mirror the
/// header encoding in a footer word at the very end of the block, which is
/// what makes backward traversal from a block whose `prev_free` flag is set
/// an O(1) operation.
#[repr(transparent)]
#[derive(Debug)]
pub struct Block(usize);

impl Block {
    /// Returns a [`BlockRef`] for the block at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block header.
    pub unsafe fn from_addr(addr: usize) -> BlockRef {
        let header = &*(addr as *const Block);
        if header.is_free() {
            BlockRef::Free(FreeBlock::from_addr(addr))
        } else {
            BlockRef::Used(UsedBlock::from_addr(addr))
        }
    }

    /// Returns a raw view of the header word at the given address, without
    /// dispatching on the block's status.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block header or to the sentinel
    /// word.
    pub unsafe fn header_at(addr: usize) -> &'static mut Block {
        &mut *(addr as *mut Block)
    }

    /// Sets the `prev_free` flag of the block at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block header or to the sentinel
    /// word.
    pub unsafe fn set_prev_free_for_block_at(addr: usize, prev_free: bool) {
        let block = &mut *(addr as *mut Block);
        let mut tag = block.tag();
        tag.prev_free = prev_free;
        block.0 = tag.encode();
    }

    /// Writes the used, zero-payload sentinel word at the given address.
    ///
    /// The sentinel terminates forward traversal and, being permanently
    /// used, stops coalescing from running past the end of the heap.
    ///
    /// # Safety
    ///
    /// The word at `addr` must be inside the committed backing region and
    /// must not belong to any live block.
    pub unsafe fn write_sentinel(addr: usize, prev_free: bool) {
        let block = &mut *(addr as *mut Block);
        block.0 = BoundaryTag {
            size: 0,
            used: true,
            prev_free,
        }
        .encode();
    }

    /// The decoded boundary tag of this block.
    pub fn tag(&self) -> BoundaryTag {
        BoundaryTag::decode(self.0)
    }

    /// The size of the block, including the header word.
    pub fn size(&self) -> usize {
        self.tag().size
    }

    /// Is this block free?
    pub fn is_free(&self) -> bool {
        !self.tag().used
    }

    /// Is the physically preceding block free?
    pub fn prev_free(&self) -> bool {
        self.tag().prev_free
    }

    /// The address where this block starts.
    pub fn addr(&self) -> usize {
        self as *const _ as usize
    }

    /// The address where the payload of this block starts.
    pub fn payload_addr(&self) -> usize {
        self.addr() + WORD_SIZE
    }

    /// The address one past the last byte of this block.
    pub fn end_addr(&self) -> usize {
        self.addr() + self.size()
    }

    /// Returns the address of the next physical block, or `None` when the
    /// computed address would fall outside the heap.
    ///
    /// The sentinel word at `heap_end_addr` is a reachable neighbor, so tag
    /// rewrites keep its `prev_free` flag truthful as well.
    pub fn next_block_addr(&self, heap_end_addr: usize) -> Option<usize> {
        let end = self.end_addr();
        if end <= heap_end_addr {
            Some(end)
        } else {
            None
        }
    }

    /// Returns a reference to the next physical block, if it is free.
    ///
    /// The sentinel is permanently used, so the last real block never
    /// reports a free right neighbor.
    fn next_block_if_free(&self, heap_end_addr: usize) -> Option<FreeBlockRef> {
        let next_addr = self.next_block_addr(heap_end_addr)?;
        match unsafe { Block::from_addr(next_addr) } {
            BlockRef::Used(_) => None,
            BlockRef::Free(free) => Some(free),
        }
    }

    /// Returns a reference to the physically preceding block, if it is free.
    ///
    /// A used block carries no footer, so the only way to learn the left
    /// neighbor's status is this block's own `prev_free` flag; when the flag
    /// is set, the neighbor is free and its footer word sits directly below
    /// this header.
    fn prev_block_if_free(&self, heap_start_addr: usize) -> Option<FreeBlockRef> {
        if !self.prev_free() {
            return None;
        }

        let footer = BoundaryTag::decode(unsafe { *((self.addr() - WORD_SIZE) as *const usize) });
        let prev_addr = self.addr() - footer.size;
        if prev_addr < heap_start_addr {
            return None;
        }

        Some(unsafe { FreeBlock::from_addr(prev_addr) })
    }
}

/// A used block in the heap.
#[repr(transparent)]
pub struct UsedBlock(pub(crate) Block);

pub type UsedBlockRef = &'static mut UsedBlock;

impl UsedBlock {
    /// Returns a [`UsedBlockRef`] for the block at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block that is used.
    pub unsafe fn from_addr(addr: usize) -> UsedBlockRef {
        &mut *(addr as *mut UsedBlock)
    }

    /// Returns a [`UsedBlockRef`] for the block owning the given payload
    /// address.
    ///
    /// # Safety
    ///
    /// The address must be a payload address previously handed out by the
    /// allocator, for a block that is still used.
    pub unsafe fn from_payload_addr(payload_addr: usize) -> UsedBlockRef {
        Self::from_addr(payload_addr - WORD_SIZE)
    }

    /// Creates a new used block at the given address and updates the next
    /// physical block, if any, that its predecessor is now used.
    ///
    /// # Safety
    ///
    ///  - the range `addr..addr + size` must be valid and not owned by any
    ///    other block.
    ///  - `size` must be rounded to the alignment unit.
    pub unsafe fn create(
        addr: usize,
        size: usize,
        prev_free: bool,
        heap_end_addr: usize,
    ) -> UsedBlockRef {
        let block = &mut *(addr as *mut UsedBlock);
        block.0 .0 = BoundaryTag {
            size,
            used: true,
            prev_free,
        }
        .encode();

        if let Some(next_addr) = block.0.next_block_addr(heap_end_addr) {
            Block::set_prev_free_for_block_at(next_addr, false);
        }

        block
    }

    /// The address where this block starts.
    pub fn addr(&self) -> usize {
        self.0.addr()
    }

    /// The size of this block, including the header word.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// The address where the payload of this block starts.
    pub fn payload_addr(&self) -> usize {
        self.0.payload_addr()
    }

    /// The address one past the last byte of this block.
    pub fn end_addr(&self) -> usize {
        self.0.end_addr()
    }

    /// Is the physically preceding block free?
    pub fn prev_free(&self) -> bool {
        self.0.prev_free()
    }

    /// Returns a reference to the next physical block, if it is free.
    pub fn next_block_if_free(&self, heap_end_addr: usize) -> Option<FreeBlockRef> {
        self.0.next_block_if_free(heap_end_addr)
    }

    /// Returns a reference to the physically preceding block, if it is free.
    pub fn prev_block_if_free(&self, heap_start_addr: usize) -> Option<FreeBlockRef> {
        self.0.prev_block_if_free(heap_start_addr)
    }
}

/// A free block in the heap.
///
/// The two link fields live in the reclaimed payload and are only valid
/// while the block is free; together with the header and the footer they
/// dictate the minimum block size.
#[repr(C)]
#[derive(Debug)]
pub struct FreeBlock {
    pub(crate) header: Block,
    pub(crate) next: Option<FreeBlockPtr>,
    pub(crate) prev: Option<FreeBlockPtr>,
}

pub type FreeBlockRef = &'static mut FreeBlock;
pub type FreeBlockPtr = NonNull<FreeBlock>;

impl FreeBlock {
    /// Returns a [`FreeBlockRef`] for the block at the given address.
    ///
    /// # Safety
    ///
    /// The address must point to a valid block that is free.
    pub unsafe fn from_addr(addr: usize) -> FreeBlockRef {
        &mut *(addr as *mut FreeBlock)
    }

    /// Creates a new free block at the given address: header, matching
    /// footer, cleared link fields. The next physical block, if any, is
    /// updated that its predecessor is now free.
    ///
    /// The caller is expected to insert the block into the free list.
    ///
    /// # Safety
    ///
    ///  - the range `addr..addr + size` must be valid and not owned by any
    ///    other block.
    ///  - `size` must be rounded to the alignment unit and at least the
    ///    minimum block size.
    pub unsafe fn create(
        addr: usize,
        size: usize,
        prev_free: bool,
        heap_end_addr: usize,
    ) -> FreeBlockRef {
        let block = FreeBlock::from_addr(addr);
        block.header.0 = BoundaryTag {
            size,
            used: false,
            prev_free,
        }
        .encode();
        block.next = None;
        block.prev = None;

        // the footer mirrors the header so that the block behind it can walk
        // backwards over this one
        block.write_footer();

        if let Some(next_addr) = block.header.next_block_addr(heap_end_addr) {
            Block::set_prev_free_for_block_at(next_addr, true);
        }

        block
    }

    /// The address where this block starts.
    pub fn addr(&self) -> usize {
        self.header.addr()
    }

    /// The size of this block, including the header word.
    pub fn size(&self) -> usize {
        self.header.size()
    }

    /// The address where the payload of this block starts.
    pub fn payload_addr(&self) -> usize {
        self.header.payload_addr()
    }

    /// The address one past the last byte of this block.
    pub fn end_addr(&self) -> usize {
        self.header.end_addr()
    }

    /// Is the physically preceding block free?
    pub fn prev_free(&self) -> bool {
        self.header.prev_free()
    }

    /// The decoded footer tag of this block.
    pub fn footer(&self) -> BoundaryTag {
        BoundaryTag::decode(unsafe { *((self.end_addr() - WORD_SIZE) as *const usize) })
    }

    /// Returns a reference to the next physical block, if it is free.
    pub fn next_block_if_free(&self, heap_end_addr: usize) -> Option<FreeBlockRef> {
        self.header.next_block_if_free(heap_end_addr)
    }

    /// Returns a reference to the physically preceding block, if it is free.
    pub fn prev_block_if_free(&self, heap_start_addr: usize) -> Option<FreeBlockRef> {
        self.header.prev_block_if_free(heap_start_addr)
    }

    fn write_footer(&mut self) {
        let footer_ptr = (self.end_addr() - WORD_SIZE) as *mut usize;
        unsafe { *footer_ptr = self.header.tag().encode() };
    }
}

/// A reference to a used or free block.
pub enum BlockRef {
    Used(UsedBlockRef),
    Free(FreeBlockRef),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIN_BLOCK_SIZE;

    /// Leaks a zeroed, word-aligned region and returns its address.
    fn leaked_region(bytes: usize) -> usize {
        let buf = vec![0usize; bytes / WORD_SIZE].leak();
        buf.as_mut_ptr() as usize
    }

    #[test]
    fn used_block_layout() {
        let addr = leaked_region(256);
        let heap_end = addr + 64;

        let block = unsafe { UsedBlock::create(addr, 64, false, heap_end) };

        assert_eq!(block.addr(), addr);
        assert_eq!(block.size(), 64);
        assert_eq!(block.payload_addr(), addr + WORD_SIZE);
        assert_eq!(block.end_addr(), addr + 64);
        assert!(!block.prev_free());
    }

    #[test]
    fn free_block_mirrors_its_header_in_the_footer() {
        let addr = leaked_region(256);
        let heap_end = addr + MIN_BLOCK_SIZE;

        let block = unsafe { FreeBlock::create(addr, MIN_BLOCK_SIZE, false, heap_end) };

        assert_eq!(block.footer(), block.header.tag());
        assert_eq!(block.next, None);
        assert_eq!(block.prev, None);
    }

    #[test]
    fn creating_a_block_updates_the_next_blocks_prev_free_flag() {
        let addr = leaked_region(256);
        let heap_end = addr + 2 * MIN_BLOCK_SIZE;

        let second_addr = addr + MIN_BLOCK_SIZE;
        unsafe { UsedBlock::create(second_addr, MIN_BLOCK_SIZE, false, heap_end) };

        unsafe { FreeBlock::create(addr, MIN_BLOCK_SIZE, false, heap_end) };
        let second = unsafe { UsedBlock::from_addr(second_addr) };
        assert!(second.prev_free());

        unsafe { UsedBlock::create(addr, MIN_BLOCK_SIZE, false, heap_end) };
        let second = unsafe { UsedBlock::from_addr(second_addr) };
        assert!(!second.prev_free());
    }

    #[test]
    fn backward_traversal_through_the_footer() {
        let addr = leaked_region(256);
        let heap_end = addr + 2 * MIN_BLOCK_SIZE;

        unsafe { FreeBlock::create(addr, MIN_BLOCK_SIZE, false, heap_end) };
        let second =
            unsafe { UsedBlock::create(addr + MIN_BLOCK_SIZE, MIN_BLOCK_SIZE, true, heap_end) };

        let prev = second.prev_block_if_free(addr).expect("prev should be free");
        assert_eq!(prev.addr(), addr);
        assert_eq!(prev.size(), MIN_BLOCK_SIZE);
    }

    #[test]
    fn from_addr_dispatches_on_the_used_flag() {
        let addr = leaked_region(256);
        let heap_end = addr + MIN_BLOCK_SIZE;

        unsafe { UsedBlock::create(addr, MIN_BLOCK_SIZE, false, heap_end) };
        assert!(matches!(
            unsafe { Block::from_addr(addr) },
            BlockRef::Used(_)
        ));

        unsafe { FreeBlock::create(addr, MIN_BLOCK_SIZE, false, heap_end) };
        assert!(matches!(
            unsafe { Block::from_addr(addr) },
            BlockRef::Free(_)
        ));
    }

    #[test]
    fn the_sentinel_reads_as_a_used_zero_sized_block() {
        let addr = leaked_region(64);
        unsafe { Block::write_sentinel(addr, false) };

        let header = unsafe { Block::header_at(addr) };
        assert_eq!(header.size(), 0);
        assert!(!header.is_free());
        assert!(!header.prev_free());
    }
}
