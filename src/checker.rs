use core::fmt;

use crate::{
    alignment::is_aligned, blocks::FreeBlock, boundary_tag::BoundaryTag, Heap, ALIGNMENT,
    MIN_BLOCK_SIZE,
};

/// An invariant violation found by [`Heap::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// A block's size decoded as zero.
    ZeroSizeBlock { addr: usize },
    /// A block's size is not a multiple of the alignment unit.
    MisalignedSize { addr: usize, size: usize },
    /// A block is smaller than the minimum block size.
    UndersizedBlock { addr: usize, size: usize },
    /// A block extends past the end of the heap, or the blocks do not tile
    /// the region exactly.
    BlockPastHeapEnd { addr: usize, end_addr: usize },
    /// A free block's footer does not mirror its header.
    FooterMismatch { addr: usize },
    /// A block's `prev_free` flag disagrees with the actual status of its
    /// physical predecessor.
    PrevFreeMismatch { addr: usize },
    /// Two physically adjacent blocks are both free.
    AdjacentFreeBlocks { addr: usize },
    /// A block is tagged free but does not appear exactly once in the free
    /// list.
    FreeBlockNotInList { addr: usize },
    /// A free-list entry does not point at a free block inside the heap.
    ListEntryNotFree { addr: usize },
    /// The free list holds a different number of blocks than the heap walk
    /// found free.
    ListLengthMismatch { in_list: usize, in_heap: usize },
    /// The sentinel word at the end of the heap was overwritten.
    SentinelClobbered,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CheckError::ZeroSizeBlock { addr } => {
                write!(f, "block at {addr:#x} has a zero size")
            }
            CheckError::MisalignedSize { addr, size } => {
                write!(f, "block at {addr:#x} has misaligned size {size}")
            }
            CheckError::UndersizedBlock { addr, size } => {
                write!(f, "block at {addr:#x} has undersized size {size}")
            }
            CheckError::BlockPastHeapEnd { addr, end_addr } => {
                write!(f, "block at {addr:#x} ends at {end_addr:#x}, past the heap end")
            }
            CheckError::FooterMismatch { addr } => {
                write!(f, "free block at {addr:#x} has a footer that differs from its header")
            }
            CheckError::PrevFreeMismatch { addr } => write!(
                f,
                "block at {addr:#x} disagrees with its predecessor about the prev-free flag"
            ),
            CheckError::AdjacentFreeBlocks { addr } => {
                write!(f, "block at {addr:#x} and its predecessor are both free")
            }
            CheckError::FreeBlockNotInList { addr } => write!(
                f,
                "free block at {addr:#x} does not appear exactly once in the free list"
            ),
            CheckError::ListEntryNotFree { addr } => {
                write!(f, "free list entry at {addr:#x} is not a free block in the heap")
            }
            CheckError::ListLengthMismatch { in_list, in_heap } => write!(
                f,
                "free list holds {in_list} blocks but the heap walk found {in_heap}"
            ),
            CheckError::SentinelClobbered => {
                f.write_str("the sentinel word at the heap end was overwritten")
            }
        }
    }
}

/// Aggregate numbers collected by a successful [`Heap::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

/// One block as seen by a heap traversal.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub size: usize,
    pub used: bool,
    pub prev_free: bool,
}

impl fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}: {} bytes, {}{}",
            self.addr,
            self.size,
            if self.used { "used" } else { "free" },
            if self.prev_free { ", prev free" } else { "" },
        )
    }
}

/// An iterator over the physical blocks of a heap, in address order.
///
/// The traversal stops early at the first block whose size decodes as zero,
/// so it terminates even on a corrupted heap; [`Heap::check`] is the place
/// where corruption is actually diagnosed.
pub struct Blocks {
    cur: usize,
    heap_end_addr: usize,
}

impl Iterator for Blocks {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.cur >= self.heap_end_addr {
            return None;
        }

        let tag = BoundaryTag::decode(unsafe { *(self.cur as *const usize) });
        let info = BlockInfo {
            addr: self.cur,
            size: tag.size,
            used: tag.used,
            prev_free: tag.prev_free,
        };

        if tag.size == 0 {
            self.cur = self.heap_end_addr;
        } else {
            self.cur += tag.size;
        }
        Some(info)
    }
}

impl<E> Heap<E> {
    /// Iterates over the physical blocks of the heap, in address order.
    pub fn blocks(&self) -> Blocks {
        Blocks {
            cur: self.heap_start_addr,
            heap_end_addr: self.heap_end_addr,
        }
    }

    /// Validates every heap invariant with a full traversal.
    ///
    /// Checked per block: a positive, alignment-valid size of at least the
    /// minimum block size; exact tiling of the region (the last block ends
    /// exactly at the heap end); a footer mirroring the header on free
    /// blocks; a `prev_free` flag matching the predecessor's actual status;
    /// no two adjacent free blocks; and exactly-once free-list membership
    /// for free blocks. The free list is then walked to rule out entries
    /// the heap walk did not see, and the sentinel word is verified intact.
    ///
    /// This is a diagnostic: it is meant to run under test harnesses after
    /// every mutating operation, never on the allocation fast path.
    pub fn check(&self) -> Result<HeapStats, CheckError> {
        if !self.was_initialized() {
            return Ok(HeapStats::default());
        }

        let sentinel = BoundaryTag::decode(unsafe { *(self.heap_end_addr as *const usize) });
        if sentinel.size != 0 || !sentinel.used {
            return Err(CheckError::SentinelClobbered);
        }

        let mut stats = HeapStats::default();
        let mut free_in_heap = 0usize;
        let mut prev_was_free = false;
        let mut addr = self.heap_start_addr;

        while addr < self.heap_end_addr {
            let tag = BoundaryTag::decode(unsafe { *(addr as *const usize) });

            if tag.size == 0 {
                return Err(CheckError::ZeroSizeBlock { addr });
            }
            if !is_aligned(tag.size, ALIGNMENT) {
                return Err(CheckError::MisalignedSize {
                    addr,
                    size: tag.size,
                });
            }
            if tag.size < MIN_BLOCK_SIZE {
                return Err(CheckError::UndersizedBlock {
                    addr,
                    size: tag.size,
                });
            }

            let end_addr = addr + tag.size;
            if end_addr > self.heap_end_addr {
                return Err(CheckError::BlockPastHeapEnd { addr, end_addr });
            }

            if tag.prev_free != prev_was_free {
                return Err(CheckError::PrevFreeMismatch { addr });
            }

            if tag.used {
                stats.used_blocks += 1;
                stats.used_bytes += tag.size;
            } else {
                if prev_was_free {
                    return Err(CheckError::AdjacentFreeBlocks { addr });
                }

                let footer = unsafe { FreeBlock::from_addr(addr) }.footer();
                if footer != tag {
                    return Err(CheckError::FooterMismatch { addr });
                }

                let occurrences = self
                    .free_list
                    .iter()
                    .filter(|ptr| ptr.as_ptr() as usize == addr)
                    .count();
                if occurrences != 1 {
                    return Err(CheckError::FreeBlockNotInList { addr });
                }

                free_in_heap += 1;
                stats.free_blocks += 1;
                stats.free_bytes += tag.size;
            }

            prev_was_free = !tag.used;
            addr = end_addr;
        }
        // the loop exits with addr == heap_end exactly, so the blocks tile
        // the region with no gaps and no overlaps

        if sentinel.prev_free != prev_was_free {
            return Err(CheckError::PrevFreeMismatch {
                addr: self.heap_end_addr,
            });
        }

        let mut in_list = 0usize;
        for ptr in self.free_list.iter() {
            let entry_addr = ptr.as_ptr() as usize;
            if entry_addr < self.heap_start_addr || entry_addr >= self.heap_end_addr {
                return Err(CheckError::ListEntryNotFree { addr: entry_addr });
            }
            let tag = BoundaryTag::decode(unsafe { *(entry_addr as *const usize) });
            if tag.used {
                return Err(CheckError::ListEntryNotFree { addr: entry_addr });
            }

            in_list += 1;
            if in_list > free_in_heap {
                // a cycle or a duplicate; the length comparison below reports it
                break;
            }
        }
        if in_list != free_in_heap {
            return Err(CheckError::ListLengthMismatch {
                in_list,
                in_heap: free_in_heap,
            });
        }

        Ok(stats)
    }
}

impl<E> fmt::Debug for Heap<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Heap");
        s.field(
            "heap_start_addr",
            &format_args!("{:#x}", self.heap_start_addr),
        );
        s.field("heap_end_addr", &format_args!("{:#x}", self.heap_end_addr));
        s.field("blocks", &DebugBlocks(self));
        s.finish()
    }
}

struct DebugBlocks<'a, E>(&'a Heap<E>);

impl<E> fmt::Debug for DebugBlocks<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.blocks()).finish()
    }
}
