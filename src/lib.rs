#![no_std]

//! This is a best-fit, eagerly coalescing memory allocator with optimized
//! boundary tags, to be used in `no_std` environments such as operating
//! system kernels. The overhead for each allocation is a single `usize`:
//! used blocks carry only a header word, while free blocks mirror the header
//! in a footer and keep their free-list links inside the reclaimed payload.
//! Adjacent free blocks are merged the moment they appear, so no two free
//! blocks ever touch, and reallocation grows in place whenever a free
//! neighbor or the end of the heap allows it.
//!
//! The heap is one contiguous region that only grows forward. More backing
//! memory is requested on demand from a [`HeapExtender`], an sbrk-like
//! collaborator; the crate ships [`ArenaExtender`], which serves a fixed
//! caller-provided region.
//!
//! ## Usage
//!
//! Create a static allocator:
//!
//! ```ignore
//! use boundary_tag_allocator::{ArenaExtender, SpinLockedHeap};
//!
//! #[global_allocator]
//! static ALLOCATOR: SpinLockedHeap<ArenaExtender> = SpinLockedHeap::empty();
//! ```
//!
//! Before using this allocator, you need to initialize it:
//!
//! ```ignore
//! pub fn init_heap() {
//!     unsafe {
//!         ALLOCATOR
//!             .init(ArenaExtender::new(heap_start, heap_size))
//!             .expect("failed to initialize the heap");
//!     }
//! }
//! ```
//!
//! ## Concurrency
//!
//! The core [`Heap`] is a single-mutator design: no internal locking, no
//! atomics. Every operation mutates several heap words non-atomically, so
//! concurrent callers must serialize behind one exclusive lock —
//! [`SpinLockedHeap`] is exactly that lock.
//!
//! ## Features
//!
//! - **`spin`** (default): Provide a [`SpinLockedHeap`] type that implements
//!   the `GlobalAlloc` trait by using a spinlock.

#[cfg(test)]
#[macro_use]
extern crate std;

mod alignment;
mod blocks;
mod boundary_tag;
mod checker;
mod extend;
mod free_list;

#[cfg(test)]
mod tests;

use core::ptr::NonNull;

use alignment::*;
use blocks::*;
pub use checker::{BlockInfo, Blocks, CheckError, HeapStats};
pub use extend::{ArenaExtender, HeapExtender};
use free_list::FreeList;

const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// The alignment unit of the heap: payload addresses and block sizes are
/// always multiples of this.
// IMPORTANT:
// `ALIGNMENT` must be at least 4, so that the two low bits of a rounded size
// are free to hold the tag's flag bits.
pub const ALIGNMENT: usize = 2 * WORD_SIZE;

/// The smallest legal block: header word, two free-list link fields and a
/// footer word. Requests that would round below this are rounded up to it.
pub const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeBlock>() + WORD_SIZE;

/// The initial extension: room to align the first payload address plus the
/// sentinel word. The slack behind the sentinel stays committed for the
/// lifetime of the heap, which is what lets later extensions advance the
/// sentinel by exact deltas.
const INIT_HEAP_SIZE: usize = 2 * ALIGNMENT;

/// Failure to initialize a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// `init` was already called on this heap.
    AlreadyInitialized,
    /// The extension collaborator could not commit the initial region.
    ExtendFailed,
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InitError::AlreadyInitialized => f.write_str("the heap was already initialized"),
            InitError::ExtendFailed => {
                f.write_str("could not commit backing memory for the initial heap region")
            }
        }
    }
}

/// A boundary-tag heap allocator over a contiguous, growable region.
///
/// The heap is owned by this context object; independent heaps are just
/// independent `Heap` values. The region runs from `heap_start_addr` to
/// `heap_end_addr`, where a used, zero-payload sentinel word terminates
/// traversal and blocks coalescing past the end.
pub struct Heap<E> {
    extender: Option<E>,
    heap_start_addr: usize,
    heap_end_addr: usize,
    free_list: FreeList,
}

impl<E> Heap<E> {
    /// Creates an empty heap allocator without any backing memory, which
    /// will return `None` on allocation requests.
    ///
    /// To initialize this allocator, use the `init` method.
    pub const fn empty() -> Self {
        Self {
            extender: None,
            heap_start_addr: 0,
            heap_end_addr: 0,
            free_list: FreeList::new(),
        }
    }

    /// Checks if the heap was already initialized by calling `init`.
    pub fn was_initialized(&self) -> bool {
        self.heap_end_addr != 0
    }
}

impl<E: HeapExtender> Heap<E> {
    /// Initializes the heap with the given extension collaborator.
    ///
    /// The initial region is committed immediately: the first payload
    /// address is aligned to [`ALIGNMENT`] and the sentinel word is planted
    /// at the end of the (still empty) heap. On failure nothing is mutated.
    pub fn init(&mut self, mut extender: E) -> Result<(), InitError> {
        if self.was_initialized() {
            return Err(InitError::AlreadyInitialized);
        }

        let base = extender
            .extend(INIT_HEAP_SIZE)
            .ok_or(InitError::ExtendFailed)?;

        // place the first header word so that the payload right after it is
        // aligned
        let start = align_up(base + WORD_SIZE, ALIGNMENT) - WORD_SIZE;
        unsafe { Block::write_sentinel(start, false) };

        self.extender = Some(extender);
        self.heap_start_addr = start;
        self.heap_end_addr = start;
        Ok(())
    }

    /// Allocates `size` bytes. The returned payload address is aligned to
    /// [`ALIGNMENT`].
    ///
    /// The free list is searched with best fit; the winning block is split
    /// when the leftover can host a block of its own. When no free block
    /// fits, the heap is extended by exactly the required size. Returns
    /// `None` when backing memory is exhausted, in which case the heap is
    /// left untouched.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.was_initialized() {
            return None;
        }

        let required = Self::required_block_size(size)?;

        let payload_addr = match self.find_fit(required) {
            Some(mut ptr) => {
                let block = unsafe { ptr.as_mut() };
                let addr = block.addr();
                let block_size = block.size();
                let prev_free = block.prev_free();

                // off the list before the tag changes hands
                unsafe { self.free_list.remove(block) };
                unsafe { self.place_used(addr, block_size, required, prev_free) };

                addr + WORD_SIZE
            }
            None => {
                let addr = self.extend_heap(required)?;

                // the old sentinel word is still intact at `addr` and carries
                // the status of the block that used to be last
                let prev_free = unsafe { Block::header_at(addr) }.prev_free();
                let block =
                    unsafe { UsedBlock::create(addr, required, prev_free, self.heap_end_addr) };

                block.payload_addr()
            }
        };

        Some(unsafe { NonNull::new_unchecked(payload_addr as *mut u8) })
    }

    /// Allocates a zeroed region of `count * size` bytes.
    ///
    /// An overflowing product fails the allocation rather than saturating:
    /// a saturated request could only ever fail later anyway, after a
    /// pointless extension attempt.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Releases an allocation previously returned from [`Heap::allocate`],
    /// [`Heap::zero_allocate`] or [`Heap::reallocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and must not have been
    /// released since, including through [`Heap::reallocate`].
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let block = UsedBlock::from_payload_addr(ptr.as_ptr() as usize);

        // rewrite the tag free, keeping the left-neighbor status it carried
        let freed = FreeBlock::create(
            block.addr(),
            block.size(),
            block.prev_free(),
            self.heap_end_addr,
        );
        self.coalesce(freed);
    }

    /// Resizes an allocation previously returned from [`Heap::allocate`],
    /// [`Heap::zero_allocate`] or [`Heap::reallocate`].
    ///
    /// A `None` pointer behaves as [`Heap::allocate`]; a zero size behaves
    /// as [`Heap::release`] and returns `None`. Otherwise the strategies are
    /// tried in a fixed order: shrink in place, grow the last block by
    /// moving the end of the heap, absorb both free neighbors, absorb the
    /// left neighbor, absorb the right neighbor, and finally move to a
    /// freshly allocated block. The first `min(old_size, new_size)` payload
    /// bytes are preserved on every path; `None` is returned only when no
    /// strategy can satisfy the request, and the allocation is then left
    /// untouched.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must have been returned by this heap and must not
    /// have been released since.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.allocate(size),
        };
        if size == 0 {
            self.release(ptr);
            return None;
        }

        let block = UsedBlock::from_payload_addr(ptr.as_ptr() as usize);
        let block_addr = block.addr();
        let block_size = block.size();
        let required = Self::required_block_size(size)?;

        // shrink in place, splitting the tail off when it can host a block
        if required <= block_size {
            let prev_free = block.prev_free();
            self.place_used(block_addr, block_size, required, prev_free);
            return Some(ptr);
        }

        // the last block can grow in place by moving the end of the heap
        if block.end_addr() == self.heap_end_addr
            && self.extend_heap(required - block_size).is_some()
        {
            let prev_free = block.prev_free();
            UsedBlock::create(block_addr, required, prev_free, self.heap_end_addr);
            return Some(ptr);
        }
        // a denied extension mutated nothing; an interior strategy below may
        // still fit

        let old_payload_size = block_size - WORD_SIZE;
        let copy_len = core::cmp::min(old_payload_size, size);

        // absorb both free neighbors, moving the payload down
        if let (Some(left), Some(right)) = (
            block.prev_block_if_free(self.heap_start_addr),
            block.next_block_if_free(self.heap_end_addr),
        ) {
            let combined = left.size() + block_size + right.size();
            if combined >= required {
                let left_addr = left.addr();
                let left_payload_addr = left.payload_addr();
                let left_prev_free = left.prev_free();
                self.free_list.remove(left);
                self.free_list.remove(right);

                // the payload has to move before any tag below it is
                // rewritten; source and destination overlap
                core::ptr::copy(ptr.as_ptr(), left_payload_addr as *mut u8, copy_len);
                self.place_used(left_addr, combined, required, left_prev_free);
                return Some(NonNull::new_unchecked(left_payload_addr as *mut u8));
            }
        }

        // absorb only the left neighbor, moving the payload down
        if let Some(left) = block.prev_block_if_free(self.heap_start_addr) {
            let combined = left.size() + block_size;
            if combined >= required {
                let left_addr = left.addr();
                let left_payload_addr = left.payload_addr();
                let left_prev_free = left.prev_free();
                self.free_list.remove(left);

                core::ptr::copy(ptr.as_ptr(), left_payload_addr as *mut u8, copy_len);
                self.place_used(left_addr, combined, required, left_prev_free);
                return Some(NonNull::new_unchecked(left_payload_addr as *mut u8));
            }
        }

        // absorb only the right neighbor, in place
        if let Some(right) = block.next_block_if_free(self.heap_end_addr) {
            let combined = block_size + right.size();
            if combined >= required {
                let prev_free = block.prev_free();
                self.free_list.remove(right);
                self.place_used(block_addr, combined, required, prev_free);
                return Some(ptr);
            }
        }

        // no in-place strategy fits: move to a fresh block
        let new_ptr = self.allocate(size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        self.release(ptr);
        Some(new_ptr)
    }

    /// Rounds a requested payload size up to a legal block size: header
    /// overhead, alignment rounding, and the minimum block size floor.
    /// `None` on arithmetic overflow.
    fn required_block_size(size: usize) -> Option<usize> {
        let total = size.checked_add(WORD_SIZE + ALIGNMENT - 1)?;
        Some(core::cmp::max(align_down(total, ALIGNMENT), MIN_BLOCK_SIZE))
    }

    /// Best-fit search: the smallest free block whose size satisfies
    /// `required`. Ties go to whichever block the list traversal reaches
    /// first.
    fn find_fit(&self, required: usize) -> Option<FreeBlockPtr> {
        let mut best: Option<FreeBlockPtr> = None;
        for ptr in self.free_list.iter() {
            let size = unsafe { ptr.as_ref() }.size();
            if size >= required
                && best.map_or(true, |best_ptr| size < unsafe { best_ptr.as_ref() }.size())
            {
                best = Some(ptr);
            }
        }
        best
    }

    /// Commits `delta` more bytes at the end of the region and advances the
    /// sentinel, returning the address where the appended block may be
    /// placed. On `None` the heap is untouched.
    fn extend_heap(&mut self, delta: usize) -> Option<usize> {
        debug_assert!(is_aligned(delta, ALIGNMENT));

        let extender = self.extender.as_mut()?;
        extender.extend(delta)?;

        let appended_addr = self.heap_end_addr;
        self.heap_end_addr += delta;

        // the old sentinel word keeps carrying the tail block's status until
        // the appended block's tag overwrites it; the new sentinel's
        // prev-free bit is fixed up by that same tag write
        unsafe { Block::write_sentinel(self.heap_end_addr, false) };
        Some(appended_addr)
    }

    /// Writes a used block of `required` bytes at `addr`, splitting the tail
    /// of the `available` span into a free block when it can host one; the
    /// leftover is otherwise kept as internal fragmentation. The split-off
    /// remainder is handed to the coalescer in case its right neighbor is
    /// also free.
    ///
    /// # Safety
    ///
    /// The span `addr..addr + available` must be owned by the caller and not
    /// belong to any free-list entry; both sizes must be rounded, with
    /// `available >= required`.
    unsafe fn place_used(
        &mut self,
        addr: usize,
        available: usize,
        required: usize,
        prev_free: bool,
    ) {
        let leftover = available - required;
        if leftover >= MIN_BLOCK_SIZE {
            UsedBlock::create(addr, required, prev_free, self.heap_end_addr);
            let remainder =
                FreeBlock::create(addr + required, leftover, false, self.heap_end_addr);
            self.coalesce(remainder);
        } else {
            UsedBlock::create(addr, available, prev_free, self.heap_end_addr);
        }
    }

    /// Merges the given just-freed block with its free neighbors and inserts
    /// the result into the free list.
    ///
    /// The left neighbor's status comes from the block's own `prev_free`
    /// flag, the right neighbor's from its tag; each of the four cases is
    /// O(1). Exactly one free-list entry results, sized as the union of the
    /// merged spans, so no two adjacent free blocks survive.
    ///
    /// `block` must already be tagged free and must not be in the free list.
    fn coalesce(&mut self, block: FreeBlockRef) -> FreeBlockRef {
        let left = block.prev_block_if_free(self.heap_start_addr);
        let right = block.next_block_if_free(self.heap_end_addr);

        let merged = match (left, right) {
            // both neighbors used: no merge
            (None, None) => block,
            // absorb the right neighbor into this block
            (None, Some(right)) => {
                let total = block.size() + right.size();
                let prev_free = block.prev_free();
                unsafe {
                    self.free_list.remove(right);
                    FreeBlock::create(block.addr(), total, prev_free, self.heap_end_addr)
                }
            }
            // absorb this block into the left neighbor
            (Some(left), None) => {
                let total = left.size() + block.size();
                let prev_free = left.prev_free();
                unsafe {
                    self.free_list.remove(left);
                    FreeBlock::create(left.addr(), total, prev_free, self.heap_end_addr)
                }
            }
            // absorb this block and the right neighbor into the left
            // neighbor, in one merge
            (Some(left), Some(right)) => {
                let total = left.size() + block.size() + right.size();
                let prev_free = left.prev_free();
                unsafe {
                    self.free_list.remove(left);
                    self.free_list.remove(right);
                    FreeBlock::create(left.addr(), total, prev_free, self.heap_end_addr)
                }
            }
        };

        unsafe { self.free_list.push_front(merged) };
        merged
    }
}

unsafe impl<E: Send> Send for Heap<E> {}

/// A spin locked heap allocator that can be used as the global allocator.
#[cfg(feature = "spin")]
pub struct SpinLockedHeap<E>(spin::Mutex<Heap<E>>);

#[cfg(feature = "spin")]
impl<E: HeapExtender> SpinLockedHeap<E> {
    /// Creates an empty locked heap allocator without any backing memory,
    /// which will return null on allocation requests.
    ///
    /// To initialize this allocator, use the `init` method.
    pub const fn empty() -> Self {
        Self(spin::Mutex::new(Heap::empty()))
    }

    /// Initializes the heap with the given extension collaborator.
    pub fn init(&self, extender: E) -> Result<(), InitError> {
        let mut heap = self.0.lock();
        heap.init(extender)
    }

    /// Checks if the heap was already initialized by calling `init`.
    pub fn was_initialized(&self) -> bool {
        let heap = self.0.lock();
        heap.was_initialized()
    }
}

#[cfg(feature = "spin")]
unsafe impl<E: HeapExtender> core::alloc::GlobalAlloc for SpinLockedHeap<E> {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        // the heap serves one fixed alignment unit
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }

        let mut heap = self.0.lock();
        match heap.allocate(layout.size()) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }

        let mut heap = self.0.lock();
        match heap.zero_allocate(1, layout.size()) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            let mut heap = self.0.lock();
            heap.release(ptr);
        }
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: core::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }

        let mut heap = self.0.lock();
        match heap.reallocate(NonNull::new(ptr), new_size) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }
}
