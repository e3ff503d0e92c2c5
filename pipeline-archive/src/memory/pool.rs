// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{AllocationError, RawAllocator};
use crate::macros::impl_id_counter;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::{
    alloc::Layout,
    fmt::{Debug, Error as FmtError, Formatter},
    mem,
    num::NonZero,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    slice,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// A thread-safe pool of equally sized blocks of host memory.
///
/// Blocks are carved out of pages that hold `blocks_per_page` blocks each. A new page is
/// allocated whenever the pool runs dry, and pages are only returned to the raw allocator when
/// the pool is dropped.
pub struct BlockPool {
    id: NonZero<u64>,
    allocator: Arc<dyn RawAllocator>,
    block_layout: Layout,
    // `None` if a page would overflow the address space.
    page_layout: Option<Layout>,
    blocks_per_page: usize,
    // Blocks that are ready to be handed out. Freed blocks are pushed back here.
    reserve: SegQueue<Block>,
    pages: Mutex<Vec<Block>>,
    outstanding: AtomicUsize,
}

struct Block(NonNull<u8>);

// SAFETY: A block is plain memory, owned by whoever popped it from the reserve.
unsafe impl Send for Block {}

impl BlockPool {
    /// Creates a new `BlockPool` handing out blocks of `block_layout`.
    ///
    /// The size of the blocks is rounded up to their alignment so that pages can be split evenly.
    /// `blocks_per_page` is clamped to at least 1.
    pub fn new(
        allocator: Arc<dyn RawAllocator>,
        block_layout: Layout,
        blocks_per_page: u32,
    ) -> Self {
        let block_layout = block_layout.pad_to_align();
        let blocks_per_page = blocks_per_page.max(1) as usize;
        let page_layout = block_layout
            .size()
            .checked_mul(blocks_per_page)
            .and_then(|size| Layout::from_size_align(size, block_layout.align()).ok());

        BlockPool {
            id: Self::next_id(),
            allocator,
            block_layout,
            page_layout,
            blocks_per_page,
            reserve: SegQueue::new(),
            pages: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Returns the layout of the blocks handed out by the pool.
    #[inline]
    pub fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// Returns the number of blocks that are allocated by each page.
    #[inline]
    pub fn blocks_per_page(&self) -> usize {
        self.blocks_per_page
    }

    /// Returns the number of blocks that are currently handed out.
    #[inline]
    pub fn outstanding_blocks(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Returns the number of pages the pool has allocated.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Hands out a block, allocating a new page if there are none left.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocationError> {
        if self.block_layout.size() == 0 {
            self.outstanding.fetch_add(1, Ordering::AcqRel);

            return Ok(NonNull::new(self.block_layout.align() as *mut u8)
                .unwrap_or(NonNull::dangling()));
        }

        loop {
            if let Some(Block(ptr)) = self.reserve.pop() {
                self.outstanding.fetch_add(1, Ordering::AcqRel);

                return Ok(ptr);
            }

            // Another thread may grow the pool at the same time, in which case we end up with a
            // spare page. That's fine.
            self.grow()?;
        }
    }

    fn grow(&self) -> Result<(), AllocationError> {
        let page_layout = self.page_layout.ok_or(AllocationError::LayoutOverflow)?;
        let page = self.allocator.allocate(page_layout)?;

        for index in 0..self.blocks_per_page {
            // SAFETY: `index * block_size` is within the page.
            let block = unsafe { page.add(index * self.block_layout.size()) };
            self.reserve.push(Block(block));
        }

        self.pages.lock().push(Block(page));

        Ok(())
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by `self.allocate()` and not returned since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if self.block_layout.size() != 0 {
            self.reserve.push(Block(ptr));
        }
    }
}

impl_id_counter!(BlockPool);

impl Drop for BlockPool {
    fn drop(&mut self) {
        let outstanding = *self.outstanding.get_mut();

        if outstanding != 0 {
            log::error!(
                "a block pool was dropped while {} of its blocks were still in use",
                outstanding,
            );
        }

        if let Some(page_layout) = self.page_layout {
            for Block(page) in self.pages.get_mut().drain(..) {
                // SAFETY: Every page was allocated by `self.allocator` with `page_layout`.
                unsafe { self.allocator.deallocate(page, page_layout) };
            }
        }
    }
}

impl Debug for BlockPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("BlockPool")
            .field("block_layout", &self.block_layout)
            .field("blocks_per_page", &self.blocks_per_page)
            .field("outstanding_blocks", &self.outstanding_blocks())
            .finish_non_exhaustive()
    }
}

/// An array stored in a single block of a [`BlockPool`].
///
/// The array doesn't keep the pool alive and doesn't free itself. It must be given back with
/// [`destroy`], otherwise its elements and its block are leaked.
///
/// [`destroy`]: PooledArray::destroy
pub(crate) struct PooledArray<T> {
    ptr: NonNull<T>,
    len: usize,
    pool_id: NonZero<u64>,
}

// SAFETY: The array owns its elements.
unsafe impl<T: Send> Send for PooledArray<T> {}
// SAFETY: Shared access only gives out `&T`.
unsafe impl<T: Sync> Sync for PooledArray<T> {}

impl<T> PooledArray<T> {
    /// Allocates an array of `len` elements from `pool` and initializes element `i` with
    /// `init(i)`.
    ///
    /// # Panics
    ///
    /// - Panics if the blocks of `pool` can't hold `len` values of type `T`.
    pub(crate) fn new(
        pool: &BlockPool,
        len: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<Self, AllocationError> {
        let layout = Layout::array::<T>(len).map_err(|_| AllocationError::LayoutOverflow)?;
        assert!(
            layout.size() <= pool.block_layout().size()
                && layout.align() <= pool.block_layout().align(),
            "the blocks of the pool are too small for an array of {} elements",
            len,
        );

        if len == 0 {
            return Ok(PooledArray {
                ptr: NonNull::dangling(),
                len: 0,
                pool_id: pool.id(),
            });
        }

        let block = pool.allocate()?;
        let mut guard = InitGuard {
            pool,
            block,
            ptr: block.cast::<T>(),
            initialized: 0,
        };

        for index in 0..len {
            let value = init(index);

            // SAFETY: `index < len` and the block holds at least `len` elements.
            unsafe { guard.ptr.add(index).write(value) };
            guard.initialized += 1;
        }

        let ptr = guard.ptr;
        mem::forget(guard);

        Ok(PooledArray {
            ptr,
            len,
            pool_id: pool.id(),
        })
    }

    /// Drops the elements and gives the block back to `pool`.
    ///
    /// # Panics
    ///
    /// - Panics if `pool` is not the pool that the array was allocated from.
    pub(crate) fn destroy(self, pool: &BlockPool) {
        assert_eq!(
            self.pool_id,
            pool.id(),
            "a pooled array must be destroyed through the pool it was allocated from",
        );

        if self.len == 0 {
            return;
        }

        let elements = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);

        // SAFETY: All elements are initialized and are never accessed again.
        unsafe { ptr::drop_in_place(elements) };

        // SAFETY: The block was allocated from `pool`, which was checked above.
        unsafe { pool.deallocate(self.ptr.cast()) };
    }
}

impl<T> Deref for PooledArray<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        // SAFETY: The first `len` elements are initialized.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for PooledArray<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: The first `len` elements are initialized, and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Debug> Debug for PooledArray<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_list().entries(self.iter()).finish()
    }
}

struct InitGuard<'a, T> {
    pool: &'a BlockPool,
    block: NonNull<u8>,
    ptr: NonNull<T>,
    initialized: usize,
}

impl<T> Drop for InitGuard<'_, T> {
    fn drop(&mut self) {
        let prefix = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.initialized);

        // SAFETY: The first `initialized` elements were written.
        unsafe { ptr::drop_in_place(prefix) };

        // SAFETY: The block was allocated from this pool.
        unsafe { self.pool.deallocate(self.block) };
    }
}
