// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Allocation of a group of arrays as a single block.
//!
//! Using a [`FixedLinearAllocator`] is a three step process:
//!
//! 1. Every array that will be needed is declared with [`add_space`]. Nothing is allocated yet.
//! 2. [`reserve`] allocates one block that is large enough for all of the declared arrays.
//! 3. The arrays are handed out with [`allocate`] or [`construct_array`], in the same order in
//!    which they were declared.
//!
//! The allocator never runs destructors of the values it hands out. When it is dropped the block
//! is freed, unless ownership of the block was taken with [`release_ownership`].
//!
//! [`add_space`]: FixedLinearAllocator::add_space
//! [`reserve`]: FixedLinearAllocator::reserve
//! [`allocate`]: FixedLinearAllocator::allocate
//! [`construct_array`]: FixedLinearAllocator::construct_array
//! [`release_ownership`]: FixedLinearAllocator::release_ownership

use super::{align_up, AllocationError, RawAllocator};
use bytemuck::Zeroable;
use std::{
    alloc::Layout,
    cell::{Cell, RefCell},
    fmt::{Debug, Error as FmtError, Formatter},
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
    slice,
    sync::Arc,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Accumulating,
    Reserved,
    Released,
}

/// Allocates a group of arrays as a single block of memory.
///
/// All methods take `&self` so that arrays handed out earlier can be held on to while later ones
/// are allocated. The allocator is therefore not `Sync`; every user keeps its own.
pub struct FixedLinearAllocator {
    allocator: Arc<dyn RawAllocator>,
    state: Cell<State>,
    // `None` once the accumulated size has overflowed.
    size: Cell<Option<usize>>,
    align: Cell<usize>,
    data: Cell<NonNull<u8>>,
    cursor: Cell<usize>,
    // Every non-empty request, to check that allocations happen in the order of declaration.
    requests: RefCell<Vec<Layout>>,
    next_request: Cell<usize>,
}

impl FixedLinearAllocator {
    /// Creates a new `FixedLinearAllocator` that gets its block from `allocator`.
    #[inline]
    pub fn new(allocator: Arc<dyn RawAllocator>) -> Self {
        FixedLinearAllocator {
            allocator,
            state: Cell::new(State::Accumulating),
            size: Cell::new(Some(0)),
            align: Cell::new(1),
            data: Cell::new(NonNull::dangling()),
            cursor: Cell::new(0),
            requests: RefCell::new(Vec::new()),
            next_request: Cell::new(0),
        }
    }

    /// Declares an array of `count` values of type `T`.
    ///
    /// # Panics
    ///
    /// - Panics if the block has already been reserved.
    pub fn add_space<T>(&self, count: usize) {
        assert_eq!(
            self.state.get(),
            State::Accumulating,
            "space can only be added before the block is reserved",
        );

        if count == 0 {
            return;
        }

        let layout = Layout::array::<T>(count).ok();
        let size = self.size.get().zip(layout).and_then(|(size, layout)| {
            align_up(size, layout.align())?.checked_add(layout.size())
        });

        self.size.set(size);
        self.align.set(self.align.get().max(mem::align_of::<T>()));

        if let Some(layout) = layout {
            self.requests.borrow_mut().push(layout);
        }
    }

    /// Declares storage for a copy of `string`.
    #[inline]
    pub fn add_space_for_string(&self, string: &str) {
        self.add_space::<u8>(string.len());
    }

    /// Allocates the block. After this, no more space can be added.
    ///
    /// If nothing was declared, no memory is allocated.
    ///
    /// # Panics
    ///
    /// - Panics if the block has already been reserved.
    pub fn reserve(&self) -> Result<(), AllocationError> {
        assert_eq!(
            self.state.get(),
            State::Accumulating,
            "the block can only be reserved once",
        );

        let layout = self.layout()?;

        if layout.size() != 0 {
            let data = self.allocator.allocate(layout)?;
            self.data.set(data);
        } else {
            // Dangling, but aligned for every declared type.
            self.data
                .set(NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling()));
        }

        self.state.set(State::Reserved);

        Ok(())
    }

    fn layout(&self) -> Result<Layout, AllocationError> {
        let size = self.size.get().ok_or(AllocationError::LayoutOverflow)?;

        Layout::from_size_align(size, self.align.get())
            .map_err(|_| AllocationError::LayoutOverflow)
    }

    /// Returns whether [`reserve`] has been called successfully.
    ///
    /// [`reserve`]: Self::reserve
    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.state.get() == State::Reserved
    }

    /// Returns the total size of the declared arrays, including alignment padding.
    #[inline]
    pub fn reserved_size(&self) -> usize {
        self.size.get().unwrap_or(usize::MAX)
    }

    /// Hands out the next array of `count` uninitialized values of type `T`.
    ///
    /// # Panics
    ///
    /// - Panics if the block is not reserved.
    /// - Panics if the array does not fit in the remaining space of the block.
    /// - In debug builds, panics if the array does not match the next declared array.
    #[allow(clippy::mut_from_ref)]
    pub fn allocate<T>(&self, count: usize) -> &mut [MaybeUninit<T>] {
        assert_eq!(
            self.state.get(),
            State::Reserved,
            "arrays can only be allocated from a reserved block",
        );

        if count == 0 {
            return &mut [];
        }

        let layout = Layout::array::<T>(count).ok();

        #[cfg(debug_assertions)]
        {
            let index = self.next_request.get();
            let requests = self.requests.borrow();
            assert!(
                index < requests.len(),
                "more arrays are allocated than were declared",
            );
            assert_eq!(
                Some(requests[index]),
                layout,
                "arrays must be allocated in the order in which they were declared",
            );
        }

        self.next_request.set(self.next_request.get() + 1);

        let offset = align_up(self.cursor.get(), mem::align_of::<T>());
        let end = offset.zip(layout).and_then(|(offset, layout)| {
            offset
                .checked_add(layout.size())
                .map(|end| (offset, end))
        });
        let (offset, end) = match end {
            Some((offset, end)) if end <= self.reserved_size() => (offset, end),
            _ => panic!("the allocation exceeds the space that was reserved"),
        };

        self.cursor.set(end);

        // SAFETY: `offset..end` lies within the reserved block, and was not handed out before
        // because the cursor only moves forward.
        let ptr = unsafe { self.data.get().as_ptr().add(offset) };

        // SAFETY: The memory is valid for `count` values of `T` and is aligned for `T`, because
        // the block is aligned for the strictest declared type and `offset` is aligned for `T`.
        unsafe { slice::from_raw_parts_mut(ptr.cast::<MaybeUninit<T>>(), count) }
    }

    /// Hands out the next array of `count` zeroed values of type `T`.
    #[allow(clippy::mut_from_ref)]
    pub fn allocate_zeroed<T: Zeroable>(&self, count: usize) -> &mut [T] {
        let slots = self.allocate::<T>(count);

        for slot in slots.iter_mut() {
            slot.write(T::zeroed());
        }

        // SAFETY: Every element was initialized above.
        unsafe { slice::from_raw_parts_mut(slots.as_mut_ptr().cast::<T>(), slots.len()) }
    }

    /// Copies `src` into the next array.
    #[allow(clippy::mut_from_ref)]
    pub fn copy_slice<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let slots = self.allocate::<T>(src.len());

        for (slot, &value) in slots.iter_mut().zip(src) {
            slot.write(value);
        }

        // SAFETY: Every element was initialized above.
        unsafe { slice::from_raw_parts_mut(slots.as_mut_ptr().cast::<T>(), slots.len()) }
    }

    /// Copies `string` into the next array.
    pub fn copy_str(&self, string: &str) -> &str {
        let bytes = self.copy_slice(string.as_bytes());

        // SAFETY: The bytes were copied from a `str`.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Hands out the next array of `count` values, constructing element `i` with `ctor(i)`.
    ///
    /// If `ctor` returns an error or panics, the elements that were constructed so far are
    /// dropped in place before the error is returned. The space of the array stays consumed and
    /// the rest of the block is left intact.
    #[allow(clippy::mut_from_ref)]
    pub fn construct_array<T, E>(
        &self,
        count: usize,
        mut ctor: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<&mut [T], E> {
        let slots = self.allocate::<T>(count);
        let mut guard = PrefixGuard {
            ptr: slots.as_mut_ptr().cast::<T>(),
            initialized: 0,
        };

        for index in 0..count {
            let value = ctor(index)?;

            // SAFETY: `index < count`, so the slot is inside the array.
            unsafe { guard.ptr.add(index).write(value) };
            guard.initialized += 1;
        }

        mem::forget(guard);

        // SAFETY: Every element was initialized above.
        Ok(unsafe { slice::from_raw_parts_mut(slots.as_mut_ptr().cast::<T>(), count) })
    }

    /// Takes ownership of the block.
    ///
    /// The arrays that were handed out remain valid for as long as the returned block lives. The
    /// allocator can't be used anymore afterwards.
    ///
    /// # Panics
    ///
    /// - Panics if the block is not reserved.
    pub fn release_ownership(&mut self) -> LinearBlock {
        assert_eq!(
            self.state.get(),
            State::Reserved,
            "only a reserved block can be released",
        );

        self.state.set(State::Released);

        // The layout was validated by `reserve`.
        let layout = self.layout().ok().filter(|layout| layout.size() != 0);

        LinearBlock {
            allocator: self.allocator.clone(),
            ptr: self.data.get(),
            layout,
        }
    }
}

impl Drop for FixedLinearAllocator {
    fn drop(&mut self) {
        if self.state.get() != State::Reserved {
            return;
        }

        if let Ok(layout) = self.layout() {
            if layout.size() != 0 {
                // SAFETY: The block was allocated with this layout in `reserve`, and ownership
                // was not released.
                unsafe { self.allocator.deallocate(self.data.get(), layout) };
            }
        }
    }
}

impl Debug for FixedLinearAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("FixedLinearAllocator")
            .field("state", &self.state.get())
            .field("size", &self.size.get())
            .field("align", &self.align.get())
            .field("cursor", &self.cursor.get())
            .finish_non_exhaustive()
    }
}

struct PrefixGuard<T> {
    ptr: *mut T,
    initialized: usize,
}

impl<T> Drop for PrefixGuard<T> {
    fn drop(&mut self) {
        let prefix = ptr::slice_from_raw_parts_mut(self.ptr, self.initialized);

        // SAFETY: The first `initialized` elements were written and not yet dropped.
        unsafe { ptr::drop_in_place(prefix) };
    }
}

/// A block of memory released by a [`FixedLinearAllocator`].
///
/// The block is returned to the allocator that produced it when dropped. Values stored inside it
/// are not dropped.
pub struct LinearBlock {
    allocator: Arc<dyn RawAllocator>,
    ptr: NonNull<u8>,
    // `None` if nothing was allocated.
    layout: Option<Layout>,
}

// SAFETY: The block is plain memory that is exclusively owned.
unsafe impl Send for LinearBlock {}
// SAFETY: `LinearBlock` offers no access to the memory through a shared reference.
unsafe impl Sync for LinearBlock {}

impl LinearBlock {
    /// Returns a pointer to the start of the block.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size of the block in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.map_or(0, |layout| layout.size())
    }
}

impl Drop for LinearBlock {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: The block was allocated by `self.allocator` with `layout`.
            unsafe { self.allocator.deallocate(self.ptr, layout) };
        }
    }
}

impl Debug for LinearBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("LinearBlock")
            .field("ptr", &self.ptr)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
