// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Host memory used by the archive and the binding objects.
//!
//! Nothing here touches GPU memory. There are two allocation strategies, both layered on top of
//! a [`RawAllocator`]:
//!
//! - [`FixedLinearAllocator`] computes the size of a group of arrays up front, allocates them as
//!   a single block and hands out the arrays sequentially. It is used for scratch storage when
//!   reading an archive and for the per-stage manager array of a shader resource binding.
//! - [`BlockPool`] hands out fixed-size blocks and is shared between threads. Every resource
//!   signature keeps a set of pools that the resource caches and variable managers of its
//!   shader resource bindings allocate from.

pub use self::{
    linear::{FixedLinearAllocator, LinearBlock},
    pool::BlockPool,
};
pub(crate) use self::pool::PooledArray;
use std::{
    alloc::Layout,
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    ptr::NonNull,
};

pub mod linear;
pub mod pool;

/// Source of raw host memory.
///
/// # Safety
///
/// - A pointer returned by `allocate` must be valid for reads and writes of `layout.size()`
///   bytes, aligned to `layout.align()`, and must stay valid until it is passed to `deallocate`.
/// - Two live allocations must never overlap.
pub unsafe trait RawAllocator: Debug + Send + Sync {
    /// Allocates a block of memory. `layout` never has a size of zero.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocationError>;

    /// Frees a block previously returned by `allocate` with the same `layout`.
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by `self.allocate(layout)` and not freed since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A [`RawAllocator`] that uses the global allocator.
///
/// Running out of memory is fatal: the process is aborted through
/// [`std::alloc::handle_alloc_error`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRawAllocator;

unsafe impl RawAllocator for DefaultRawAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocationError> {
        debug_assert!(layout.size() != 0);

        // SAFETY: The caller guarantees that the layout is not zero-sized.
        let ptr = unsafe { std::alloc::alloc(layout) };

        match NonNull::new(ptr) {
            Some(ptr) => Ok(ptr),
            None => std::alloc::handle_alloc_error(layout),
        }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Ensured by the caller.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Error that can happen when allocating host memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// The raw allocator could not satisfy a request for `size` bytes with the given alignment.
    OutOfHostMemory { size: usize, align: usize },

    /// The total size of the requested arrays does not fit in the address space.
    LayoutOverflow,
}

impl Error for AllocationError {}

impl Display for AllocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::OutOfHostMemory { size, align } => write!(
                f,
                "failed to allocate {} bytes of host memory with an alignment of {}",
                size, align,
            ),
            Self::LayoutOverflow => write!(f, "the requested allocation size overflows"),
        }
    }
}

/// Rounds `val` up to a multiple of `alignment`, which must be a power of two.
#[inline]
pub(crate) const fn align_up(val: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());

    match val.checked_add(alignment - 1) {
        Some(val) => Some(val & !(alignment - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(8, 8), Some(8));
        assert_eq!(align_up(13, 4), Some(16));
        assert_eq!(align_up(usize::MAX, 2), None);
    }

    #[test]
    fn default_allocator_round_trip() {
        let layout = Layout::from_size_align(64, 16).unwrap();
        let ptr = DefaultRawAllocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        unsafe { DefaultRawAllocator.deallocate(ptr, layout) };
    }
}
