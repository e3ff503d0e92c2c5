// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    device::DeviceObject,
    memory::{AllocationError, BlockPool, PooledArray},
    pipeline::ShaderResourceVariableType,
};
use std::{
    alloc::Layout,
    fmt::{Debug, Error as FmtError, Formatter},
    sync::Arc,
};

/// The contents of a cache slot.
pub(crate) type Slot = Option<Arc<dyn DeviceObject>>;

/// Who owns a [`ShaderResourceCache`], which determines the slots that may be written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceCacheContentType {
    /// The static resources of a signature. Only static slots are writable.
    Signature,
    /// The resources of a shader resource binding. Only mutable and dynamic slots are
    /// writable; static slots are filled by copying them from the signature.
    Srb,
}

/// A fixed table of resource slots, partitioned into one group per variable type.
pub struct ShaderResourceCache {
    content_type: ResourceCacheContentType,
    group_sizes: [u32; 3],
    group_offsets: [u32; 3],
    slots: Option<PooledArray<Slot>>,
    pool: Option<Arc<BlockPool>>,
}

impl ShaderResourceCache {
    pub(crate) fn new(content_type: ResourceCacheContentType) -> Self {
        ShaderResourceCache {
            content_type,
            group_sizes: [0; 3],
            group_offsets: [0; 3],
            slots: None,
            pool: None,
        }
    }

    /// Returns the layout of the block that a cache with `group_sizes` needs.
    pub(crate) fn block_layout(group_sizes: [u32; 3]) -> Layout {
        let total = group_sizes.iter().map(|&size| size as usize).sum::<usize>();

        Layout::array::<Slot>(total.max(1)).unwrap_or(Layout::new::<Slot>())
    }

    /// Allocates the slots from `pool`. Every slot starts out unbound.
    ///
    /// # Panics
    ///
    /// - Panics if the cache is already initialized.
    pub(crate) fn initialize(
        &mut self,
        pool: &Arc<BlockPool>,
        group_sizes: [u32; 3],
    ) -> Result<(), AllocationError> {
        assert!(
            self.slots.is_none(),
            "a shader resource cache can only be initialized once",
        );

        let mut offset = 0;

        for (group_offset, &size) in self.group_offsets.iter_mut().zip(&group_sizes) {
            *group_offset = offset;
            offset += size;
        }

        let slots = PooledArray::new(pool, offset as usize, |_| None)?;
        self.group_sizes = group_sizes;
        self.slots = Some(slots);
        self.pool = Some(pool.clone());

        Ok(())
    }

    /// Returns who owns the cache.
    #[inline]
    pub fn content_type(&self) -> ResourceCacheContentType {
        self.content_type
    }

    /// Returns whether the slots have been allocated.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.slots.is_some()
    }

    /// Returns the number of slots for variables of `var_type`.
    #[inline]
    pub fn group_size(&self, var_type: ShaderResourceVariableType) -> u32 {
        self.group_sizes[var_type.index()]
    }

    /// Returns whether slots of `var_type` can be written through variables.
    #[inline]
    pub fn is_writable(&self, var_type: ShaderResourceVariableType) -> bool {
        match self.content_type {
            ResourceCacheContentType::Signature => var_type == ShaderResourceVariableType::Static,
            ResourceCacheContentType::Srb => var_type != ShaderResourceVariableType::Static,
        }
    }

    /// Returns the resource bound to slot `offset` of the `var_type` group, if any.
    #[inline]
    pub fn resource(
        &self,
        var_type: ShaderResourceVariableType,
        offset: u32,
    ) -> Option<&Arc<dyn DeviceObject>> {
        let index = self.slot_index(var_type, offset)?;

        self.slots.as_ref()?[index].as_ref()
    }

    /// Returns the number of bound slots in the `var_type` group.
    pub fn bound_count(&self, var_type: ShaderResourceVariableType) -> u32 {
        (0..self.group_size(var_type))
            .filter(|&offset| self.resource(var_type, offset).is_some())
            .count() as u32
    }

    pub(crate) fn slot_mut(
        &mut self,
        var_type: ShaderResourceVariableType,
        offset: u32,
    ) -> Option<&mut Slot> {
        let index = self.slot_index(var_type, offset)?;

        self.slots.as_mut()?.get_mut(index)
    }

    fn slot_index(&self, var_type: ShaderResourceVariableType, offset: u32) -> Option<usize> {
        let group = var_type.index();

        (offset < self.group_sizes[group]).then(|| (self.group_offsets[group] + offset) as usize)
    }

    /// Copies the static group of `src` into the static group of `self`.
    ///
    /// Returns the offsets of the static slots that are unbound in `src`.
    ///
    /// # Panics
    ///
    /// - Panics if the static groups have different sizes.
    pub(crate) fn copy_static_resources(&mut self, src: &ShaderResourceCache) -> Vec<u32> {
        let var_type = ShaderResourceVariableType::Static;
        assert_eq!(
            self.group_size(var_type),
            src.group_size(var_type),
            "the static groups of both caches must have the same size",
        );

        let mut unbound = Vec::new();

        for offset in 0..src.group_size(var_type) {
            let resource = src.resource(var_type, offset).cloned();

            if resource.is_none() {
                unbound.push(offset);
            }

            if let Some(slot) = self.slot_mut(var_type, offset) {
                *slot = resource;
            }
        }

        unbound
    }
}

impl Drop for ShaderResourceCache {
    fn drop(&mut self) {
        if let (Some(slots), Some(pool)) = (self.slots.take(), self.pool.as_ref()) {
            slots.destroy(pool);
        }
    }
}

impl Debug for ShaderResourceCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ShaderResourceCache")
            .field("content_type", &self.content_type)
            .field("group_sizes", &self.group_sizes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceObjectKind,
        tests::{assert_should_panic, mock, CountingAllocator},
    };

    const STATIC: ShaderResourceVariableType = ShaderResourceVariableType::Static;
    const MUTABLE: ShaderResourceVariableType = ShaderResourceVariableType::Mutable;
    const DYNAMIC: ShaderResourceVariableType = ShaderResourceVariableType::Dynamic;

    fn pool(raw: &Arc<CountingAllocator>, group_sizes: [u32; 3]) -> Arc<BlockPool> {
        Arc::new(BlockPool::new(
            raw.clone(),
            ShaderResourceCache::block_layout(group_sizes),
            1,
        ))
    }

    #[test]
    fn groups_are_disjoint() {
        let raw = Arc::new(CountingAllocator::new());
        let sizes = [1, 2, 3];
        let pool = pool(&raw, sizes);
        let mut cache = ShaderResourceCache::new(ResourceCacheContentType::Srb);
        cache.initialize(&pool, sizes).unwrap();

        *cache.slot_mut(MUTABLE, 1).unwrap() = Some(mock(DeviceObjectKind::Buffer, "a"));
        *cache.slot_mut(DYNAMIC, 0).unwrap() = Some(mock(DeviceObjectKind::Buffer, "b"));

        assert!(cache.slot_mut(MUTABLE, 2).is_none());
        assert!(cache.resource(STATIC, 0).is_none());
        assert_eq!(cache.bound_count(MUTABLE), 1);
        assert_eq!(cache.bound_count(DYNAMIC), 1);
        assert!(cache.resource(DYNAMIC, 0).is_some());
        assert!(cache.resource(DYNAMIC, 1).is_none());

        drop(cache);
        assert_eq!(pool.outstanding_blocks(), 0);
        drop(pool);
        assert_eq!(raw.live_allocations(), 0);
    }

    #[test]
    fn writable_groups() {
        let signature = ShaderResourceCache::new(ResourceCacheContentType::Signature);
        let srb = ShaderResourceCache::new(ResourceCacheContentType::Srb);

        assert!(signature.is_writable(STATIC));
        assert!(!signature.is_writable(MUTABLE));
        assert!(!srb.is_writable(STATIC));
        assert!(srb.is_writable(MUTABLE) && srb.is_writable(DYNAMIC));
    }

    #[test]
    fn copy_static_resources() {
        let raw = Arc::new(CountingAllocator::new());
        let pool = pool(&raw, [2, 1, 0]);
        let mut src = ShaderResourceCache::new(ResourceCacheContentType::Signature);
        src.initialize(&pool, [2, 0, 0]).unwrap();
        *src.slot_mut(STATIC, 1).unwrap() = Some(mock(DeviceObjectKind::Sampler, "s"));

        let mut dst = ShaderResourceCache::new(ResourceCacheContentType::Srb);
        dst.initialize(&pool, [2, 1, 0]).unwrap();

        assert_eq!(dst.copy_static_resources(&src), [0]);
        assert!(dst.resource(STATIC, 0).is_none());
        assert!(Arc::ptr_eq(
            dst.resource(STATIC, 1).unwrap(),
            src.resource(STATIC, 1).unwrap(),
        ));
    }

    #[test]
    fn double_initialization_panics() {
        let raw = Arc::new(CountingAllocator::new());
        let pool = pool(&raw, [1, 0, 0]);
        let mut cache = ShaderResourceCache::new(ResourceCacheContentType::Signature);
        cache.initialize(&pool, [1, 0, 0]).unwrap();

        assert_should_panic!("only be initialized once", {
            let _ = cache.initialize(&pool, [1, 0, 0]);
        });
    }
}
