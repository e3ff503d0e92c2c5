// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    resource_cache::{ResourceCacheContentType, ShaderResourceCache},
    BindShaderResourcesFlags, BindingError, ResourceMapping,
};
use crate::{
    device::DeviceObject,
    macros::archive_flags,
    memory::{AllocationError, BlockPool, PooledArray},
    pipeline::{
        PipelineResource, ShaderResourceType, ShaderResourceVariableType, ShaderStages,
    },
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    alloc::Layout,
    fmt::{Debug, Error as FmtError, Formatter},
    sync::Arc,
};

archive_flags! {
    /// Flags for setting a single variable.
    SetShaderResourceFlags = u32;

    /// Allow replacing the resource bound to a static or mutable element.
    ALLOW_OVERWRITE = 0x01,
}

#[cfg(test)]
thread_local! {
    pub(crate) static LIVE_MANAGERS: std::cell::Cell<isize> = const { std::cell::Cell::new(0) };
}

/// Where a variable finds its resource and its slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct VariableDesc {
    pub(crate) resource_index: u32,
    pub(crate) cache_offset: u32,
}

/// The variables of a single shader stage.
///
/// The variable array lives in a block of a pool owned by the signature. The manager doesn't
/// know its pool, so it must be given back with [`destroy`] before it is dropped.
///
/// [`destroy`]: ShaderVariableManager::destroy
pub struct ShaderVariableManager {
    stage: ShaderStages,
    variables: Option<PooledArray<VariableDesc>>,
}

impl ShaderVariableManager {
    pub(crate) fn new(stage: ShaderStages) -> Self {
        #[cfg(test)]
        LIVE_MANAGERS.with(|live| live.set(live.get() + 1));

        ShaderVariableManager {
            stage,
            variables: None,
        }
    }

    /// Returns the layout of a block holding `count` variables.
    pub(crate) fn block_layout(count: u32) -> Layout {
        Layout::array::<VariableDesc>((count as usize).max(1))
            .unwrap_or(Layout::new::<VariableDesc>())
    }

    /// Creates a variable for every resource of `resources` that is visible to the stage of the
    /// manager, has one of `var_types` and can be changed at all.
    pub(crate) fn initialize(
        &mut self,
        resources: &[PipelineResource],
        pool: &BlockPool,
        var_types: &[ShaderResourceVariableType],
        content_type: ResourceCacheContentType,
    ) -> Result<(), AllocationError> {
        debug_assert!(self.variables.is_none());

        let variables: SmallVec<[VariableDesc; 16]> = resources
            .iter()
            .enumerate()
            .filter(|(_, res)| {
                res.shader_stages().intersects(self.stage)
                    && var_types.contains(&res.var_type())
                    && res.exposes_variable()
            })
            .map(|(index, res)| VariableDesc {
                resource_index: index as u32,
                cache_offset: match content_type {
                    ResourceCacheContentType::Signature => res.layout().static_cache_offset,
                    ResourceCacheContentType::Srb => res.layout().srb_cache_offset,
                },
            })
            .collect();

        self.variables = Some(PooledArray::new(pool, variables.len(), |index| {
            variables[index]
        })?);

        Ok(())
    }

    /// Gives the variable array back to `pool`, which must be the pool it was allocated from.
    pub(crate) fn destroy(&mut self, pool: &BlockPool) {
        if let Some(variables) = self.variables.take() {
            variables.destroy(pool);
        }
    }

    /// Returns the stage the variables belong to.
    #[inline]
    pub fn stage(&self) -> ShaderStages {
        self.stage
    }

    /// Returns the number of variables.
    #[inline]
    pub fn variable_count(&self) -> u32 {
        self.variables().len() as u32
    }

    #[inline]
    pub(crate) fn variables(&self) -> &[VariableDesc] {
        self.variables.as_deref().unwrap_or(&[])
    }

    pub(crate) fn find(&self, resources: &[PipelineResource], name: &str) -> Option<usize> {
        self.variables()
            .iter()
            .position(|var| resources[var.resource_index as usize].name() == name)
    }

    /// Binds every element of every variable selected by `flags` to the resource that `mapping`
    /// holds under its name.
    ///
    /// An element that can't be bound is logged and skipped. The first such error is returned
    /// after all other elements were bound.
    pub(crate) fn bind_resources(
        &self,
        resources: &[PipelineResource],
        cache: &mut ShaderResourceCache,
        mapping: &dyn ResourceMapping,
        flags: BindShaderResourcesFlags,
    ) -> Result<(), BindingError> {
        let set_flags = if flags.intersects(BindShaderResourcesFlags::ALLOW_OVERWRITE) {
            SetShaderResourceFlags::ALLOW_OVERWRITE
        } else {
            SetShaderResourceFlags::empty()
        };

        let mut first_error = None;

        for (index, &desc) in self.variables().iter().enumerate() {
            let resource = &resources[desc.resource_index as usize];

            if !flags.updates(resource.var_type()) {
                continue;
            }

            let mut variable = ShaderResourceVariable {
                resource,
                desc,
                index: index as u32,
                cache: &mut *cache,
            };

            for array_index in 0..resource.array_size() {
                if flags.intersects(BindShaderResourcesFlags::KEEP_EXISTING)
                    && variable.is_bound(array_index)
                {
                    continue;
                }

                let result = match mapping.get_resource(resource.name(), array_index) {
                    Some(object) => variable.set_element(array_index, object, set_flags),
                    None if flags.intersects(BindShaderResourcesFlags::VERIFY_ALL_RESOLVED)
                        && !variable.is_bound(array_index) =>
                    {
                        Err(BindingError::UnresolvedResource {
                            name: resource.name().into(),
                            array_index,
                        })
                    }
                    None => Ok(()),
                };

                if let Err(err) = result {
                    log::error!("stage {:?}: {}", self.stage, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ShaderVariableManager {
    fn drop(&mut self) {
        #[cfg(test)]
        LIVE_MANAGERS.with(|live| live.set(live.get() - 1));

        if self.variables.is_some() {
            log::error!(
                "the variable manager of stage {:?} was dropped without being destroyed, its \
                variables are leaked",
                self.stage,
            );
        }
    }
}

impl Debug for ShaderVariableManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ShaderVariableManager")
            .field("stage", &self.stage)
            .field("variable_count", &self.variable_count())
            .finish()
    }
}

/// The way a variable reaches the cache that holds its slots.
pub trait ResourceCacheAccess {
    fn read<R>(&self, f: impl FnOnce(&ShaderResourceCache) -> R) -> R;

    fn write<R>(&mut self, f: impl FnOnce(&mut ShaderResourceCache) -> R) -> R;
}

impl ResourceCacheAccess for &mut ShaderResourceCache {
    #[inline]
    fn read<R>(&self, f: impl FnOnce(&ShaderResourceCache) -> R) -> R {
        f(self)
    }

    #[inline]
    fn write<R>(&mut self, f: impl FnOnce(&mut ShaderResourceCache) -> R) -> R {
        f(self)
    }
}

/// The static cache of a signature is shared, and is only locked for the duration of a call.
impl ResourceCacheAccess for &Mutex<ShaderResourceCache> {
    #[inline]
    fn read<R>(&self, f: impl FnOnce(&ShaderResourceCache) -> R) -> R {
        f(&self.lock())
    }

    #[inline]
    fn write<R>(&mut self, f: impl FnOnce(&mut ShaderResourceCache) -> R) -> R {
        f(&mut self.lock())
    }
}

/// A named entry point for binding a resource to the slots of a cache.
///
/// `C` is the way the variable reaches the cache: a mutable reference for the variables of a
/// shader resource binding, or the mutex of the static cache for the variables of a signature.
pub struct ShaderResourceVariable<'a, C> {
    resource: &'a PipelineResource,
    desc: VariableDesc,
    index: u32,
    cache: C,
}

impl<'a, C> ShaderResourceVariable<'a, C>
where
    C: ResourceCacheAccess,
{
    pub(crate) fn new(
        resource: &'a PipelineResource,
        desc: VariableDesc,
        index: u32,
        cache: C,
    ) -> Self {
        ShaderResourceVariable {
            resource,
            desc,
            index,
            cache,
        }
    }

    /// Returns the name of the resource.
    #[inline]
    pub fn name(&self) -> &'a str {
        self.resource.name()
    }

    /// Returns the index of the variable within its stage.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn var_type(&self) -> ShaderResourceVariableType {
        self.resource.var_type()
    }

    #[inline]
    pub fn resource_type(&self) -> ShaderResourceType {
        self.resource.resource_type()
    }

    #[inline]
    pub fn array_size(&self) -> u32 {
        self.resource.array_size()
    }

    /// Binds `object` to the first element.
    #[inline]
    pub fn set(&mut self, object: Arc<dyn DeviceObject>) -> Result<(), BindingError> {
        self.set_element(0, object, SetShaderResourceFlags::empty())
    }

    /// Binds `object` to the first element.
    #[inline]
    pub fn set_with_flags(
        &mut self,
        object: Arc<dyn DeviceObject>,
        flags: SetShaderResourceFlags,
    ) -> Result<(), BindingError> {
        self.set_element(0, object, flags)
    }

    /// Binds `objects` to consecutive elements, starting at `first_element`.
    ///
    /// Elements before the first failing one stay bound.
    pub fn set_array(
        &mut self,
        objects: &[Arc<dyn DeviceObject>],
        first_element: u32,
        flags: SetShaderResourceFlags,
    ) -> Result<(), BindingError> {
        for (array_index, object) in (first_element..).zip(objects) {
            self.set_element(array_index, object.clone(), flags)?;
        }

        Ok(())
    }

    /// Returns the object bound to element `array_index`, if any.
    #[inline]
    pub fn get(&self, array_index: u32) -> Option<Arc<dyn DeviceObject>> {
        let offset = self.slot_offset(array_index)?;

        self.cache
            .read(|cache| cache.resource(self.var_type(), offset).cloned())
    }

    /// Returns whether an object is bound to element `array_index`.
    #[inline]
    pub fn is_bound(&self, array_index: u32) -> bool {
        self.get(array_index).is_some()
    }

    fn slot_offset(&self, array_index: u32) -> Option<u32> {
        (array_index < self.array_size()).then(|| self.desc.cache_offset + array_index)
    }

    pub(crate) fn set_element(
        &mut self,
        array_index: u32,
        object: Arc<dyn DeviceObject>,
        flags: SetShaderResourceFlags,
    ) -> Result<(), BindingError> {
        let resource = self.resource;
        let var_type = resource.var_type();
        let out_of_range = || BindingError::ArrayIndexOutOfRange {
            name: resource.name().into(),
            array_index,
            array_size: resource.array_size(),
        };
        let offset = self.slot_offset(array_index).ok_or_else(out_of_range)?;

        if !resource.resource_type().accepts(object.kind()) {
            return Err(BindingError::IncompatibleResource {
                name: resource.name().into(),
                resource_type: resource.resource_type(),
                kind: object.kind(),
            });
        }

        self.cache.write(|cache| {
            if !cache.is_writable(var_type) {
                return Err(BindingError::NotWritable {
                    var_type,
                    content_type: cache.content_type(),
                });
            }

            let slot = cache.slot_mut(var_type, offset).ok_or_else(out_of_range)?;

            if let Some(bound) = slot {
                if Arc::ptr_eq(bound, &object) {
                    return Ok(());
                }

                if var_type != ShaderResourceVariableType::Dynamic
                    && !flags.intersects(SetShaderResourceFlags::ALLOW_OVERWRITE)
                {
                    return Err(BindingError::AlreadyBound {
                        name: resource.name().into(),
                        array_index,
                    });
                }
            }

            *slot = Some(object);

            Ok(())
        })
    }
}

impl<C> Debug for ShaderResourceVariable<'_, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ShaderResourceVariable")
            .field("name", &self.resource.name())
            .field("index", &self.index)
            .field("var_type", &self.resource.var_type())
            .finish_non_exhaustive()
    }
}
