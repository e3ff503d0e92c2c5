// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    layout::{exposes_variable, ResourceLayout},
    PipelineResourceDesc, PipelineResourceFlags, PipelineResourceSignatureDesc, PipelineType,
    SamplerDesc, ShaderResourceType, ShaderResourceVariableType, ShaderStages, SignatureError,
    SignatureLayout, MAX_SHADERS_IN_PIPELINE,
};
use crate::{
    backend::{Backend, SignatureData},
    binding::{
        BindShaderResourcesFlags, BindingError, ResourceCacheContentType, ResourceMapping,
        ShaderResourceBinding, ShaderResourceCache, ShaderResourceVariable,
        ShaderVariableManager, SrbCreationError,
    },
    device::{Device, DeviceOwned},
    macros::impl_id_counter,
    memory::{AllocationError, BlockPool, RawAllocator},
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

/// A resource of a [`PipelineResourceSignature`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineResource {
    name: Box<str>,
    shader_stages: ShaderStages,
    array_size: u32,
    resource_type: ShaderResourceType,
    var_type: ShaderResourceVariableType,
    flags: PipelineResourceFlags,
    layout: ResourceLayout,
}

impl PipelineResource {
    fn new(desc: &PipelineResourceDesc<'_>, layout: ResourceLayout) -> Self {
        PipelineResource {
            name: desc.name.into(),
            shader_stages: desc.shader_stages,
            array_size: desc.array_size,
            resource_type: desc.resource_type,
            var_type: desc.var_type,
            flags: desc.flags,
            layout,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn shader_stages(&self) -> ShaderStages {
        self.shader_stages
    }

    #[inline]
    pub fn array_size(&self) -> u32 {
        self.array_size
    }

    #[inline]
    pub fn resource_type(&self) -> ShaderResourceType {
        self.resource_type
    }

    #[inline]
    pub fn var_type(&self) -> ShaderResourceVariableType {
        self.var_type
    }

    #[inline]
    pub fn flags(&self) -> PipelineResourceFlags {
        self.flags
    }

    /// Returns where the resource lives in the resource caches.
    #[inline]
    pub fn layout(&self) -> &ResourceLayout {
        &self.layout
    }

    /// Returns whether the resource can be bound through a variable.
    #[inline]
    pub fn exposes_variable(&self) -> bool {
        exposes_variable(self.resource_type, &self.layout)
    }

    /// Returns the description the resource was created from.
    #[inline]
    pub fn desc(&self) -> PipelineResourceDesc<'_> {
        PipelineResourceDesc {
            name: &self.name,
            shader_stages: self.shader_stages,
            array_size: self.array_size,
            resource_type: self.resource_type,
            var_type: self.var_type,
            flags: self.flags,
        }
    }
}

/// An immutable sampler of a [`PipelineResourceSignature`].
#[derive(Clone, Debug, PartialEq)]
pub struct ImmutableSampler {
    shader_stages: ShaderStages,
    sampler_or_texture_name: Box<str>,
    desc: SamplerDesc,
}

impl ImmutableSampler {
    #[inline]
    pub fn shader_stages(&self) -> ShaderStages {
        self.shader_stages
    }

    #[inline]
    pub fn sampler_or_texture_name(&self) -> &str {
        &self.sampler_or_texture_name
    }

    #[inline]
    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

/// The pools that shader resource bindings of a signature allocate from.
///
/// Every pool hands out blocks sized for one binding, and grows by `srb_allocation_granularity`
/// blocks at a time. The pools are shared by all bindings of the signature, and can be used
/// from any number of threads.
pub struct SrbMemoryAllocator {
    resource_cache_pool: Arc<BlockPool>,
    shader_variable_pools: SmallVec<[Arc<BlockPool>; MAX_SHADERS_IN_PIPELINE]>,
}

impl SrbMemoryAllocator {
    fn new(
        allocator: &Arc<dyn RawAllocator>,
        layout: &SignatureLayout,
        srb_allocation_granularity: u32,
    ) -> Self {
        let resource_cache_pool = Arc::new(BlockPool::new(
            allocator.clone(),
            ShaderResourceCache::block_layout(layout.srb_cache_sizes()),
            srb_allocation_granularity,
        ));
        let shader_variable_pools = layout
            .srb_variable_counts()
            .iter()
            .map(|&count| {
                Arc::new(BlockPool::new(
                    allocator.clone(),
                    ShaderVariableManager::block_layout(count),
                    srb_allocation_granularity,
                ))
            })
            .collect();

        SrbMemoryAllocator {
            resource_cache_pool,
            shader_variable_pools,
        }
    }

    /// Returns the pool for the resource cache data of group `group_index`.
    ///
    /// # Panics
    ///
    /// - Panics if `group_index` is not `0`. All resource cache data lives in a single group.
    #[inline]
    pub fn resource_cache_data_allocator(&self, group_index: usize) -> &Arc<BlockPool> {
        assert_eq!(
            group_index, 0,
            "the resource cache data of a binding lives in a single group",
        );

        &self.resource_cache_pool
    }

    /// Returns the pool for the variables of active stage `stage_index`.
    ///
    /// # Panics
    ///
    /// - Panics if `stage_index` is not less than the number of active stages.
    #[inline]
    pub fn shader_variable_data_allocator(&self, stage_index: usize) -> &Arc<BlockPool> {
        &self.shader_variable_pools[stage_index]
    }

    /// Returns the number of shader variable pools, one per active stage.
    #[inline]
    pub fn shader_variable_pool_count(&self) -> usize {
        self.shader_variable_pools.len()
    }
}

impl Debug for SrbMemoryAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("SrbMemoryAllocator")
            .field("resource_cache_pool", &self.resource_cache_pool)
            .field("shader_variable_pools", &self.shader_variable_pools)
            .finish()
    }
}

/// Describes the resources that the shaders of a pipeline access, and holds the resources that
/// are bound to its static variables.
///
/// A signature is specific to a backend. The backend determines how resources map to the
/// binding model of the device, and that mapping is stored in the signature's
/// [`SignatureData`].
pub struct PipelineResourceSignature<B: Backend> {
    id: NonZero<u64>,
    device: Arc<Device>,
    name: Box<str>,
    binding_index: u8,
    use_combined_texture_samplers: bool,
    combined_sampler_suffix: Box<str>,
    srb_allocation_granularity: u32,
    resources: Vec<PipelineResource>,
    immutable_samplers: Vec<ImmutableSampler>,
    layout: SignatureLayout,
    data: SignatureData<B>,

    static_cache: Mutex<ShaderResourceCache>,
    static_cache_pool: Arc<BlockPool>,
    static_managers: SmallVec<[ShaderVariableManager; MAX_SHADERS_IN_PIPELINE]>,
    static_variable_pools: SmallVec<[BlockPool; MAX_SHADERS_IN_PIPELINE]>,
    srb_allocator: SrbMemoryAllocator,
}

impl<B: Backend> PipelineResourceSignature<B> {
    /// Creates a new `PipelineResourceSignature`.
    ///
    /// The device must be of the type of backend `B`.
    pub fn new(
        device: Arc<Device>,
        desc: &PipelineResourceSignatureDesc<'_>,
    ) -> Result<Arc<Self>, SignatureError> {
        if device.device_type() != B::DEVICE_TYPE {
            return Err(SignatureError::IncompatibleDevice {
                expected: B::DEVICE_TYPE,
                found: device.device_type(),
            });
        }

        let layout = SignatureLayout::new(desc)?;
        let data = B::build_signature_data(desc, &layout)?;

        Ok(Self::from_parts(
            device,
            desc,
            layout,
            data,
            desc.srb_allocation_granularity,
        )?)
    }

    /// Creates a signature from a validated description and backend data that matches it.
    pub(crate) fn from_parts(
        device: Arc<Device>,
        desc: &PipelineResourceSignatureDesc<'_>,
        layout: SignatureLayout,
        data: SignatureData<B>,
        srb_allocation_granularity: u32,
    ) -> Result<Arc<Self>, AllocationError> {
        let raw_allocator = device.raw_allocator().clone();
        let static_cache_sizes = [layout.static_cache_size(), 0, 0];

        let resources = desc
            .resources
            .iter()
            .zip(layout.resources())
            .map(|(res, &res_layout)| PipelineResource::new(res, res_layout))
            .collect();
        let immutable_samplers = desc
            .immutable_samplers
            .iter()
            .map(|sampler| ImmutableSampler {
                shader_stages: sampler.shader_stages,
                sampler_or_texture_name: sampler.sampler_or_texture_name.into(),
                desc: sampler.desc,
            })
            .collect();

        let static_cache_pool = Arc::new(BlockPool::new(
            raw_allocator.clone(),
            ShaderResourceCache::block_layout(static_cache_sizes),
            1,
        ));
        let static_variable_pools = layout
            .static_variable_counts()
            .iter()
            .map(|&count| {
                BlockPool::new(
                    raw_allocator.clone(),
                    ShaderVariableManager::block_layout(count),
                    1,
                )
            })
            .collect();
        let static_managers = layout
            .static_stages()
            .iter()
            .map(|&stage| ShaderVariableManager::new(stage))
            .collect();
        let srb_allocator =
            SrbMemoryAllocator::new(&raw_allocator, &layout, srb_allocation_granularity);

        let mut signature = PipelineResourceSignature {
            id: Self::next_id(),
            device,
            name: desc.name.into(),
            binding_index: desc.binding_index,
            use_combined_texture_samplers: desc.use_combined_texture_samplers,
            combined_sampler_suffix: desc.combined_sampler_suffix.into(),
            srb_allocation_granularity,
            resources,
            immutable_samplers,
            layout,
            data,
            static_cache: Mutex::new(ShaderResourceCache::new(
                ResourceCacheContentType::Signature,
            )),
            static_cache_pool,
            static_managers,
            static_variable_pools,
            srb_allocator,
        };

        // Dropping `signature` from here on releases whatever was allocated.
        signature
            .static_cache
            .get_mut()
            .initialize(&signature.static_cache_pool, static_cache_sizes)?;

        for (manager, pool) in signature
            .static_managers
            .iter_mut()
            .zip(&signature.static_variable_pools)
        {
            manager.initialize(
                &signature.resources,
                pool,
                &[ShaderResourceVariableType::Static],
                ResourceCacheContentType::Signature,
            )?;
        }

        Ok(Arc::new(signature))
    }

    /// Returns the name of the signature.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the slot of the signature in a pipeline.
    #[inline]
    pub fn binding_index(&self) -> u8 {
        self.binding_index
    }

    #[inline]
    pub fn use_combined_texture_samplers(&self) -> bool {
        self.use_combined_texture_samplers
    }

    #[inline]
    pub fn combined_sampler_suffix(&self) -> &str {
        &self.combined_sampler_suffix
    }

    #[inline]
    pub fn srb_allocation_granularity(&self) -> u32 {
        self.srb_allocation_granularity
    }

    /// Returns the type of pipeline the signature can be used with.
    #[inline]
    pub fn pipeline_type(&self) -> PipelineType {
        self.layout.pipeline_type()
    }

    /// Returns the stages that access any resource of the signature.
    #[inline]
    pub fn shader_stages(&self) -> ShaderStages {
        self.layout.shader_stages()
    }

    /// Returns the resources, in the order of the description.
    #[inline]
    pub fn resources(&self) -> &[PipelineResource] {
        &self.resources
    }

    #[inline]
    pub fn immutable_samplers(&self) -> &[ImmutableSampler] {
        &self.immutable_samplers
    }

    /// Returns the index of the resource named `name` that is visible to `stage`.
    pub fn find_resource(&self, stage: ShaderStages, name: &str) -> Option<usize> {
        self.resources
            .iter()
            .position(|res| res.shader_stages.intersects(stage) && &*res.name == name)
    }

    #[inline]
    pub fn layout(&self) -> &SignatureLayout {
        &self.layout
    }

    /// Returns the backend specific data of the signature.
    #[inline]
    pub fn signature_data(&self) -> &SignatureData<B> {
        &self.data
    }

    /// Returns the pools that the shader resource bindings of the signature allocate from.
    #[inline]
    pub fn srb_memory_allocator(&self) -> &SrbMemoryAllocator {
        &self.srb_allocator
    }

    fn static_manager(&self, stage: ShaderStages) -> Option<&ShaderVariableManager> {
        if !self.layout.shader_stages().contains(stage) || stage.count() != 1 {
            log::warn!(
                "{:?} is not a single active stage of signature `{}`",
                stage,
                self.name,
            );

            return None;
        }

        let index = self.layout.static_stage_index(stage)?;

        self.static_managers.get(index)
    }

    /// Returns the number of static variables of `stage`.
    pub fn static_variable_count(&self, stage: ShaderStages) -> u32 {
        self.static_manager(stage)
            .map_or(0, ShaderVariableManager::variable_count)
    }

    /// Returns the static variable of `stage` with the name `name`.
    ///
    /// The static resource cache is only locked while the variable reads or writes it, so any
    /// number of static variables can be held at once.
    pub fn static_variable_by_name(
        &self,
        stage: ShaderStages,
        name: &str,
    ) -> Option<ShaderResourceVariable<'_, &Mutex<ShaderResourceCache>>> {
        let manager = self.static_manager(stage)?;
        let index = manager.find(&self.resources, name)?;

        Some(self.static_variable(manager, index))
    }

    /// Returns the static variable of `stage` at `index`.
    pub fn static_variable_by_index(
        &self,
        stage: ShaderStages,
        index: u32,
    ) -> Option<ShaderResourceVariable<'_, &Mutex<ShaderResourceCache>>> {
        let manager = self.static_manager(stage)?;

        if index >= manager.variable_count() {
            log::warn!(
                "static variable index {} is out of range for stage {:?} of signature `{}`",
                index,
                stage,
                self.name,
            );

            return None;
        }

        Some(self.static_variable(manager, index as usize))
    }

    fn static_variable<'a>(
        &'a self,
        manager: &ShaderVariableManager,
        index: usize,
    ) -> ShaderResourceVariable<'a, &'a Mutex<ShaderResourceCache>> {
        let desc = manager.variables()[index];

        ShaderResourceVariable::new(
            &self.resources[desc.resource_index as usize],
            desc,
            index as u32,
            &self.static_cache,
        )
    }

    /// Binds the static variables of `stages` to the resources of `mapping`.
    ///
    /// Elements that can't be bound are skipped, and the first error is returned at the end.
    pub fn bind_static_resources(
        &self,
        stages: ShaderStages,
        mapping: &dyn ResourceMapping,
        flags: BindShaderResourcesFlags,
    ) -> Result<(), BindingError> {
        let mut cache = self.static_cache.lock();
        let mut result = Ok(());

        for manager in &self.static_managers {
            if manager.stage().intersects(stages) {
                let stage_result =
                    manager.bind_resources(&self.resources, &mut cache, mapping, flags);
                result = result.and(stage_result);
            }
        }

        result
    }

    /// Creates a new shader resource binding.
    ///
    /// If `init_static_resources` is `true`, the static resources bound to the signature so far
    /// are copied into the binding.
    pub fn create_shader_resource_binding(
        self: &Arc<Self>,
        init_static_resources: bool,
    ) -> Result<ShaderResourceBinding<B>, SrbCreationError> {
        let mut srb = ShaderResourceBinding::new(self.clone())?;

        if init_static_resources {
            srb.initialize_static_resources();
        }

        Ok(srb)
    }

    /// Copies the static resources into the cache of a binding, and returns the resources that
    /// have unbound static elements.
    pub(crate) fn copy_static_resources(&self, dst: &mut ShaderResourceCache) -> Vec<&str> {
        let unbound = dst.copy_static_resources(&self.static_cache.lock());
        let mut names: Vec<&str> = Vec::new();

        for offset in unbound {
            let owner = self.resources.iter().find(|res| {
                res.var_type == ShaderResourceVariableType::Static
                    && offset >= res.layout.static_cache_offset
                    && offset - res.layout.static_cache_offset < res.array_size
            });

            if let Some(res) = owner {
                if names.last() != Some(&res.name()) {
                    names.push(res.name());
                }
            }
        }

        names
    }
}

impl_id_counter!(PipelineResourceSignature<B: Backend>);

impl<B: Backend> Drop for PipelineResourceSignature<B> {
    fn drop(&mut self) {
        for (manager, pool) in self
            .static_managers
            .iter_mut()
            .zip(&self.static_variable_pools)
        {
            manager.destroy(pool);
        }
    }
}

impl<B: Backend> DeviceOwned for PipelineResourceSignature<B> {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl<B: Backend> Debug for PipelineResourceSignature<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("PipelineResourceSignature")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("binding_index", &self.binding_index)
            .field("resources", &self.resources)
            .field("layout", &self.layout)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{tests::sample_resources, Direct3D12, Vulkan},
        device::{DeviceObject, DeviceObjectKind, DeviceType},
        tests::{device, device_with_allocator, mock, CountingAllocator},
    };
    use std::collections::HashMap;

    const VS: ShaderStages = ShaderStages::VERTEX;
    const PS: ShaderStages = ShaderStages::PIXEL;

    fn sample_desc<'a>(
        resources: &'a [PipelineResourceDesc<'a>],
    ) -> PipelineResourceSignatureDesc<'a> {
        PipelineResourceSignatureDesc {
            name: "Sample",
            resources,
            use_combined_texture_samplers: true,
            ..Default::default()
        }
    }

    fn sample_signature<B: Backend>() -> Arc<PipelineResourceSignature<B>> {
        let resources = sample_resources();

        PipelineResourceSignature::new(device(B::DEVICE_TYPE), &sample_desc(&resources)).unwrap()
    }

    #[test]
    fn create() {
        let resources = sample_resources();
        let signature = sample_signature::<Vulkan>();

        assert_eq!(signature.name(), "Sample");
        assert_eq!(signature.pipeline_type(), PipelineType::Graphics);
        assert_eq!(signature.shader_stages(), VS | PS);
        assert_eq!(signature.resources().len(), resources.len());
        assert_eq!(signature.resources()[1].desc(), resources[1]);
        assert_eq!(signature.find_resource(PS, "Albedo"), Some(1));
        assert_eq!(signature.find_resource(VS, "Albedo"), None);
        assert_eq!(
            signature.signature_data().resource_attribs.len(),
            resources.len(),
        );
        assert_eq!(signature.srb_memory_allocator().shader_variable_pool_count(), 2);

        // Only `Constants` is static, and it is visible to both stages.
        assert_eq!(signature.static_variable_count(VS), 1);
        assert_eq!(signature.static_variable_count(PS), 1);
        assert_eq!(signature.static_variable_count(ShaderStages::COMPUTE), 0);
    }

    #[test]
    fn wrong_device_type() {
        let resources = sample_resources();

        assert_eq!(
            PipelineResourceSignature::<Direct3D12>::new(
                device(DeviceType::Vulkan),
                &sample_desc(&resources),
            )
            .unwrap_err(),
            SignatureError::IncompatibleDevice {
                expected: DeviceType::Direct3D12,
                found: DeviceType::Vulkan,
            },
        );
    }

    #[test]
    fn static_variables_share_slots() {
        let signature = sample_signature::<Direct3D12>();
        let buffer = mock(DeviceObjectKind::Buffer, "constants");

        signature
            .static_variable_by_name(VS, "Constants")
            .unwrap()
            .set(buffer.clone())
            .unwrap();

        let from_pixel = signature.static_variable_by_index(PS, 0).unwrap();
        assert_eq!(from_pixel.name(), "Constants");
        assert!(Arc::ptr_eq(&from_pixel.get(0).unwrap(), &buffer));
        drop(from_pixel);

        assert!(signature.static_variable_by_name(PS, "Albedo").is_none());
        assert!(signature.static_variable_by_index(PS, 1).is_none());
        assert!(signature.static_variable_by_name(VS | PS, "Constants").is_none());
    }

    #[test]
    fn static_variables_can_be_held_together() {
        let signature = sample_signature::<Vulkan>();
        let buffer = mock(DeviceObjectKind::Buffer, "constants");

        let mut from_vertex = signature.static_variable_by_name(VS, "Constants").unwrap();
        let from_pixel = signature.static_variable_by_name(PS, "Constants").unwrap();
        from_vertex.set(buffer.clone()).unwrap();
        assert!(Arc::ptr_eq(&from_pixel.get(0).unwrap(), &buffer));

        let mut mapping = HashMap::<String, Arc<dyn DeviceObject>>::new();
        mapping.insert("Constants".into(), buffer.clone());
        signature
            .bind_static_resources(VS | PS, &mapping, BindShaderResourcesFlags::empty())
            .unwrap();

        let srb = signature.create_shader_resource_binding(true).unwrap();
        assert!(srb.static_resources_initialized());
        assert!(from_vertex.is_bound(0));
    }

    #[test]
    fn bind_static_resources() {
        let signature = sample_signature::<Vulkan>();

        let mut mapping = HashMap::<String, Arc<dyn DeviceObject>>::new();
        mapping.insert("Constants".into(), mock(DeviceObjectKind::Buffer, "constants"));
        mapping.insert("Albedo".into(), mock(DeviceObjectKind::TextureView, "albedo"));

        signature
            .bind_static_resources(VS, &mapping, BindShaderResourcesFlags::empty())
            .unwrap();
        assert!(signature
            .static_variable_by_name(VS, "Constants")
            .unwrap()
            .is_bound(0));

        // Rebinding a different object requires ALLOW_OVERWRITE.
        mapping.insert("Constants".into(), mock(DeviceObjectKind::Buffer, "other"));
        assert_eq!(
            signature.bind_static_resources(PS, &mapping, BindShaderResourcesFlags::empty()),
            Err(BindingError::AlreadyBound {
                name: "Constants".into(),
                array_index: 0,
            }),
        );
        signature
            .bind_static_resources(PS, &mapping, BindShaderResourcesFlags::ALLOW_OVERWRITE)
            .unwrap();

        // Only buffers can be bound to a constant buffer.
        let mut variable = signature.static_variable_by_name(VS, "Constants").unwrap();
        assert!(matches!(
            variable.set(mock(DeviceObjectKind::TextureView, "wrong")),
            Err(BindingError::IncompatibleResource { .. }),
        ));
    }

    #[test]
    fn pools_are_released() {
        let raw = Arc::new(CountingAllocator::new());
        let resources = sample_resources();
        let signature = PipelineResourceSignature::<Vulkan>::new(
            device_with_allocator(DeviceType::Vulkan, raw.clone()),
            &sample_desc(&resources),
        )
        .unwrap();

        let srb = signature.create_shader_resource_binding(true).unwrap();
        assert!(raw.live_allocations() > 0);

        drop(srb);
        drop(signature);
        assert_eq!(raw.live_allocations(), 0);
    }

    #[test]
    fn failing_static_cache_allocation() {
        let raw = Arc::new(CountingAllocator::failing_at(1));
        let resources = sample_resources();
        let err = PipelineResourceSignature::<Vulkan>::new(
            device_with_allocator(DeviceType::Vulkan, raw.clone()),
            &sample_desc(&resources),
        )
        .unwrap_err();

        assert!(matches!(err, SignatureError::Allocation(_)));
        assert_eq!(raw.live_allocations(), 0);
    }
}
