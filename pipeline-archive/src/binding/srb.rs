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
    variable::{ShaderResourceVariable, ShaderVariableManager},
    BindShaderResourcesFlags, BindingError, ResourceMapping,
};
use crate::{
    backend::Backend,
    device::{Device, DeviceOwned},
    memory::{AllocationError, FixedLinearAllocator, LinearBlock},
    pipeline::{PipelineResourceSignature, ShaderResourceVariableType, ShaderStages},
};
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    ptr::{self, NonNull},
    slice,
    sync::Arc,
};

/// The resources that are bound to the variables of a signature, for one draw or dispatch.
///
/// A binding holds its own mutable and dynamic resources, and a copy of the static resources of
/// its signature. Bindings of the same signature can be created and used on different threads,
/// but a single binding is only ever modified through `&mut self`.
pub struct ShaderResourceBinding<B: Backend> {
    signature: Arc<PipelineResourceSignature<B>>,
    cache: ShaderResourceCache,
    managers: ManagerArray,
    static_resources_initialized: bool,
}

impl<B: Backend> ShaderResourceBinding<B> {
    /// Creates a binding with every slot unbound.
    ///
    /// The resource cache is allocated first. Then one variable manager per active stage is
    /// constructed in a single block, and finally every manager is initialized in stage order.
    /// If any step fails, whatever was created so far is torn down before the error is returned.
    pub(crate) fn new(
        signature: Arc<PipelineResourceSignature<B>>,
    ) -> Result<Self, SrbCreationError> {
        let srb_allocator = signature.srb_memory_allocator();
        let layout = signature.layout();

        let mut cache = ShaderResourceCache::new(ResourceCacheContentType::Srb);
        cache.initialize(
            srb_allocator.resource_cache_data_allocator(0),
            layout.srb_cache_sizes(),
        )?;

        let stages = layout.active_stages();
        let mut arena = FixedLinearAllocator::new(signature.device().raw_allocator().clone());
        arena.add_space::<ShaderVariableManager>(stages.len());
        arena.reserve()?;

        let managers = arena.construct_array(stages.len(), |index| {
            Ok::<_, AllocationError>(ShaderVariableManager::new(stages[index]))
        })?;
        let len = managers.len();
        let ptr = NonNull::from(managers).cast::<ShaderVariableManager>();
        let block = arena.release_ownership();

        let mut srb = ShaderResourceBinding {
            signature: signature.clone(),
            cache,
            managers: ManagerArray {
                ptr,
                len,
                _block: block,
            },
            static_resources_initialized: false,
        };

        // From here on, dropping `srb` destroys the managers that were initialized.
        for (index, manager) in srb.managers.iter_mut().enumerate() {
            manager
                .initialize(
                    signature.resources(),
                    srb_allocator.shader_variable_data_allocator(index),
                    &[
                        ShaderResourceVariableType::Mutable,
                        ShaderResourceVariableType::Dynamic,
                    ],
                    ResourceCacheContentType::Srb,
                )
                .map_err(|source| SrbCreationError::PartialConstruction {
                    stage: manager.stage(),
                    source,
                })?;
        }

        log::trace!(
            "created a shader resource binding of signature `{}` with {} stages",
            signature.name(),
            len,
        );

        Ok(srb)
    }

    /// Returns the signature the binding was created from.
    #[inline]
    pub fn signature(&self) -> &Arc<PipelineResourceSignature<B>> {
        &self.signature
    }

    /// Returns the resource cache of the binding.
    #[inline]
    pub fn resource_cache(&self) -> &ShaderResourceCache {
        &self.cache
    }

    /// Returns the variable managers, one per active stage of the signature.
    #[inline]
    pub fn variable_managers(&self) -> &[ShaderVariableManager] {
        &self.managers
    }

    /// Returns whether the static resources of the signature were copied into the binding.
    #[inline]
    pub fn static_resources_initialized(&self) -> bool {
        self.static_resources_initialized
    }

    /// Copies the static resources that are currently bound to the signature into the binding.
    ///
    /// Can be called more than once, to pick up changes to the static resources. Static
    /// resources that are still unbound are reported as warnings.
    pub fn initialize_static_resources(&mut self) {
        if self.static_resources_initialized {
            log::warn!(
                "the static resources of a binding of signature `{}` are already initialized, \
                copying them again",
                self.signature.name(),
            );
        }

        for name in self.signature.copy_static_resources(&mut self.cache) {
            log::warn!(
                "static resource `{}` of signature `{}` is not bound",
                name,
                self.signature.name(),
            );
        }

        self.static_resources_initialized = true;
    }

    fn manager_index(&self, stage: ShaderStages) -> Option<usize> {
        let index = if stage.count() == 1 {
            self.signature.layout().active_stage_index(stage)
        } else {
            None
        };

        if index.is_none() {
            log::warn!(
                "{:?} is not a single active stage of signature `{}`",
                stage,
                self.signature.name(),
            );
        }

        index
    }

    /// Returns the number of mutable and dynamic variables of `stage`.
    pub fn variable_count(&self, stage: ShaderStages) -> u32 {
        self.manager_index(stage)
            .map_or(0, |index| self.managers[index].variable_count())
    }

    /// Returns the variable of `stage` with the name `name`.
    pub fn variable_by_name(
        &mut self,
        stage: ShaderStages,
        name: &str,
    ) -> Option<ShaderResourceVariable<'_, &mut ShaderResourceCache>> {
        let manager = &self.managers[self.manager_index(stage)?];
        let index = manager.find(self.signature.resources(), name)?;
        let desc = manager.variables()[index];

        Some(ShaderResourceVariable::new(
            &self.signature.resources()[desc.resource_index as usize],
            desc,
            index as u32,
            &mut self.cache,
        ))
    }

    /// Returns the variable of `stage` at `index`. Indices are per stage.
    pub fn variable_by_index(
        &mut self,
        stage: ShaderStages,
        index: u32,
    ) -> Option<ShaderResourceVariable<'_, &mut ShaderResourceCache>> {
        let manager = &self.managers[self.manager_index(stage)?];
        let desc = *manager.variables().get(index as usize)?;

        Some(ShaderResourceVariable::new(
            &self.signature.resources()[desc.resource_index as usize],
            desc,
            index,
            &mut self.cache,
        ))
    }

    /// Binds the variables of every active stage in `stages` to the resources of `mapping`.
    ///
    /// Variables whose name is not found in `mapping` are left as they are, unless
    /// [`VERIFY_ALL_RESOLVED`] is set.
    ///
    /// Elements that can't be bound are skipped, and every other element is still bound. The
    /// first error is returned at the end.
    ///
    /// [`VERIFY_ALL_RESOLVED`]: BindShaderResourcesFlags::VERIFY_ALL_RESOLVED
    pub fn bind_resources(
        &mut self,
        stages: ShaderStages,
        mapping: &dyn ResourceMapping,
        flags: BindShaderResourcesFlags,
    ) -> Result<(), BindingError> {
        let resources = self.signature.resources();
        let mut result = Ok(());

        for manager in self.managers.iter() {
            if manager.stage().intersects(stages) {
                let stage_result =
                    manager.bind_resources(resources, &mut self.cache, mapping, flags);
                result = result.and(stage_result);
            }
        }

        result
    }
}

impl<B: Backend> Drop for ShaderResourceBinding<B> {
    fn drop(&mut self) {
        let srb_allocator = self.signature.srb_memory_allocator();

        for (index, manager) in self.managers.iter_mut().enumerate() {
            manager.destroy(srb_allocator.shader_variable_data_allocator(index));
        }

        // The manager array and the cache are freed when the fields are dropped.
    }
}

impl<B: Backend> DeviceOwned for ShaderResourceBinding<B> {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.signature.device()
    }
}

impl<B: Backend> Debug for ShaderResourceBinding<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ShaderResourceBinding")
            .field("signature", &self.signature.name())
            .field("cache", &self.cache)
            .field("managers", &&*self.managers)
            .field(
                "static_resources_initialized",
                &self.static_resources_initialized,
            )
            .finish()
    }
}

/// The variable managers of a binding, constructed in a block of a linear allocator.
struct ManagerArray {
    ptr: NonNull<ShaderVariableManager>,
    len: usize,
    _block: LinearBlock,
}

// SAFETY: The array owns its managers, which are `Send` and `Sync`.
unsafe impl Send for ManagerArray {}
// SAFETY: See above.
unsafe impl Sync for ManagerArray {}

impl std::ops::Deref for ManagerArray {
    type Target = [ShaderVariableManager];

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: The first `len` managers were constructed and live in `_block`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for ManagerArray {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Same as above, and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ManagerArray {
    fn drop(&mut self) {
        let managers = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);

        // SAFETY: The managers are never accessed again. The block is freed after this.
        unsafe { ptr::drop_in_place(managers) };
    }
}

/// Error that can happen when creating a [`ShaderResourceBinding`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SrbCreationError {
    /// Allocating the resource cache or the variable managers failed.
    Allocation(AllocationError),

    /// Initializing the variable manager of a stage failed. Everything that was created before
    /// has been destroyed.
    PartialConstruction {
        stage: ShaderStages,
        source: AllocationError,
    },
}

impl Error for SrbCreationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Allocation(err) => Some(err),
            Self::PartialConstruction { source, .. } => Some(source),
        }
    }
}

impl Display for SrbCreationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Allocation(_) => write!(f, "allocating the shader resource binding failed"),
            Self::PartialConstruction { stage, .. } => write!(
                f,
                "initializing the variables of stage {:?} failed",
                stage,
            ),
        }
    }
}

impl From<AllocationError> for SrbCreationError {
    #[inline]
    fn from(err: AllocationError) -> Self {
        Self::Allocation(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{Direct3D12, Vulkan},
        binding::variable::LIVE_MANAGERS,
        device::{DeviceObject, DeviceObjectKind, DeviceType},
        pipeline::{PipelineResourceDesc, PipelineResourceSignatureDesc, ShaderResourceType},
        tests::{device, device_with_allocator, mock, CountingAllocator},
    };
    use std::{collections::HashMap, thread};

    const VS: ShaderStages = ShaderStages::VERTEX;
    const PS: ShaderStages = ShaderStages::PIXEL;

    fn live_managers() -> isize {
        LIVE_MANAGERS.with(|live| live.get())
    }

    // One mutable texture in the pixel stage, and a dynamic buffer in the vertex stage so that
    // both stages are active.
    const TWO_STAGE_RESOURCES: [PipelineResourceDesc<'static>; 2] = [
        PipelineResourceDesc::new(
            VS,
            "g_Instances",
            ShaderResourceType::BufferSrv,
            ShaderResourceVariableType::Dynamic,
        ),
        PipelineResourceDesc::new(
            PS,
            "g_Texture",
            ShaderResourceType::TextureSrv,
            ShaderResourceVariableType::Mutable,
        ),
    ];

    fn two_stage_signature<B: Backend>(
        device: Arc<Device>,
    ) -> Arc<PipelineResourceSignature<B>> {
        PipelineResourceSignature::new(
            device,
            &PipelineResourceSignatureDesc {
                name: "TwoStages",
                resources: &TWO_STAGE_RESOURCES,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn bind_resources_respects_stages() {
        let signature = two_stage_signature::<Vulkan>(device(DeviceType::Vulkan));
        let mut srb = signature.create_shader_resource_binding(false).unwrap();
        let texture = mock(DeviceObjectKind::TextureView, "texture");

        let mut mapping = HashMap::<String, Arc<dyn DeviceObject>>::new();
        mapping.insert("g_Texture".into(), texture.clone());

        srb.bind_resources(VS, &mapping, BindShaderResourcesFlags::empty())
            .unwrap();
        assert!(!srb.variable_by_name(PS, "g_Texture").unwrap().is_bound(0));
        assert_eq!(
            srb.resource_cache()
                .bound_count(ShaderResourceVariableType::Mutable),
            0,
        );

        srb.bind_resources(PS, &mapping, BindShaderResourcesFlags::empty())
            .unwrap();
        let variable = srb.variable_by_name(PS, "g_Texture").unwrap();
        assert!(Arc::ptr_eq(&variable.get(0).unwrap(), &texture));

        // The vertex stage buffer is untouched.
        assert!(srb.variable_by_name(VS, "g_Instances").unwrap().get(0).is_none());
    }

    #[test]
    fn failed_elements_are_skipped() {
        let signature = two_stage_signature::<Vulkan>(device(DeviceType::Vulkan));
        let mut srb = signature.create_shader_resource_binding(false).unwrap();
        let texture = mock(DeviceObjectKind::TextureView, "texture");

        // A texture can't be bound to the vertex stage buffer.
        let mut mapping = HashMap::<String, Arc<dyn DeviceObject>>::new();
        mapping.insert("g_Instances".into(), mock(DeviceObjectKind::TextureView, "wrong"));
        mapping.insert("g_Texture".into(), texture.clone());

        assert_eq!(
            srb.bind_resources(VS | PS, &mapping, BindShaderResourcesFlags::empty()),
            Err(BindingError::IncompatibleResource {
                name: "g_Instances".into(),
                resource_type: ShaderResourceType::BufferSrv,
                kind: DeviceObjectKind::TextureView,
            }),
        );
        assert!(srb.variable_by_name(VS, "g_Instances").unwrap().get(0).is_none());
        let variable = srb.variable_by_name(PS, "g_Texture").unwrap();
        assert!(Arc::ptr_eq(&variable.get(0).unwrap(), &texture));
    }

    #[test]
    fn unresolved_resources() {
        let signature = two_stage_signature::<Direct3D12>(device(DeviceType::Direct3D12));
        let mut srb = signature.create_shader_resource_binding(false).unwrap();
        let mapping = HashMap::<String, Arc<dyn DeviceObject>>::new();

        srb.bind_resources(VS | PS, &mapping, BindShaderResourcesFlags::empty())
            .unwrap();
        assert_eq!(
            srb.bind_resources(PS, &mapping, BindShaderResourcesFlags::VERIFY_ALL_RESOLVED),
            Err(BindingError::UnresolvedResource {
                name: "g_Texture".into(),
                array_index: 0,
            }),
        );
    }

    #[test]
    fn variables_are_per_stage() {
        let signature = two_stage_signature::<Vulkan>(device(DeviceType::Vulkan));
        let mut srb = signature.create_shader_resource_binding(false).unwrap();

        assert_eq!(srb.variable_count(VS), 1);
        assert_eq!(srb.variable_count(PS), 1);
        assert_eq!(srb.variable_count(ShaderStages::COMPUTE), 0);
        assert_eq!(srb.variable_by_index(VS, 0).unwrap().name(), "g_Instances");
        assert_eq!(srb.variable_by_index(PS, 0).unwrap().name(), "g_Texture");
        assert!(srb.variable_by_index(PS, 1).is_none());
        assert!(srb.variable_by_name(VS, "g_Texture").is_none());
        assert!(srb.variable_by_name(VS | PS, "g_Texture").is_none());
    }

    #[test]
    fn dynamic_variables_can_be_rebound() {
        let signature = two_stage_signature::<Vulkan>(device(DeviceType::Vulkan));
        let mut srb = signature.create_shader_resource_binding(false).unwrap();

        let mut instances = srb.variable_by_name(VS, "g_Instances").unwrap();
        instances.set(mock(DeviceObjectKind::BufferView, "a")).unwrap();
        instances.set(mock(DeviceObjectKind::BufferView, "b")).unwrap();

        let mut texture = srb.variable_by_name(PS, "g_Texture").unwrap();
        texture.set(mock(DeviceObjectKind::TextureView, "a")).unwrap();
        assert!(matches!(
            texture.set(mock(DeviceObjectKind::TextureView, "b")),
            Err(BindingError::AlreadyBound { .. }),
        ));
        assert!(matches!(
            texture.set_array(&[mock(DeviceObjectKind::TextureView, "c")], 1, Default::default()),
            Err(BindingError::ArrayIndexOutOfRange { array_size: 1, .. }),
        ));
    }

    #[test]
    fn failing_stage_is_torn_down() {
        // Allocations: the resource cache, the manager array, then the variables of the vertex
        // and the pixel stage. The pixel stage fails.
        let raw = Arc::new(CountingAllocator::failing_at(4));
        let device = device_with_allocator(DeviceType::Vulkan, raw.clone());
        let signature = two_stage_signature::<Vulkan>(device);
        let live_before = live_managers();

        let err = signature.create_shader_resource_binding(false).unwrap_err();
        assert!(matches!(
            err,
            SrbCreationError::PartialConstruction { stage: PS, .. },
        ));
        assert_eq!(raw.allocation_count(), 4);
        assert_eq!(live_managers(), live_before);

        let srb_allocator = signature.srb_memory_allocator();
        assert_eq!(srb_allocator.resource_cache_data_allocator(0).outstanding_blocks(), 0);
        assert_eq!(srb_allocator.shader_variable_data_allocator(0).outstanding_blocks(), 0);
        assert_eq!(srb_allocator.shader_variable_data_allocator(1).outstanding_blocks(), 0);

        // The pages stay with the pools, and are freed with the signature.
        drop(signature);
        assert_eq!(raw.live_allocations(), 0);
    }

    #[test]
    fn failing_manager_array() {
        let raw = Arc::new(CountingAllocator::failing_at(2));
        let device = device_with_allocator(DeviceType::Vulkan, raw.clone());
        let signature = two_stage_signature::<Vulkan>(device);
        let live_before = live_managers();

        assert!(matches!(
            signature.create_shader_resource_binding(false),
            Err(SrbCreationError::Allocation(_)),
        ));
        assert_eq!(live_managers(), live_before);
        assert_eq!(
            signature
                .srb_memory_allocator()
                .resource_cache_data_allocator(0)
                .outstanding_blocks(),
            0,
        );
    }

    #[test]
    fn static_resources_are_copied() {
        const RESOURCES: [PipelineResourceDesc<'static>; 2] = [
            PipelineResourceDesc::new(
                VS.union(PS),
                "g_Constants",
                ShaderResourceType::ConstantBuffer,
                ShaderResourceVariableType::Static,
            ),
            PipelineResourceDesc::new(
                PS,
                "g_Shadow",
                ShaderResourceType::TextureSrv,
                ShaderResourceVariableType::Static,
            ),
        ];

        let signature = PipelineResourceSignature::<Vulkan>::new(
            device(DeviceType::Vulkan),
            &PipelineResourceSignatureDesc {
                resources: &RESOURCES,
                ..Default::default()
            },
        )
        .unwrap();
        let constants = mock(DeviceObjectKind::Buffer, "constants");
        signature
            .static_variable_by_name(VS, "g_Constants")
            .unwrap()
            .set(constants.clone())
            .unwrap();

        let srb = signature.create_shader_resource_binding(true).unwrap();
        let cache = srb.resource_cache();
        assert!(srb.static_resources_initialized());
        assert!(Arc::ptr_eq(
            cache.resource(ShaderResourceVariableType::Static, 0).unwrap(),
            &constants,
        ));
        assert!(cache.resource(ShaderResourceVariableType::Static, 1).is_none());

        // Static variables are not exposed by the binding.
        let mut srb = signature.create_shader_resource_binding(false).unwrap();
        assert!(!srb.static_resources_initialized());
        assert_eq!(srb.variable_count(PS), 0);
        assert!(srb.variable_by_name(PS, "g_Shadow").is_none());
        assert_eq!(
            srb.resource_cache()
                .bound_count(ShaderResourceVariableType::Static),
            0,
        );

        srb.initialize_static_resources();
        assert_eq!(
            srb.resource_cache()
                .bound_count(ShaderResourceVariableType::Static),
            1,
        );
    }

    #[test]
    fn concurrent_creation() {
        let raw = Arc::new(CountingAllocator::new());
        let device = device_with_allocator(DeviceType::Direct3D12, raw.clone());
        let signature = two_stage_signature::<Direct3D12>(device);

        thread::scope(|scope| {
            for _ in 0..4 {
                let signature = &signature;

                scope.spawn(move || {
                    let mut mapping = HashMap::<String, Arc<dyn DeviceObject>>::new();
                    mapping.insert("g_Texture".into(), mock(DeviceObjectKind::TextureView, "t"));
                    mapping.insert("g_Instances".into(), mock(DeviceObjectKind::BufferView, "b"));

                    let mut bindings: Vec<_> = (0..16)
                        .map(|_| signature.create_shader_resource_binding(true).unwrap())
                        .collect();

                    for srb in &mut bindings {
                        srb.bind_resources(VS | PS, &mapping, BindShaderResourcesFlags::empty())
                            .unwrap();
                    }

                    assert!(bindings.iter().all(|srb| {
                        srb.resource_cache()
                            .bound_count(ShaderResourceVariableType::Mutable)
                            == 1
                    }));
                });
            }
        });

        let srb_allocator = signature.srb_memory_allocator();
        assert_eq!(srb_allocator.resource_cache_data_allocator(0).outstanding_blocks(), 0);

        drop(signature);
        assert_eq!(raw.live_allocations(), 0);
    }
}
