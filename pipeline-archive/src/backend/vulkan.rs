// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Signatures for Vulkan devices.
//!
//! Static and mutable resources share one descriptor set, dynamic resources get a second one.
//! If the signature has no static or mutable resources, the dynamic set is set 0. Within a set,
//! resources get consecutive binding numbers in description order.

use super::{
    check_common_attribs, Backend, ResourceAttribs, SerializedSignatureData, SignatureData,
};
use crate::{
    archive::{
        serializer::{Serialize, Serializer},
        DecodeError,
    },
    device::DeviceType,
    macros::archive_enum,
    memory::FixedLinearAllocator,
    pipeline::{
        layout::{SignatureLayout, INVALID_INDEX},
        PipelineResourceDesc, PipelineResourceFlags, PipelineResourceSignatureDesc,
        ShaderResourceType, ShaderResourceVariableType, SignatureError,
    },
};
use bytemuck::{Pod, Zeroable};

/// The Vulkan backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Vulkan;

archive_enum! {
    /// A Vulkan descriptor type.
    DescriptorType = u8;

    Sampler = 0,
    CombinedImageSampler = 1,
    SampledImage = 2,
    StorageImage = 3,
    UniformTexelBuffer = 4,
    StorageTexelBuffer = 5,
    UniformBuffer = 6,
    StorageBuffer = 7,
    UniformBufferDynamic = 8,
    StorageBufferDynamic = 9,
    InputAttachment = 10,
    AccelerationStructure = 11,
}

impl DescriptorType {
    /// Returns the descriptor type of a resource.
    pub fn from_resource(
        res: &PipelineResourceDesc<'_>,
        has_combined_sampler: bool,
    ) -> Option<Self> {
        let dynamic_offset = res.var_type == ShaderResourceVariableType::Dynamic
            && !res.flags.intersects(PipelineResourceFlags::NO_DYNAMIC_BUFFERS);
        let formatted = res.flags.intersects(PipelineResourceFlags::FORMATTED_BUFFER);

        Some(match res.resource_type {
            ShaderResourceType::Unknown => return None,
            ShaderResourceType::ConstantBuffer if dynamic_offset => {
                DescriptorType::UniformBufferDynamic
            }
            ShaderResourceType::ConstantBuffer => DescriptorType::UniformBuffer,
            ShaderResourceType::TextureSrv
                if has_combined_sampler
                    || res.flags.intersects(PipelineResourceFlags::COMBINED_SAMPLER) =>
            {
                DescriptorType::CombinedImageSampler
            }
            ShaderResourceType::TextureSrv => DescriptorType::SampledImage,
            ShaderResourceType::BufferSrv if formatted => DescriptorType::UniformTexelBuffer,
            ShaderResourceType::BufferUav if formatted => DescriptorType::StorageTexelBuffer,
            ShaderResourceType::BufferSrv | ShaderResourceType::BufferUav if dynamic_offset => {
                DescriptorType::StorageBufferDynamic
            }
            ShaderResourceType::BufferSrv | ShaderResourceType::BufferUav => {
                DescriptorType::StorageBuffer
            }
            ShaderResourceType::TextureUav => DescriptorType::StorageImage,
            ShaderResourceType::Sampler => DescriptorType::Sampler,
            ShaderResourceType::InputAttachment => DescriptorType::InputAttachment,
            ShaderResourceType::AccelStruct => DescriptorType::AccelerationStructure,
        })
    }
}

/// Where a resource lives in the descriptor sets of a Vulkan signature.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PipelineResourceAttribsVk {
    pub binding_index: u32,
    pub sampler_index: u32,
    pub array_size: u32,
    pub srb_cache_offset: u32,
    pub static_cache_offset: u32,
    /// A raw [`DescriptorType`].
    pub descriptor_type: u8,
    pub descriptor_set: u8,
    pub immutable_sampler_assigned: u8,
    pub _padding: u8,
}

impl PipelineResourceAttribsVk {
    /// Returns the descriptor type, or `None` if the raw value is invalid.
    #[inline]
    pub fn descriptor_type(&self) -> Option<DescriptorType> {
        DescriptorType::try_from(self.descriptor_type).ok()
    }
}

impl ResourceAttribs for PipelineResourceAttribsVk {
    #[inline]
    fn array_size(&self) -> u32 {
        self.array_size
    }

    #[inline]
    fn srb_cache_offset(&self) -> u32 {
        self.srb_cache_offset
    }

    #[inline]
    fn static_cache_offset(&self) -> u32 {
        self.static_cache_offset
    }

    #[inline]
    fn sampler_index(&self) -> u32 {
        self.sampler_index
    }

    #[inline]
    fn immutable_sampler_assigned(&self) -> bool {
        self.immutable_sampler_assigned != 0
    }
}

/// Where an immutable sampler lives in the descriptor sets of a Vulkan signature.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ImmutableSamplerAttribsVk {
    pub descriptor_set: u32,
    pub binding_index: u32,
    pub array_size: u32,
}

/// Vulkan data of a whole signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScalarsVk {
    pub descriptor_set_count: u8,
    pub dynamic_uniform_buffer_count: u16,
    pub dynamic_storage_buffer_count: u16,
}

impl<'a> Serialize<'a> for ScalarsVk {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_u8(&mut self.descriptor_set_count)?;
        ser.serialize_u16(&mut self.dynamic_uniform_buffer_count)?;
        ser.serialize_u16(&mut self.dynamic_storage_buffer_count)
    }
}

impl Backend for Vulkan {
    const DEVICE_TYPE: DeviceType = DeviceType::Vulkan;

    type ResourceAttribs = PipelineResourceAttribsVk;
    type ImmutableSamplerAttribs = ImmutableSamplerAttribsVk;
    type Scalars = ScalarsVk;

    fn build_signature_data(
        desc: &PipelineResourceSignatureDesc<'_>,
        layout: &SignatureLayout,
    ) -> Result<SignatureData<Self>, SignatureError> {
        let has_standalone_samplers = (0..desc.immutable_samplers.len()).any(|index| {
            !layout
                .resources()
                .iter()
                .any(|res| res.immutable_sampler_index == index as u32)
        });
        let has_static_mutable_set = has_standalone_samplers
            || desc
                .resources
                .iter()
                .any(|res| res.var_type != ShaderResourceVariableType::Dynamic);
        let has_dynamic_set = desc
            .resources
            .iter()
            .any(|res| res.var_type == ShaderResourceVariableType::Dynamic);
        let dynamic_set = has_static_mutable_set as u8;

        let mut binding_counts = [0u32; 2];
        let mut scalars = ScalarsVk {
            descriptor_set_count: has_static_mutable_set as u8 + has_dynamic_set as u8,
            ..Default::default()
        };
        let mut resource_attribs = Vec::with_capacity(desc.resources.len());

        for (res, res_layout) in desc.resources.iter().zip(layout.resources()) {
            let descriptor_type =
                DescriptorType::from_resource(res, res_layout.sampler_index != INVALID_INDEX)
                    .ok_or_else(|| SignatureError::UnknownResourceType {
                        resource: res.name.to_owned(),
                    })?;
            let descriptor_set = if res.var_type == ShaderResourceVariableType::Dynamic {
                dynamic_set
            } else {
                0
            };
            let binding_index = binding_counts[descriptor_set as usize];
            binding_counts[descriptor_set as usize] += 1;

            let counter = match descriptor_type {
                DescriptorType::UniformBufferDynamic => {
                    Some(&mut scalars.dynamic_uniform_buffer_count)
                }
                DescriptorType::StorageBufferDynamic => {
                    Some(&mut scalars.dynamic_storage_buffer_count)
                }
                _ => None,
            };

            if let Some(counter) = counter {
                *counter = u32::from(*counter)
                    .checked_add(res.array_size)
                    .and_then(|count| u16::try_from(count).ok())
                    .ok_or(SignatureError::CacheTooLarge)?;
            }

            resource_attribs.push(PipelineResourceAttribsVk {
                binding_index,
                sampler_index: res_layout.sampler_index,
                array_size: res.array_size,
                srb_cache_offset: res_layout.srb_cache_offset,
                static_cache_offset: res_layout.static_cache_offset,
                descriptor_type: descriptor_type.into(),
                descriptor_set,
                immutable_sampler_assigned: res_layout.has_immutable_sampler() as u8,
                _padding: 0,
            });
        }

        let immutable_samplers = (0..desc.immutable_samplers.len() as u32)
            .map(|index| {
                let assigned = layout
                    .resources()
                    .iter()
                    .position(|res| res.immutable_sampler_index == index);

                match assigned {
                    Some(res_index) => {
                        let attribs = &resource_attribs[res_index];

                        ImmutableSamplerAttribsVk {
                            descriptor_set: attribs.descriptor_set.into(),
                            binding_index: attribs.binding_index,
                            array_size: attribs.array_size,
                        }
                    }
                    None => {
                        let binding_index = binding_counts[0];
                        binding_counts[0] += 1;

                        ImmutableSamplerAttribsVk {
                            descriptor_set: 0,
                            binding_index,
                            array_size: 1,
                        }
                    }
                }
            })
            .collect();

        Ok(SignatureData {
            scalars,
            resource_attribs,
            immutable_samplers,
        })
    }

    fn validate_signature_data(
        desc: &PipelineResourceSignatureDesc<'_>,
        layout: &SignatureLayout,
        data: &SerializedSignatureData<'_, Self>,
    ) -> Result<(), DecodeError> {
        check_common_attribs(desc, layout, data)?;

        for ((res, res_layout), attribs) in desc
            .resources
            .iter()
            .zip(layout.resources())
            .zip(data.resource_attribs)
        {
            let expected =
                DescriptorType::from_resource(res, res_layout.sampler_index != INVALID_INDEX);

            if attribs.descriptor_type() != expected {
                return Err(DecodeError::InconsistentData {
                    what: "the descriptor type of a resource differs from its description",
                });
            }

            if attribs.descriptor_set >= data.scalars.descriptor_set_count {
                return Err(DecodeError::InconsistentData {
                    what: "a resource refers to a descriptor set that doesn't exist",
                });
            }
        }

        if data.scalars.descriptor_set_count > 2
            || data
                .immutable_samplers
                .iter()
                .any(|sam| sam.descriptor_set >= u32::from(data.scalars.descriptor_set_count))
        {
            return Err(DecodeError::InconsistentData {
                what: "an immutable sampler refers to a descriptor set that doesn't exist",
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::tests::{sample_immutable_samplers, sample_resources},
        pipeline::ShaderStages,
    };

    #[test]
    fn attribute_record_has_no_padding() {
        assert_eq!(std::mem::size_of::<PipelineResourceAttribsVk>(), 24);
        assert_eq!(std::mem::size_of::<ImmutableSamplerAttribsVk>(), 12);
    }

    #[test]
    fn descriptor_sets_and_bindings() {
        let resources = sample_resources();
        let samplers = sample_immutable_samplers();
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            immutable_samplers: &samplers,
            use_combined_texture_samplers: true,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let data = Vulkan::build_signature_data(&desc, &layout).unwrap();
        let attribs = &data.resource_attribs;

        assert_eq!(data.scalars.descriptor_set_count, 2);
        assert_eq!(data.scalars.dynamic_storage_buffer_count, 1);
        assert_eq!(data.scalars.dynamic_uniform_buffer_count, 0);

        let placement: Vec<_> = attribs
            .iter()
            .map(|a| (a.descriptor_set, a.binding_index, a.descriptor_type()))
            .collect();
        assert_eq!(
            placement,
            [
                (0, 0, Some(DescriptorType::UniformBuffer)),
                (0, 1, Some(DescriptorType::CombinedImageSampler)),
                (0, 2, Some(DescriptorType::Sampler)),
                (1, 0, Some(DescriptorType::StorageBufferDynamic)),
                (1, 1, Some(DescriptorType::StorageImage)),
            ],
        );
        assert_eq!(attribs[1].sampler_index, 2);
        assert_eq!(attribs[1].immutable_sampler_assigned, 1);
        assert_eq!(
            data.immutable_samplers,
            [ImmutableSamplerAttribsVk {
                descriptor_set: 0,
                binding_index: 1,
                array_size: 3,
            }],
        );
    }

    #[test]
    fn dynamic_only_signature_uses_set_zero() {
        let resources = [PipelineResourceDesc::new(
            ShaderStages::COMPUTE,
            "Params",
            ShaderResourceType::ConstantBuffer,
            ShaderResourceVariableType::Dynamic,
        )];
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let data = Vulkan::build_signature_data(&desc, &layout).unwrap();

        assert_eq!(data.scalars.descriptor_set_count, 1);
        assert_eq!(data.scalars.dynamic_uniform_buffer_count, 1);
        assert_eq!(data.resource_attribs[0].descriptor_set, 0);
        assert_eq!(
            data.resource_attribs[0].descriptor_type(),
            Some(DescriptorType::UniformBufferDynamic),
        );
    }

    #[test]
    fn invalid_descriptor_type_is_rejected() {
        let resources = sample_resources();
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let mut data = Vulkan::build_signature_data(&desc, &layout).unwrap();
        data.resource_attribs[0].descriptor_type = 200;

        assert!(matches!(
            Vulkan::validate_signature_data(&desc, &layout, &data.as_serialized()),
            Err(DecodeError::InconsistentData { .. }),
        ));
    }
}
