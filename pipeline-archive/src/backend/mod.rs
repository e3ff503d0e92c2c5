// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The graphics APIs that signatures can be created for.
//!
//! A [`Backend`] turns a signature description into attribute records that locate every
//! resource in the API's binding model, for example a descriptor set and binding in Vulkan, or a
//! register and a root table in Direct3D 12. The records are [`Pod`] and are stored as flat byte
//! spans in archives, one section per device type, so that unpacking a signature only has to
//! check them instead of deriving them again.

pub use self::{
    d3d12::{Direct3D12, ImmutableSamplerAttribsD3D12, PipelineResourceAttribsD3D12, RangeType},
    vulkan::{DescriptorType, ImmutableSamplerAttribsVk, PipelineResourceAttribsVk, Vulkan},
};
use crate::{
    archive::{
        serializer::{Serialize, Serializer},
        DecodeError,
    },
    device::DeviceType,
    memory::FixedLinearAllocator,
    pipeline::{layout::SignatureLayout, PipelineResourceSignatureDesc, SignatureError},
};
use bytemuck::Pod;
use std::fmt::Debug;

pub mod d3d12;
pub mod vulkan;

/// A graphics API that signatures can be created for.
pub trait Backend: Copy + Debug + Default + Send + Sync + 'static {
    /// The type of the devices of this backend.
    const DEVICE_TYPE: DeviceType;

    /// Where a single resource lives in the binding model of the API.
    type ResourceAttribs: Pod + Debug + PartialEq + ResourceAttribs + Send + Sync;

    /// Where an immutable sampler lives in the binding model of the API.
    type ImmutableSamplerAttribs: Pod + Debug + PartialEq + Send + Sync;

    /// Backend data that applies to the signature as a whole.
    type Scalars: Copy + Default + Debug + PartialEq + Send + Sync + for<'a> Serialize<'a>;

    /// Derives the attributes of every resource and immutable sampler of `desc`.
    ///
    /// `layout` must have been created from `desc`.
    fn build_signature_data(
        desc: &PipelineResourceSignatureDesc<'_>,
        layout: &SignatureLayout,
    ) -> Result<SignatureData<Self>, SignatureError>;

    /// Checks attributes that were read from an archive against the description they were
    /// archived with.
    ///
    /// This only performs checks that are cheap compared to deriving the attributes, enough to
    /// guarantee that the attributes can't make the binding code access memory out of bounds.
    fn validate_signature_data(
        desc: &PipelineResourceSignatureDesc<'_>,
        layout: &SignatureLayout,
        data: &SerializedSignatureData<'_, Self>,
    ) -> Result<(), DecodeError>;
}

/// Accessors for the part of the resource attributes that all backends share.
pub trait ResourceAttribs {
    /// Returns the number of array elements of the resource.
    fn array_size(&self) -> u32;

    /// Returns the offset of the resource within its group of the shader resource binding cache.
    fn srb_cache_offset(&self) -> u32;

    /// Returns the offset of the resource in the static cache, or `u32::MAX`.
    fn static_cache_offset(&self) -> u32;

    /// Returns the index of the combined sampler resource, or `u32::MAX`.
    fn sampler_index(&self) -> u32;

    /// Returns whether an immutable sampler is assigned to the resource.
    fn immutable_sampler_assigned(&self) -> bool;
}

/// The backend specific data of a signature.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignatureData<B: Backend> {
    pub scalars: B::Scalars,
    pub resource_attribs: Vec<B::ResourceAttribs>,
    pub immutable_samplers: Vec<B::ImmutableSamplerAttribs>,
}

impl<B: Backend> SignatureData<B> {
    /// Returns a view that can be serialized.
    #[inline]
    pub fn as_serialized(&self) -> SerializedSignatureData<'_, B> {
        SerializedSignatureData {
            scalars: self.scalars,
            resource_attribs: &self.resource_attribs,
            immutable_samplers: &self.immutable_samplers,
        }
    }

    /// Copies data that was read from an archive.
    #[inline]
    pub fn from_serialized(data: &SerializedSignatureData<'_, B>) -> Self {
        SignatureData {
            scalars: data.scalars,
            resource_attribs: data.resource_attribs.to_vec(),
            immutable_samplers: data.immutable_samplers.to_vec(),
        }
    }
}

/// The archived form of [`SignatureData`]: the scalars, then the resource attributes, then the
/// immutable sampler attributes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SerializedSignatureData<'a, B: Backend> {
    pub scalars: B::Scalars,
    pub resource_attribs: &'a [B::ResourceAttribs],
    pub immutable_samplers: &'a [B::ImmutableSamplerAttribs],
}

impl<B: Backend> Default for SerializedSignatureData<'_, B> {
    fn default() -> Self {
        SerializedSignatureData {
            scalars: Default::default(),
            resource_attribs: &[],
            immutable_samplers: &[],
        }
    }
}

impl<'a, B: Backend> Serialize<'a> for SerializedSignatureData<'a, B> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        self.scalars.serialize(ser, allocator)?;
        ser.serialize_pod_array(&mut self.resource_attribs, allocator)?;
        ser.serialize_pod_array(&mut self.immutable_samplers, allocator)
    }
}

/// Checks the attributes that every backend shares against `layout`.
pub(crate) fn check_common_attribs<B: Backend>(
    desc: &PipelineResourceSignatureDesc<'_>,
    layout: &SignatureLayout,
    data: &SerializedSignatureData<'_, B>,
) -> Result<(), DecodeError> {
    if data.resource_attribs.len() != desc.resources.len() {
        return Err(DecodeError::InconsistentData {
            what: "the number of resource attributes differs from the number of resources",
        });
    }

    if data.immutable_samplers.len() != desc.immutable_samplers.len() {
        return Err(DecodeError::InconsistentData {
            what: "the number of immutable sampler attributes differs from the description",
        });
    }

    for ((res, attribs), res_layout) in desc
        .resources
        .iter()
        .zip(data.resource_attribs)
        .zip(layout.resources())
    {
        if attribs.array_size() != res.array_size {
            return Err(DecodeError::InconsistentData {
                what: "the array size of a resource differs from its description",
            });
        }

        if attribs.srb_cache_offset() != res_layout.srb_cache_offset
            || attribs.static_cache_offset() != res_layout.static_cache_offset
        {
            return Err(DecodeError::InconsistentData {
                what: "the cache offset of a resource is invalid",
            });
        }

        if attribs.sampler_index() != res_layout.sampler_index
            || attribs.immutable_sampler_assigned() != res_layout.has_immutable_sampler()
        {
            return Err(DecodeError::InconsistentData {
                what: "the sampler assignment of a resource is invalid",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        archive::serializer::{deserialize, measure, serialize_to_vec},
        pipeline::{
            ImmutableSamplerDesc, PipelineResourceDesc, ShaderResourceType,
            ShaderResourceVariableType, ShaderStages,
        },
        tests::CountingAllocator,
    };
    use std::sync::Arc;

    pub(crate) fn sample_resources() -> [PipelineResourceDesc<'static>; 5] {
        [
            PipelineResourceDesc::new(
                ShaderStages::VERTEX | ShaderStages::PIXEL,
                "Constants",
                ShaderResourceType::ConstantBuffer,
                ShaderResourceVariableType::Static,
            ),
            PipelineResourceDesc {
                array_size: 3,
                ..PipelineResourceDesc::new(
                    ShaderStages::PIXEL,
                    "Albedo",
                    ShaderResourceType::TextureSrv,
                    ShaderResourceVariableType::Mutable,
                )
            },
            PipelineResourceDesc::new(
                ShaderStages::PIXEL,
                "Albedo_sampler",
                ShaderResourceType::Sampler,
                ShaderResourceVariableType::Mutable,
            ),
            PipelineResourceDesc::new(
                ShaderStages::VERTEX,
                "Instances",
                ShaderResourceType::BufferSrv,
                ShaderResourceVariableType::Dynamic,
            ),
            PipelineResourceDesc::new(
                ShaderStages::PIXEL,
                "Output",
                ShaderResourceType::TextureUav,
                ShaderResourceVariableType::Dynamic,
            ),
        ]
    }

    pub(crate) fn sample_immutable_samplers() -> [ImmutableSamplerDesc<'static>; 1] {
        [ImmutableSamplerDesc {
            shader_stages: ShaderStages::PIXEL,
            sampler_or_texture_name: "Albedo",
            ..Default::default()
        }]
    }

    fn round_trip<B: Backend + PartialEq>() {
        let resources = sample_resources();
        let samplers = sample_immutable_samplers();
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            immutable_samplers: &samplers,
            use_combined_texture_samplers: true,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let data = B::build_signature_data(&desc, &layout).unwrap();
        let serialized = data.as_serialized();

        let bytes = serialize_to_vec(&serialized);
        assert_eq!(measure(&serialized), bytes.len());

        let arena = FixedLinearAllocator::new(Arc::new(CountingAllocator::new()));
        let decoded: SerializedSignatureData<'_, B> = deserialize(&bytes, &arena).unwrap();
        assert_eq!(decoded, serialized);
        B::validate_signature_data(&desc, &layout, &decoded).unwrap();
        assert_eq!(SignatureData::from_serialized(&decoded), data);
    }

    #[test]
    fn vulkan_round_trip() {
        round_trip::<Vulkan>();
    }

    #[test]
    fn d3d12_round_trip() {
        round_trip::<Direct3D12>();
    }

    #[test]
    fn tampered_offsets_are_rejected() {
        let resources = sample_resources();
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let mut data = Vulkan::build_signature_data(&desc, &layout).unwrap();
        data.resource_attribs[1].srb_cache_offset += 1;

        assert_eq!(
            Vulkan::validate_signature_data(&desc, &layout, &data.as_serialized()),
            Err(DecodeError::InconsistentData {
                what: "the cache offset of a resource is invalid",
            }),
        );

        let mut data = Direct3D12::build_signature_data(&desc, &layout).unwrap();
        data.resource_attribs.pop();

        assert!(matches!(
            Direct3D12::validate_signature_data(&desc, &layout, &data.as_serialized()),
            Err(DecodeError::InconsistentData { .. }),
        ));
    }
}
