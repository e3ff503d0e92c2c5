// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Signatures for Direct3D 12 devices.
//!
//! The register space of every resource is the binding index of the signature. Registers are
//! assigned per range type in description order. Resources are grouped into root descriptor
//! tables, one per variable type and descriptor heap (CBV/SRV/UAV or sampler) that has at least
//! one resource. Samplers that have an immutable sampler assigned become static samplers of the
//! root signature and are not part of any table.

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
        PipelineResourceSignatureDesc, ShaderResourceType, SignatureError,
    },
};
use bytemuck::{Pod, Zeroable};

/// The Direct3D 12 backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Direct3D12;

archive_enum! {
    /// A Direct3D 12 descriptor range type.
    RangeType
    impl {
        /// Returns the range type of a resource type.
        pub const fn from_resource_type(resource_type: ShaderResourceType) -> Option<Self> {
            Some(match resource_type {
                ShaderResourceType::Unknown => return None,
                ShaderResourceType::ConstantBuffer => RangeType::Cbv,
                ShaderResourceType::TextureSrv
                | ShaderResourceType::BufferSrv
                | ShaderResourceType::InputAttachment
                | ShaderResourceType::AccelStruct => RangeType::Srv,
                ShaderResourceType::TextureUav | ShaderResourceType::BufferUav => RangeType::Uav,
                ShaderResourceType::Sampler => RangeType::Sampler,
            })
        }

        /// Returns whether descriptors of this range live in the sampler heap.
        #[inline]
        pub const fn is_sampler(self) -> bool {
            matches!(self, RangeType::Sampler)
        }
    }
    = u8;

    Srv = 0,
    Uav = 1,
    Cbv = 2,
    Sampler = 3,
}

/// Where a resource lives in the root signature.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PipelineResourceAttribsD3D12 {
    pub register: u32,
    pub sampler_index: u32,
    pub array_size: u32,
    /// The root parameter of the descriptor table, or `u32::MAX` for static samplers.
    pub root_index: u32,
    pub offset_from_table_start: u32,
    pub srb_cache_offset: u32,
    pub static_cache_offset: u32,
    pub register_space: u16,
    /// A raw [`RangeType`].
    pub range_type: u8,
    pub immutable_sampler_assigned: u8,
}

impl PipelineResourceAttribsD3D12 {
    /// Returns the range type, or `None` if the raw value is invalid.
    #[inline]
    pub fn range_type(&self) -> Option<RangeType> {
        RangeType::try_from(self.range_type).ok()
    }
}

impl ResourceAttribs for PipelineResourceAttribsD3D12 {
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

/// A static sampler of the root signature.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ImmutableSamplerAttribsD3D12 {
    pub shader_register: u32,
    pub register_space: u32,
    pub array_size: u32,
}

/// Direct3D 12 data of a whole signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScalarsD3D12 {
    pub root_parameter_count: u32,
    pub static_sampler_count: u32,
}

impl<'a> Serialize<'a> for ScalarsD3D12 {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_u32(&mut self.root_parameter_count)?;
        ser.serialize_u32(&mut self.static_sampler_count)
    }
}

impl Backend for Direct3D12 {
    const DEVICE_TYPE: DeviceType = DeviceType::Direct3D12;

    type ResourceAttribs = PipelineResourceAttribsD3D12;
    type ImmutableSamplerAttribs = ImmutableSamplerAttribsD3D12;
    type Scalars = ScalarsD3D12;

    fn build_signature_data(
        desc: &PipelineResourceSignatureDesc<'_>,
        layout: &SignatureLayout,
    ) -> Result<SignatureData<Self>, SignatureError> {
        let register_space = u16::from(desc.binding_index);
        let mut registers = [0u32; RangeType::COUNT];
        // Root index and element count of every (variable type, heap) table.
        let mut tables = [[None::<(u32, u32)>; 2]; 3];
        let mut root_parameter_count = 0;
        let mut resource_attribs = Vec::with_capacity(desc.resources.len());

        for (res, res_layout) in desc.resources.iter().zip(layout.resources()) {
            let range_type = RangeType::from_resource_type(res.resource_type).ok_or_else(|| {
                SignatureError::UnknownResourceType {
                    resource: res.name.to_owned(),
                }
            })?;

            let register = &mut registers[range_type as usize];
            let first_register = *register;
            *register = register
                .checked_add(res.array_size)
                .ok_or(SignatureError::CacheTooLarge)?;

            let is_static_sampler = range_type.is_sampler() && res_layout.has_immutable_sampler();
            let (root_index, offset_from_table_start) = if is_static_sampler {
                (INVALID_INDEX, INVALID_INDEX)
            } else {
                let table =
                    &mut tables[res.var_type.index()][range_type.is_sampler() as usize];
                let (root_index, size) = table.get_or_insert_with(|| {
                    root_parameter_count += 1;
                    (root_parameter_count - 1, 0)
                });
                let offset = *size;
                *size = size
                    .checked_add(res.array_size)
                    .ok_or(SignatureError::CacheTooLarge)?;

                (*root_index, offset)
            };

            resource_attribs.push(PipelineResourceAttribsD3D12 {
                register: first_register,
                sampler_index: res_layout.sampler_index,
                array_size: res.array_size,
                root_index,
                offset_from_table_start,
                srb_cache_offset: res_layout.srb_cache_offset,
                static_cache_offset: res_layout.static_cache_offset,
                register_space,
                range_type: range_type.into(),
                immutable_sampler_assigned: res_layout.has_immutable_sampler() as u8,
            });
        }

        let immutable_samplers: Vec<_> = (0..desc.immutable_samplers.len() as u32)
            .map(|index| {
                let assigned = desc
                    .resources
                    .iter()
                    .zip(layout.resources())
                    .position(|(res, res_layout)| {
                        res.resource_type == ShaderResourceType::Sampler
                            && res_layout.immutable_sampler_index == index
                    });

                match assigned {
                    Some(res_index) => {
                        let attribs = &resource_attribs[res_index];

                        ImmutableSamplerAttribsD3D12 {
                            shader_register: attribs.register,
                            register_space: attribs.register_space.into(),
                            array_size: attribs.array_size,
                        }
                    }
                    None => {
                        let register = &mut registers[RangeType::Sampler as usize];
                        let shader_register = *register;
                        *register += 1;

                        ImmutableSamplerAttribsD3D12 {
                            shader_register,
                            register_space: register_space.into(),
                            array_size: 1,
                        }
                    }
                }
            })
            .collect();

        Ok(SignatureData {
            scalars: ScalarsD3D12 {
                root_parameter_count,
                static_sampler_count: immutable_samplers.len() as u32,
            },
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

        for (res, attribs) in desc.resources.iter().zip(data.resource_attribs) {
            if attribs.range_type() != RangeType::from_resource_type(res.resource_type) {
                return Err(DecodeError::InconsistentData {
                    what: "the range type of a resource differs from its description",
                });
            }

            if attribs.register_space != u16::from(desc.binding_index) {
                return Err(DecodeError::InconsistentData {
                    what: "the register space of a resource differs from the binding index",
                });
            }

            let is_static_sampler = attribs.range_type().is_some_and(RangeType::is_sampler)
                && attribs.immutable_sampler_assigned();

            if !is_static_sampler && attribs.root_index >= data.scalars.root_parameter_count {
                return Err(DecodeError::InconsistentData {
                    what: "a resource refers to a root parameter that doesn't exist",
                });
            }
        }

        if data.scalars.static_sampler_count as usize != data.immutable_samplers.len() {
            return Err(DecodeError::InconsistentData {
                what: "the number of static samplers is invalid",
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::tests::sample_resources,
        pipeline::{ImmutableSamplerDesc, ShaderStages},
    };

    #[test]
    fn attribute_record_has_no_padding() {
        assert_eq!(std::mem::size_of::<PipelineResourceAttribsD3D12>(), 32);
    }

    #[test]
    fn registers_and_root_tables() {
        let resources = sample_resources();
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            binding_index: 2,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let data = Direct3D12::build_signature_data(&desc, &layout).unwrap();

        let placement: Vec<_> = data
            .resource_attribs
            .iter()
            .map(|a| {
                (
                    a.range_type(),
                    a.register,
                    a.root_index,
                    a.offset_from_table_start,
                )
            })
            .collect();

        // Tables: static CBV/SRV/UAV, mutable CBV/SRV/UAV, mutable samplers, dynamic
        // CBV/SRV/UAV, in order of first use.
        assert_eq!(
            placement,
            [
                (Some(RangeType::Cbv), 0, 0, 0),
                (Some(RangeType::Srv), 0, 1, 0),
                (Some(RangeType::Sampler), 0, 2, 0),
                (Some(RangeType::Srv), 3, 3, 0),
                (Some(RangeType::Uav), 0, 3, 1),
            ],
        );
        assert!(data.resource_attribs.iter().all(|a| a.register_space == 2));
        assert_eq!(data.scalars.root_parameter_count, 4);
    }

    #[test]
    fn immutable_samplers_become_static_samplers() {
        let resources = sample_resources();
        let samplers = [
            ImmutableSamplerDesc {
                shader_stages: ShaderStages::PIXEL,
                sampler_or_texture_name: "Albedo_sampler",
                ..Default::default()
            },
            ImmutableSamplerDesc {
                shader_stages: ShaderStages::PIXEL,
                sampler_or_texture_name: "Unused",
                ..Default::default()
            },
        ];
        let desc = PipelineResourceSignatureDesc {
            resources: &resources,
            immutable_samplers: &samplers,
            ..Default::default()
        };
        let layout = SignatureLayout::new(&desc).unwrap();
        let data = Direct3D12::build_signature_data(&desc, &layout).unwrap();

        assert_eq!(data.resource_attribs[2].root_index, INVALID_INDEX);
        assert_eq!(data.scalars.root_parameter_count, 3);
        assert_eq!(
            data.immutable_samplers,
            [
                ImmutableSamplerAttribsD3D12 {
                    shader_register: 0,
                    register_space: 0,
                    array_size: 1,
                },
                ImmutableSamplerAttribsD3D12 {
                    shader_register: 1,
                    register_space: 0,
                    array_size: 1,
                },
            ],
        );
        Direct3D12::validate_signature_data(&desc, &layout, &data.as_serialized()).unwrap();
    }
}
