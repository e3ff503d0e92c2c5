// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The backend independent part of a signature's layout.

use super::{
    PipelineResourceDesc, PipelineResourceFlags, PipelineResourceSignatureDesc, PipelineType,
    ShaderResourceType, ShaderResourceVariableType, ShaderStages, MAX_RESOURCE_SIGNATURES,
    MAX_SHADERS_IN_PIPELINE,
};
use crate::{
    archive::{
        serializer::{Serialize, Serializer},
        DecodeError,
    },
    device::DeviceType,
    memory::{AllocationError, FixedLinearAllocator},
};
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

/// Marks a missing sampler or immutable sampler.
pub const INVALID_INDEX: u32 = u32::MAX;

impl Default for PipelineType {
    #[inline]
    fn default() -> Self {
        PipelineType::Unknown
    }
}

/// Data derived from a signature description that is stored next to it in an archive.
///
/// When a signature is unpacked, the data is derived again from the description and compared,
/// which catches archives whose description and derived data disagree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineResourceSignatureInternalData {
    pub shader_stages: ShaderStages,
    pub static_res_shader_stages: ShaderStages,
    pub pipeline_type: PipelineType,
    pub static_res_stage_index: [i8; MAX_SHADERS_IN_PIPELINE],
}

impl<'a> Serialize<'a> for PipelineResourceSignatureInternalData {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_flags(&mut self.shader_stages)?;
        ser.serialize_flags(&mut self.static_res_shader_stages)?;
        ser.serialize_enum(&mut self.pipeline_type)?;

        for index in &mut self.static_res_stage_index {
            ser.serialize_i8(index)?;
        }

        Ok(())
    }
}

/// Where a resource lives in the resource caches, and which samplers belong to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLayout {
    /// Offset of the first array element within the resource's variable type group of the
    /// cache of a shader resource binding.
    pub srb_cache_offset: u32,

    /// Offset of the first array element in the static cache of the signature, or
    /// [`INVALID_INDEX`] if the resource is not static.
    pub static_cache_offset: u32,

    /// For a texture combined with a sampler, the index of the sampler resource.
    pub sampler_index: u32,

    /// Index of the immutable sampler assigned to the resource.
    pub immutable_sampler_index: u32,
}

impl ResourceLayout {
    /// Returns whether an immutable sampler is assigned to the resource.
    #[inline]
    pub fn has_immutable_sampler(&self) -> bool {
        self.immutable_sampler_index != INVALID_INDEX
    }
}

/// Returns whether a resource can be bound through a shader variable.
///
/// Samplers that have an immutable sampler assigned can't be changed, so they have no variable.
#[inline]
pub(crate) fn exposes_variable(resource_type: ShaderResourceType, layout: &ResourceLayout) -> bool {
    !(resource_type == ShaderResourceType::Sampler && layout.has_immutable_sampler())
}

/// The layout of a signature that all backends share.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureLayout {
    pipeline_type: PipelineType,
    shader_stages: ShaderStages,
    active_stages: SmallVec<[ShaderStages; MAX_SHADERS_IN_PIPELINE]>,
    active_stage_index: [i8; MAX_SHADERS_IN_PIPELINE],
    static_stages: SmallVec<[ShaderStages; MAX_SHADERS_IN_PIPELINE]>,
    static_res_stage_index: [i8; MAX_SHADERS_IN_PIPELINE],
    resources: Vec<ResourceLayout>,
    srb_cache_sizes: [u32; 3],
    srb_variable_counts: SmallVec<[u32; MAX_SHADERS_IN_PIPELINE]>,
    static_variable_counts: SmallVec<[u32; MAX_SHADERS_IN_PIPELINE]>,
}

impl SignatureLayout {
    /// Validates `desc` and derives its layout.
    pub fn new(desc: &PipelineResourceSignatureDesc<'_>) -> Result<Self, SignatureError> {
        validate_desc(desc)?;

        let shader_stages = desc
            .resources
            .iter()
            .map(|res| res.shader_stages)
            .chain(desc.immutable_samplers.iter().map(|sam| sam.shader_stages))
            .fold(ShaderStages::empty(), |acc, stages| acc | stages);
        let pipeline_type = shader_stages
            .pipeline_type()
            .ok_or(SignatureError::IncompatibleStages { shader_stages })?;

        let static_res_shader_stages = desc
            .resources
            .iter()
            .filter(|res| res.var_type == ShaderResourceVariableType::Static)
            .fold(ShaderStages::empty(), |acc, res| acc | res.shader_stages);

        let (active_stages, active_stage_index) = stage_indices(shader_stages);
        let (static_stages, static_res_stage_index) = stage_indices(static_res_shader_stages);

        let mut srb_cache_sizes = [0u32; 3];
        let mut resources = Vec::with_capacity(desc.resources.len());

        for res in desc.resources {
            let group = &mut srb_cache_sizes[res.var_type.index()];
            let srb_cache_offset = *group;
            *group = group
                .checked_add(res.array_size)
                .ok_or(SignatureError::CacheTooLarge)?;

            let static_cache_offset = if res.var_type == ShaderResourceVariableType::Static {
                srb_cache_offset
            } else {
                INVALID_INDEX
            };

            resources.push(ResourceLayout {
                srb_cache_offset,
                static_cache_offset,
                sampler_index: find_combined_sampler(desc, res),
                immutable_sampler_index: find_immutable_sampler(desc, res),
            });
        }

        if srb_cache_sizes
            .iter()
            .try_fold(0u32, |acc, &size| acc.checked_add(size))
            .is_none()
        {
            return Err(SignatureError::CacheTooLarge);
        }

        let count_variables = |stage: ShaderStages, static_vars: bool| {
            desc.resources
                .iter()
                .zip(&resources)
                .filter(|(res, layout)| {
                    res.shader_stages.intersects(stage)
                        && (res.var_type == ShaderResourceVariableType::Static) == static_vars
                        && exposes_variable(res.resource_type, layout)
                })
                .count() as u32
        };
        let srb_variable_counts = active_stages
            .iter()
            .map(|&stage| count_variables(stage, false))
            .collect();
        let static_variable_counts = static_stages
            .iter()
            .map(|&stage| count_variables(stage, true))
            .collect();

        Ok(SignatureLayout {
            pipeline_type,
            shader_stages,
            active_stages,
            active_stage_index,
            static_stages,
            static_res_stage_index,
            resources,
            srb_cache_sizes,
            srb_variable_counts,
            static_variable_counts,
        })
    }

    /// Returns the data that is archived next to the description.
    pub fn internal_data(&self) -> PipelineResourceSignatureInternalData {
        PipelineResourceSignatureInternalData {
            shader_stages: self.shader_stages,
            static_res_shader_stages: self.static_res_shader_stages(),
            pipeline_type: self.pipeline_type,
            static_res_stage_index: self.static_res_stage_index,
        }
    }

    /// Returns the type of pipeline the signature can be used with.
    #[inline]
    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    /// Returns all stages that access a resource or an immutable sampler.
    #[inline]
    pub fn shader_stages(&self) -> ShaderStages {
        self.shader_stages
    }

    /// Returns the stages that access at least one static resource.
    #[inline]
    pub fn static_res_shader_stages(&self) -> ShaderStages {
        self.static_stages
            .iter()
            .fold(ShaderStages::empty(), |acc, &stage| acc | stage)
    }

    /// Returns the individual stages of [`shader_stages`](Self::shader_stages), in bit order.
    /// A shader resource binding has one variable manager per active stage.
    #[inline]
    pub fn active_stages(&self) -> &[ShaderStages] {
        &self.active_stages
    }

    /// Returns the individual stages that access static resources, in bit order.
    #[inline]
    pub fn static_stages(&self) -> &[ShaderStages] {
        &self.static_stages
    }

    /// Returns the position of `stage` among the active stages.
    #[inline]
    pub fn active_stage_index(&self, stage: ShaderStages) -> Option<usize> {
        lookup_stage(&self.active_stage_index, stage)
    }

    /// Returns the position of `stage` among the stages with static resources.
    #[inline]
    pub fn static_stage_index(&self, stage: ShaderStages) -> Option<usize> {
        lookup_stage(&self.static_res_stage_index, stage)
    }

    /// Returns the cache layout of every resource, in description order.
    #[inline]
    pub fn resources(&self) -> &[ResourceLayout] {
        &self.resources
    }

    /// Returns the number of cache slots for each variable type, in
    /// [`ShaderResourceVariableType::ALL`] order.
    #[inline]
    pub fn srb_cache_sizes(&self) -> [u32; 3] {
        self.srb_cache_sizes
    }

    /// Returns the number of slots in the static cache of the signature.
    #[inline]
    pub fn static_cache_size(&self) -> u32 {
        self.srb_cache_sizes[ShaderResourceVariableType::Static.index()]
    }

    /// Returns the number of mutable and dynamic variables of every active stage.
    #[inline]
    pub fn srb_variable_counts(&self) -> &[u32] {
        &self.srb_variable_counts
    }

    /// Returns the number of static variables of every stage with static resources.
    #[inline]
    pub fn static_variable_counts(&self) -> &[u32] {
        &self.static_variable_counts
    }
}

fn stage_indices(
    stages: ShaderStages,
) -> (
    SmallVec<[ShaderStages; MAX_SHADERS_IN_PIPELINE]>,
    [i8; MAX_SHADERS_IN_PIPELINE],
) {
    let mut list = SmallVec::new();
    let mut indices = [-1; MAX_SHADERS_IN_PIPELINE];

    for stage in stages.iter() {
        if let Some(pipeline_index) = stage.pipeline_index() {
            indices[pipeline_index] = list.len() as i8;
            list.push(stage);
        }
    }

    (list, indices)
}

fn lookup_stage(indices: &[i8; MAX_SHADERS_IN_PIPELINE], stage: ShaderStages) -> Option<usize> {
    let index = indices[stage.pipeline_index()?];

    usize::try_from(index).ok()
}

fn find_combined_sampler(
    desc: &PipelineResourceSignatureDesc<'_>,
    res: &PipelineResourceDesc<'_>,
) -> u32 {
    if !desc.use_combined_texture_samplers || res.resource_type != ShaderResourceType::TextureSrv
    {
        return INVALID_INDEX;
    }

    desc.resources
        .iter()
        .position(|sam| {
            sam.resource_type == ShaderResourceType::Sampler
                && sam.shader_stages.intersects(res.shader_stages)
                && is_combined_name(sam.name, res.name, desc.combined_sampler_suffix)
        })
        .map_or(INVALID_INDEX, |index| index as u32)
}

fn find_immutable_sampler(
    desc: &PipelineResourceSignatureDesc<'_>,
    res: &PipelineResourceDesc<'_>,
) -> u32 {
    let matches_name = |name: &str| match res.resource_type {
        ShaderResourceType::Sampler => {
            name == res.name
                || desc.use_combined_texture_samplers
                    && is_combined_name(res.name, name, desc.combined_sampler_suffix)
        }
        ShaderResourceType::TextureSrv => desc.use_combined_texture_samplers && name == res.name,
        _ => false,
    };

    desc.immutable_samplers
        .iter()
        .position(|sam| {
            sam.shader_stages.intersects(res.shader_stages)
                && matches_name(sam.sampler_or_texture_name)
        })
        .map_or(INVALID_INDEX, |index| index as u32)
}

/// Returns whether `sampler` is `texture` followed by `suffix`.
fn is_combined_name(sampler: &str, texture: &str, suffix: &str) -> bool {
    sampler
        .strip_prefix(texture)
        .is_some_and(|rest| rest == suffix)
}

fn validate_desc(desc: &PipelineResourceSignatureDesc<'_>) -> Result<(), SignatureError> {
    if desc.binding_index >= MAX_RESOURCE_SIGNATURES {
        return Err(SignatureError::BindingIndexOutOfRange {
            binding_index: desc.binding_index,
        });
    }

    if desc.use_combined_texture_samplers && desc.combined_sampler_suffix.is_empty() {
        return Err(SignatureError::EmptyCombinedSamplerSuffix);
    }

    for (index, res) in desc.resources.iter().enumerate() {
        let resource = || res.name.to_owned();

        if res.shader_stages.is_empty() {
            return Err(SignatureError::EmptyShaderStages {
                resource: resource(),
            });
        }

        if res.array_size == 0 {
            return Err(SignatureError::ZeroArraySize {
                resource: resource(),
            });
        }

        if res.resource_type == ShaderResourceType::Unknown {
            return Err(SignatureError::UnknownResourceType {
                resource: resource(),
            });
        }

        let allowed_flags = match res.resource_type {
            ShaderResourceType::ConstantBuffer => PipelineResourceFlags::NO_DYNAMIC_BUFFERS,
            ShaderResourceType::TextureSrv => PipelineResourceFlags::COMBINED_SAMPLER,
            ShaderResourceType::BufferSrv | ShaderResourceType::BufferUav => {
                PipelineResourceFlags::NO_DYNAMIC_BUFFERS
                    | PipelineResourceFlags::FORMATTED_BUFFER
            }
            ShaderResourceType::InputAttachment => {
                PipelineResourceFlags::GENERAL_INPUT_ATTACHMENT
            }
            _ => PipelineResourceFlags::empty(),
        } | PipelineResourceFlags::RUNTIME_ARRAY;

        if !allowed_flags.contains(res.flags) {
            return Err(SignatureError::InvalidResourceFlags {
                resource: resource(),
                flags: res.flags,
            });
        }

        if desc.resources[..index]
            .iter()
            .any(|other| {
                other.name == res.name && other.shader_stages.intersects(res.shader_stages)
            })
        {
            return Err(SignatureError::DuplicateResource {
                resource: resource(),
            });
        }

        let sampler_index = find_combined_sampler(desc, res);

        if sampler_index != INVALID_INDEX {
            let sampler = &desc.resources[sampler_index as usize];

            if sampler.var_type != res.var_type {
                return Err(SignatureError::CombinedSamplerVariableTypeMismatch {
                    texture: resource(),
                    sampler: sampler.name.to_owned(),
                });
            }
        }
    }

    for sam in desc.immutable_samplers {
        if sam.shader_stages.is_empty() {
            return Err(SignatureError::EmptyShaderStages {
                resource: sam.sampler_or_texture_name.to_owned(),
            });
        }

        if sam.sampler_or_texture_name.is_empty() {
            return Err(SignatureError::UnnamedImmutableSampler);
        }
    }

    Ok(())
}

/// Error that can happen when creating a signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignatureError {
    /// The binding index is not less than [`MAX_RESOURCE_SIGNATURES`].
    BindingIndexOutOfRange { binding_index: u8 },

    /// Texture samplers are combined, but the sampler suffix is empty.
    EmptyCombinedSamplerSuffix,

    /// A resource or immutable sampler is not visible to any shader stage.
    EmptyShaderStages { resource: String },

    /// A resource has an array size of zero.
    ZeroArraySize { resource: String },

    /// A resource has the type [`ShaderResourceType::Unknown`].
    UnknownResourceType { resource: String },

    /// A resource has flags that don't apply to its type.
    InvalidResourceFlags {
        resource: String,
        flags: PipelineResourceFlags,
    },

    /// Two resources with the same name are visible to the same stage.
    DuplicateResource { resource: String },

    /// A texture and its combined sampler have different variable types.
    CombinedSamplerVariableTypeMismatch { texture: String, sampler: String },

    /// An immutable sampler has an empty name.
    UnnamedImmutableSampler,

    /// The stages of the signature can't be part of the same pipeline.
    IncompatibleStages { shader_stages: ShaderStages },

    /// The total number of cache slots doesn't fit in 32 bits.
    CacheTooLarge,

    /// The signature was created for a device of another type than its backend.
    IncompatibleDevice {
        expected: DeviceType,
        found: DeviceType,
    },

    /// Allocating the static resource cache of the signature failed.
    Allocation(AllocationError),
}

impl Error for SignatureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Allocation(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for SignatureError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::BindingIndexOutOfRange { binding_index } => write!(
                f,
                "the binding index {} is not less than {}",
                binding_index, MAX_RESOURCE_SIGNATURES,
            ),
            Self::EmptyCombinedSamplerSuffix => write!(
                f,
                "texture samplers are combined, but the combined sampler suffix is empty",
            ),
            Self::EmptyShaderStages { resource } => {
                write!(f, "`{}` is not visible to any shader stage", resource)
            }
            Self::ZeroArraySize { resource } => {
                write!(f, "the array size of `{}` is zero", resource)
            }
            Self::UnknownResourceType { resource } => {
                write!(f, "the type of `{}` is unknown", resource)
            }
            Self::InvalidResourceFlags { resource, flags } => write!(
                f,
                "the flags {:?} of `{}` don't apply to its resource type",
                flags, resource,
            ),
            Self::DuplicateResource { resource } => write!(
                f,
                "more than one resource named `{}` is visible to the same shader stage",
                resource,
            ),
            Self::CombinedSamplerVariableTypeMismatch { texture, sampler } => write!(
                f,
                "the texture `{}` and its combined sampler `{}` have different variable types",
                texture, sampler,
            ),
            Self::UnnamedImmutableSampler => write!(f, "an immutable sampler has no name"),
            Self::IncompatibleStages { shader_stages } => write!(
                f,
                "the shader stages {:?} can't be part of the same pipeline",
                shader_stages,
            ),
            Self::CacheTooLarge => write!(f, "the signature has too many resource array elements"),
            Self::IncompatibleDevice { expected, found } => write!(
                f,
                "the backend requires a {} device, but a {} device was provided",
                expected.name(),
                found.name(),
            ),
            Self::Allocation(_) => write!(f, "allocating the static resource cache failed"),
        }
    }
}

impl From<AllocationError> for SignatureError {
    #[inline]
    fn from(err: AllocationError) -> Self {
        Self::Allocation(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ImmutableSamplerDesc;

    const VS: ShaderStages = ShaderStages::VERTEX;
    const PS: ShaderStages = ShaderStages::PIXEL;

    #[test]
    fn cache_offsets_per_variable_type() {
        let resources = [
            PipelineResourceDesc::new(
                VS | PS,
                "Constants",
                ShaderResourceType::ConstantBuffer,
                ShaderResourceVariableType::Static,
            ),
            PipelineResourceDesc {
                array_size: 4,
                ..PipelineResourceDesc::new(
                    PS,
                    "Textures",
                    ShaderResourceType::TextureSrv,
                    ShaderResourceVariableType::Mutable,
                )
            },
            PipelineResourceDesc::new(
                PS,
                "Shadow",
                ShaderResourceType::TextureSrv,
                ShaderResourceVariableType::Mutable,
            ),
            PipelineResourceDesc::new(
                VS,
                "Instances",
                ShaderResourceType::BufferSrv,
                ShaderResourceVariableType::Dynamic,
            ),
        ];
        let layout = SignatureLayout::new(&PipelineResourceSignatureDesc {
            resources: &resources,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(layout.srb_cache_sizes(), [1, 5, 1]);
        assert_eq!(layout.static_cache_size(), 1);
        assert_eq!(layout.resources()[0].static_cache_offset, 0);
        assert_eq!(layout.resources()[2].srb_cache_offset, 4);
        assert_eq!(layout.resources()[2].static_cache_offset, INVALID_INDEX);
        assert_eq!(layout.active_stages(), [VS, PS]);
        assert_eq!(layout.active_stage_index(PS), Some(1));
        assert_eq!(layout.active_stage_index(ShaderStages::GEOMETRY), None);
        assert_eq!(layout.srb_variable_counts(), [1, 2]);
        assert_eq!(layout.static_variable_counts(), [1, 1]);
        assert_eq!(layout.pipeline_type(), PipelineType::Graphics);

        let internal = layout.internal_data();
        assert_eq!(internal.static_res_shader_stages, VS | PS);
        assert_eq!(internal.static_res_stage_index, [0, -1, -1, -1, 1]);
    }

    #[test]
    fn combined_and_immutable_samplers() {
        let resources = [
            PipelineResourceDesc::new(
                PS,
                "g_Albedo",
                ShaderResourceType::TextureSrv,
                ShaderResourceVariableType::Mutable,
            ),
            PipelineResourceDesc::new(
                PS,
                "g_Albedo_sampler",
                ShaderResourceType::Sampler,
                ShaderResourceVariableType::Mutable,
            ),
            PipelineResourceDesc::new(
                PS,
                "g_Linear",
                ShaderResourceType::Sampler,
                ShaderResourceVariableType::Mutable,
            ),
        ];
        let samplers = [ImmutableSamplerDesc {
            shader_stages: PS,
            sampler_or_texture_name: "g_Linear",
            ..Default::default()
        }];
        let layout = SignatureLayout::new(&PipelineResourceSignatureDesc {
            resources: &resources,
            immutable_samplers: &samplers,
            use_combined_texture_samplers: true,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(layout.resources()[0].sampler_index, 1);
        assert_eq!(layout.resources()[1].sampler_index, INVALID_INDEX);
        assert!(!layout.resources()[1].has_immutable_sampler());
        assert_eq!(layout.resources()[2].immutable_sampler_index, 0);

        // The sampler with an immutable sampler has no variable.
        assert_eq!(layout.srb_variable_counts(), [2]);
    }

    #[test]
    fn invalid_descriptions() {
        let check = |resources: &[PipelineResourceDesc<'_>], expected: SignatureError| {
            let result = SignatureLayout::new(&PipelineResourceSignatureDesc {
                resources,
                ..Default::default()
            });
            assert_eq!(result, Err(expected));
        };

        check(
            &[PipelineResourceDesc::new(
                ShaderStages::empty(),
                "a",
                ShaderResourceType::ConstantBuffer,
                ShaderResourceVariableType::Static,
            )],
            SignatureError::EmptyShaderStages {
                resource: "a".into(),
            },
        );
        check(
            &[
                PipelineResourceDesc::new(
                    VS | PS,
                    "a",
                    ShaderResourceType::ConstantBuffer,
                    ShaderResourceVariableType::Static,
                ),
                PipelineResourceDesc::new(
                    PS,
                    "a",
                    ShaderResourceType::TextureSrv,
                    ShaderResourceVariableType::Mutable,
                ),
            ],
            SignatureError::DuplicateResource {
                resource: "a".into(),
            },
        );
        check(
            &[
                PipelineResourceDesc::new(
                    VS,
                    "a",
                    ShaderResourceType::ConstantBuffer,
                    ShaderResourceVariableType::Static,
                ),
                PipelineResourceDesc::new(
                    ShaderStages::COMPUTE,
                    "b",
                    ShaderResourceType::ConstantBuffer,
                    ShaderResourceVariableType::Static,
                ),
            ],
            SignatureError::IncompatibleStages {
                shader_stages: VS | ShaderStages::COMPUTE,
            },
        );
        check(
            &[PipelineResourceDesc {
                flags: PipelineResourceFlags::FORMATTED_BUFFER,
                ..PipelineResourceDesc::new(
                    VS,
                    "a",
                    ShaderResourceType::ConstantBuffer,
                    ShaderResourceVariableType::Static,
                )
            }],
            SignatureError::InvalidResourceFlags {
                resource: "a".into(),
                flags: PipelineResourceFlags::FORMATTED_BUFFER,
            },
        );

        // The same name in disjoint stages is allowed.
        let resources = [
            PipelineResourceDesc::new(
                VS,
                "a",
                ShaderResourceType::ConstantBuffer,
                ShaderResourceVariableType::Static,
            ),
            PipelineResourceDesc::new(
                PS,
                "a",
                ShaderResourceType::ConstantBuffer,
                ShaderResourceVariableType::Static,
            ),
        ];
        assert!(SignatureLayout::new(&PipelineResourceSignatureDesc {
            resources: &resources,
            ..Default::default()
        })
        .is_ok());

        assert_eq!(
            SignatureLayout::new(&PipelineResourceSignatureDesc {
                binding_index: MAX_RESOURCE_SIGNATURES,
                ..Default::default()
            }),
            Err(SignatureError::BindingIndexOutOfRange {
                binding_index: MAX_RESOURCE_SIGNATURES,
            }),
        );
    }

    #[test]
    fn empty_signature() {
        let layout = SignatureLayout::new(&PipelineResourceSignatureDesc::default()).unwrap();

        assert_eq!(layout.pipeline_type(), PipelineType::Unknown);
        assert!(layout.active_stages().is_empty());
        assert_eq!(layout.srb_cache_sizes(), [0; 3]);
    }
}
