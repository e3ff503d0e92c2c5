// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Descriptions of the resources that pipelines bind, and the objects created from them.
//!
//! A [`PipelineResourceSignature`] is created from a [`PipelineResourceSignatureDesc`], which
//! lists every resource that shaders of a pipeline can access: its name, the stages that see it,
//! its type and how often it is expected to change (its [`ShaderResourceVariableType`]).
//! Signatures are either created directly, or unpacked from an archive through
//! [`DeviceObjectArchive`].
//!
//! [`DeviceObjectArchive`]: crate::archive::DeviceObjectArchive

pub use self::{
    layout::{PipelineResourceSignatureInternalData, SignatureError, SignatureLayout},
    render_pass::{
        AttachmentLoadOp, AttachmentReference, AttachmentStoreOp, RenderPass,
        RenderPassAttachmentDesc, RenderPassDesc, RenderPassError, Subpass,
        SubpassDependencyDesc, SubpassDesc, TextureFormat,
    },
    signature::{
        ImmutableSampler, PipelineResource, PipelineResourceSignature, SrbMemoryAllocator,
    },
};
use crate::{
    archive::{
        serializer::{Serialize, Serializer},
        DecodeError,
    },
    device::DeviceObjectKind,
    macros::{archive_enum, archive_flags},
    memory::FixedLinearAllocator,
    NonExhaustive,
};

pub mod layout;
pub mod render_pass;
pub mod signature;

/// The maximum number of shader stages in a single pipeline.
pub const MAX_SHADERS_IN_PIPELINE: usize = 5;

/// The maximum number of resource signatures that a pipeline can use.
pub const MAX_RESOURCE_SIGNATURES: u8 = 8;

archive_flags! {
    /// A set of shader stages.
    ShaderStages
    impl {
        /// All stages of a graphics pipeline.
        pub const ALL_GRAPHICS: ShaderStages = ShaderStages(0x1f);

        /// All stages of a mesh pipeline.
        pub const ALL_MESH: ShaderStages = ShaderStages(0xc2);

        /// Returns the individual stages of `self`, in ascending bit order.
        #[inline]
        pub fn iter(self) -> impl Iterator<Item = ShaderStages> {
            let raw = self.0;

            (0..u32::BITS)
                .map(|bit| 1u32 << bit)
                .filter(move |&bit| raw & bit != 0)
                .map(ShaderStages)
        }

        /// Returns the type of pipeline that can contain all of the stages of `self`.
        ///
        /// Returns `Some(PipelineType::Unknown)` for an empty set and `None` if the stages can't
        /// all be part of the same pipeline.
        pub const fn pipeline_type(self) -> Option<PipelineType> {
            if self.is_empty() {
                Some(PipelineType::Unknown)
            } else if self.0 == ShaderStages::COMPUTE.0 {
                Some(PipelineType::Compute)
            } else if ShaderStages::ALL_MESH.contains(self)
                && self.intersects(ShaderStages(0xc0))
            {
                Some(PipelineType::Mesh)
            } else if ShaderStages::ALL_GRAPHICS.contains(self) {
                Some(PipelineType::Graphics)
            } else {
                None
            }
        }

        /// Returns the position of a single stage within its pipeline.
        ///
        /// Returns `None` if `self` is not exactly one stage.
        pub const fn pipeline_index(self) -> Option<usize> {
            Some(match self {
                ShaderStages::VERTEX | ShaderStages::AMPLIFICATION | ShaderStages::COMPUTE => 0,
                ShaderStages::HULL | ShaderStages::MESH => 1,
                ShaderStages::DOMAIN => 2,
                ShaderStages::GEOMETRY => 3,
                ShaderStages::PIXEL => 4,
                _ => return None,
            })
        }
    }
    = u32;

    VERTEX = 0x01,
    PIXEL = 0x02,
    GEOMETRY = 0x04,
    HULL = 0x08,
    DOMAIN = 0x10,
    COMPUTE = 0x20,
    AMPLIFICATION = 0x40,
    MESH = 0x80,
}

archive_enum! {
    /// The kind of pipeline that a set of shader stages belongs to.
    PipelineType = u8;

    Graphics = 0,
    Compute = 1,
    Mesh = 2,
    /// A signature without any stages, usable with any pipeline.
    Unknown = 255,
}

archive_enum! {
    /// The type of a shader resource.
    ShaderResourceType
    impl {
        /// Returns whether an object of `kind` can be bound to a resource of this type.
        pub const fn accepts(self, kind: DeviceObjectKind) -> bool {
            matches!(
                (self, kind),
                (ShaderResourceType::ConstantBuffer, DeviceObjectKind::Buffer)
                    | (ShaderResourceType::TextureSrv, DeviceObjectKind::TextureView)
                    | (ShaderResourceType::BufferSrv, DeviceObjectKind::BufferView)
                    | (ShaderResourceType::TextureUav, DeviceObjectKind::TextureView)
                    | (ShaderResourceType::BufferUav, DeviceObjectKind::BufferView)
                    | (ShaderResourceType::Sampler, DeviceObjectKind::Sampler)
                    | (ShaderResourceType::InputAttachment, DeviceObjectKind::TextureView)
                    | (ShaderResourceType::AccelStruct, DeviceObjectKind::AccelerationStructure)
            )
        }
    }
    = u8;

    Unknown = 0,
    ConstantBuffer = 1,
    TextureSrv = 2,
    BufferSrv = 3,
    TextureUav = 4,
    BufferUav = 5,
    Sampler = 6,
    InputAttachment = 7,
    AccelStruct = 8,
}

impl Default for ShaderResourceType {
    #[inline]
    fn default() -> Self {
        ShaderResourceType::Unknown
    }
}

archive_enum! {
    /// How often the resource bound to a variable is expected to change.
    ShaderResourceVariableType
    impl {
        /// Every variable type, in cache order.
        pub const ALL: [ShaderResourceVariableType; 3] = [
            ShaderResourceVariableType::Static,
            ShaderResourceVariableType::Mutable,
            ShaderResourceVariableType::Dynamic,
        ];

        /// Returns the index of the variable type in [`ALL`](Self::ALL).
        #[inline]
        pub const fn index(self) -> usize {
            self as usize
        }
    }
    = u8;

    /// Bound once through the signature, and copied into every shader resource binding.
    Static = 0,
    /// Bound once per shader resource binding.
    Mutable = 1,
    /// Can be rebound at any time.
    Dynamic = 2,
}

impl Default for ShaderResourceVariableType {
    #[inline]
    fn default() -> Self {
        ShaderResourceVariableType::Static
    }
}

archive_flags! {
    /// Additional properties of a pipeline resource.
    PipelineResourceFlags = u8;

    /// A dynamic constant or structured buffer is not bound with a dynamic offset.
    NO_DYNAMIC_BUFFERS = 0x01,
    /// A texture is combined with the sampler named after it.
    COMBINED_SAMPLER = 0x02,
    /// A buffer is accessed through a formatted view.
    FORMATTED_BUFFER = 0x04,
    /// The array has no statically known size.
    RUNTIME_ARRAY = 0x08,
    /// An input attachment is used in the general layout.
    GENERAL_INPUT_ATTACHMENT = 0x10,
}

/// Describes a single resource of a signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineResourceDesc<'a> {
    /// The name of the resource in the shaders.
    pub name: &'a str,

    /// The stages that access the resource. Must not be empty.
    pub shader_stages: ShaderStages,

    /// The number of array elements. Must be at least 1.
    pub array_size: u32,

    /// The type of the resource.
    pub resource_type: ShaderResourceType,

    /// How often the bound resource changes.
    pub var_type: ShaderResourceVariableType,

    pub flags: PipelineResourceFlags,
}

impl<'a> PipelineResourceDesc<'a> {
    /// Returns a description of a single, non-array resource.
    #[inline]
    pub const fn new(
        shader_stages: ShaderStages,
        name: &'a str,
        resource_type: ShaderResourceType,
        var_type: ShaderResourceVariableType,
    ) -> Self {
        PipelineResourceDesc {
            name,
            shader_stages,
            array_size: 1,
            resource_type,
            var_type,
            flags: PipelineResourceFlags::empty(),
        }
    }
}

impl Default for PipelineResourceDesc<'_> {
    #[inline]
    fn default() -> Self {
        PipelineResourceDesc::new(
            ShaderStages::empty(),
            "",
            ShaderResourceType::Unknown,
            ShaderResourceVariableType::Static,
        )
    }
}

impl<'a> Serialize<'a> for PipelineResourceDesc<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_str(&mut self.name, allocator)?;
        ser.serialize_flags(&mut self.shader_stages)?;
        ser.serialize_u32(&mut self.array_size)?;
        ser.serialize_enum(&mut self.resource_type)?;
        ser.serialize_enum(&mut self.var_type)?;
        ser.serialize_flags(&mut self.flags)
    }
}

archive_enum! {
    /// Filtering used by a sampler.
    FilterType = u8;

    Point = 0,
    Linear = 1,
    Anisotropic = 2,
    ComparisonPoint = 3,
    ComparisonLinear = 4,
    ComparisonAnisotropic = 5,
}

archive_enum! {
    /// How texture coordinates outside of `[0, 1]` are handled.
    TextureAddressMode = u8;

    Wrap = 0,
    Mirror = 1,
    Clamp = 2,
    Border = 3,
    MirrorOnce = 4,
}

archive_enum! {
    /// Comparison used by comparison samplers.
    ComparisonFunction = u8;

    Never = 0,
    Less = 1,
    Equal = 2,
    LessEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterEqual = 6,
    Always = 7,
}

/// Describes a sampler.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: FilterType,
    pub mag_filter: FilterType,
    pub mip_filter: FilterType,
    pub address_u: TextureAddressMode,
    pub address_v: TextureAddressMode,
    pub address_w: TextureAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison_func: ComparisonFunction,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    #[inline]
    fn default() -> Self {
        SamplerDesc {
            min_filter: FilterType::Linear,
            mag_filter: FilterType::Linear,
            mip_filter: FilterType::Linear,
            address_u: TextureAddressMode::Clamp,
            address_v: TextureAddressMode::Clamp,
            address_w: TextureAddressMode::Clamp,
            mip_lod_bias: 0.0,
            max_anisotropy: 0,
            comparison_func: ComparisonFunction::Never,
            border_color: [0.0; 4],
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

impl<'a> Serialize<'a> for SamplerDesc {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_enum(&mut self.min_filter)?;
        ser.serialize_enum(&mut self.mag_filter)?;
        ser.serialize_enum(&mut self.mip_filter)?;
        ser.serialize_enum(&mut self.address_u)?;
        ser.serialize_enum(&mut self.address_v)?;
        ser.serialize_enum(&mut self.address_w)?;
        ser.serialize_f32(&mut self.mip_lod_bias)?;
        ser.serialize_u32(&mut self.max_anisotropy)?;
        ser.serialize_enum(&mut self.comparison_func)?;

        for component in &mut self.border_color {
            ser.serialize_f32(component)?;
        }

        ser.serialize_f32(&mut self.min_lod)?;
        ser.serialize_f32(&mut self.max_lod)
    }
}

/// A sampler that is baked into the signature instead of being bound at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImmutableSamplerDesc<'a> {
    /// The stages that use the sampler.
    pub shader_stages: ShaderStages,

    /// The name of the sampler, or of the texture when texture samplers are combined.
    pub sampler_or_texture_name: &'a str,

    pub desc: SamplerDesc,
}

impl<'a> Serialize<'a> for ImmutableSamplerDesc<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_flags(&mut self.shader_stages)?;
        ser.serialize_str(&mut self.sampler_or_texture_name, allocator)?;
        self.desc.serialize(ser, allocator)
    }
}

/// Parameters to create a new [`PipelineResourceSignature`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineResourceSignatureDesc<'a> {
    /// The name of the signature. This is the name it is archived under.
    ///
    /// The default value is empty.
    pub name: &'a str,

    /// The resources of the signature. Names must be unique among resources that share a stage.
    ///
    /// The default value is empty.
    pub resources: &'a [PipelineResourceDesc<'a>],

    /// Samplers that are baked into the signature.
    ///
    /// The default value is empty.
    pub immutable_samplers: &'a [ImmutableSamplerDesc<'a>],

    /// The slot of the signature in a pipeline. Must be less than [`MAX_RESOURCE_SIGNATURES`].
    ///
    /// The default value is `0`.
    pub binding_index: u8,

    /// Whether textures are combined with the samplers named after them.
    ///
    /// The default value is `false`.
    pub use_combined_texture_samplers: bool,

    /// The suffix that turns a texture name into the name of its combined sampler.
    ///
    /// The default value is `"_sampler"`.
    pub combined_sampler_suffix: &'a str,

    /// The number of shader resource bindings whose memory is allocated at once.
    ///
    /// The default value is `1`.
    pub srb_allocation_granularity: u32,

    pub _ne: NonExhaustive,
}

impl Default for PipelineResourceSignatureDesc<'_> {
    #[inline]
    fn default() -> Self {
        PipelineResourceSignatureDesc {
            name: "",
            resources: &[],
            immutable_samplers: &[],
            binding_index: 0,
            use_combined_texture_samplers: false,
            combined_sampler_suffix: "_sampler",
            srb_allocation_granularity: 1,
            _ne: NonExhaustive(()),
        }
    }
}

impl<'a> Serialize<'a> for PipelineResourceSignatureDesc<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_str(&mut self.name, allocator)?;
        ser.serialize_array(&mut self.resources, allocator)?;
        ser.serialize_array(&mut self.immutable_samplers, allocator)?;
        ser.serialize_u8(&mut self.binding_index)?;
        ser.serialize_bool(&mut self.use_combined_texture_samplers)?;
        ser.serialize_str(&mut self.combined_sampler_suffix, allocator)?;
        ser.serialize_u32(&mut self.srb_allocation_granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_pipeline_types() {
        assert_eq!(
            (ShaderStages::VERTEX | ShaderStages::PIXEL).pipeline_type(),
            Some(PipelineType::Graphics),
        );
        assert_eq!(
            (ShaderStages::MESH | ShaderStages::PIXEL).pipeline_type(),
            Some(PipelineType::Mesh),
        );
        assert_eq!(ShaderStages::PIXEL.pipeline_type(), Some(PipelineType::Graphics));
        assert_eq!(ShaderStages::COMPUTE.pipeline_type(), Some(PipelineType::Compute));
        assert_eq!(
            ShaderStages::empty().pipeline_type(),
            Some(PipelineType::Unknown),
        );
        assert_eq!((ShaderStages::COMPUTE | ShaderStages::PIXEL).pipeline_type(), None);
        assert_eq!((ShaderStages::VERTEX | ShaderStages::MESH).pipeline_type(), None);
    }

    #[test]
    fn stage_iteration() {
        let stages = ShaderStages::GEOMETRY | ShaderStages::VERTEX | ShaderStages::PIXEL;
        let single: Vec<_> = stages.iter().collect();

        assert_eq!(
            single,
            [ShaderStages::VERTEX, ShaderStages::PIXEL, ShaderStages::GEOMETRY],
        );
        assert_eq!(ShaderStages::PIXEL.pipeline_index(), Some(4));
        assert_eq!(stages.pipeline_index(), None);
        assert_eq!(format!("{:?}", stages), "VERTEX | PIXEL | GEOMETRY");
    }

    #[test]
    fn resource_type_compatibility() {
        assert!(ShaderResourceType::TextureSrv.accepts(DeviceObjectKind::TextureView));
        assert!(!ShaderResourceType::TextureSrv.accepts(DeviceObjectKind::Sampler));
        assert!(ShaderResourceType::ConstantBuffer.accepts(DeviceObjectKind::Buffer));
        assert!(!ShaderResourceType::Unknown.accepts(DeviceObjectKind::Buffer));
    }
}
