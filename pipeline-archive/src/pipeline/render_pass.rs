// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Render passes, as stored in archives.
//!
//! A render pass lists the attachments that a graphics pipeline renders to, the subpasses that
//! use them and the dependencies between the subpasses. Resource states are opaque `u32` values
//! of the backend.

use crate::{
    archive::{
        serializer::{Serialize, Serializer},
        DecodeError,
    },
    device::{Device, DeviceOwned},
    macros::{archive_enum, impl_id_counter},
    memory::FixedLinearAllocator,
    NonExhaustive,
};
use bytemuck::{Pod, Zeroable};
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

/// An attachment reference that doesn't refer to any attachment.
pub const ATTACHMENT_UNUSED: u32 = u32::MAX;

/// A subpass index that refers to the commands outside of the render pass.
pub const SUBPASS_EXTERNAL: u32 = u32::MAX;

archive_enum! {
    /// The format of an attachment.
    TextureFormat
    impl {
        /// Returns whether the format has a depth or stencil component.
        #[inline]
        pub const fn is_depth_stencil(self) -> bool {
            matches!(
                self,
                TextureFormat::D16Unorm
                    | TextureFormat::D24UnormS8Uint
                    | TextureFormat::D32Float
                    | TextureFormat::D32FloatS8X24Uint
            )
        }
    }
    = u8;

    Unknown = 0,
    Rgba8Unorm = 1,
    Rgba8UnormSrgb = 2,
    Bgra8Unorm = 3,
    Bgra8UnormSrgb = 4,
    Rgba16Float = 5,
    Rgba32Float = 6,
    R32Float = 7,
    D16Unorm = 8,
    D24UnormS8Uint = 9,
    D32Float = 10,
    D32FloatS8X24Uint = 11,
}

archive_enum! {
    /// What happens to an attachment at the start of the first subpass that uses it.
    AttachmentLoadOp = u8;

    Load = 0,
    Clear = 1,
    Discard = 2,
}

archive_enum! {
    /// What happens to an attachment at the end of the last subpass that uses it.
    AttachmentStoreOp = u8;

    Store = 0,
    Discard = 1,
}

/// Describes an attachment of a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderPassAttachmentDesc {
    pub format: TextureFormat,
    pub sample_count: u8,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub stencil_load_op: AttachmentLoadOp,
    pub stencil_store_op: AttachmentStoreOp,
    pub initial_state: u32,
    pub final_state: u32,
}

impl Default for RenderPassAttachmentDesc {
    #[inline]
    fn default() -> Self {
        RenderPassAttachmentDesc {
            format: TextureFormat::Unknown,
            sample_count: 1,
            load_op: AttachmentLoadOp::Load,
            store_op: AttachmentStoreOp::Store,
            stencil_load_op: AttachmentLoadOp::Load,
            stencil_store_op: AttachmentStoreOp::Store,
            initial_state: 0,
            final_state: 0,
        }
    }
}

impl<'a> Serialize<'a> for RenderPassAttachmentDesc {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_enum(&mut self.format)?;
        ser.serialize_u8(&mut self.sample_count)?;
        ser.serialize_enum(&mut self.load_op)?;
        ser.serialize_enum(&mut self.store_op)?;
        ser.serialize_enum(&mut self.stencil_load_op)?;
        ser.serialize_enum(&mut self.stencil_store_op)?;
        ser.serialize_u32(&mut self.initial_state)?;
        ser.serialize_u32(&mut self.final_state)
    }
}

/// A reference from a subpass to an attachment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AttachmentReference {
    /// Index into [`RenderPassDesc::attachments`], or [`ATTACHMENT_UNUSED`].
    pub attachment_index: u32,
    /// The state of the attachment during the subpass.
    pub state: u32,
}

impl<'a> Serialize<'a> for AttachmentReference {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_u32(&mut self.attachment_index)?;
        ser.serialize_u32(&mut self.state)
    }
}

/// Describes a subpass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubpassDesc<'a> {
    pub input_attachments: &'a [AttachmentReference],
    pub render_target_attachments: &'a [AttachmentReference],
    /// Either empty, or one entry per render target.
    pub resolve_attachments: &'a [AttachmentReference],
    pub depth_stencil_attachment: Option<AttachmentReference>,
    /// Attachments that are not used by the subpass but whose contents must be kept.
    pub preserve_attachments: &'a [u32],
}

impl<'a> Serialize<'a> for SubpassDesc<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_pod_array(&mut self.input_attachments, allocator)?;
        ser.serialize_pod_array(&mut self.render_target_attachments, allocator)?;
        ser.serialize_pod_array(&mut self.resolve_attachments, allocator)?;
        ser.serialize_option(&mut self.depth_stencil_attachment, allocator)?;
        ser.serialize_pod_array(&mut self.preserve_attachments, allocator)
    }
}

/// An execution and memory dependency between two subpasses.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubpassDependencyDesc {
    /// The subpass that is waited on, or [`SUBPASS_EXTERNAL`].
    pub src_subpass: u32,
    /// The subpass that waits, or [`SUBPASS_EXTERNAL`].
    pub dst_subpass: u32,
    pub src_stage_mask: u32,
    pub dst_stage_mask: u32,
    pub src_access_mask: u32,
    pub dst_access_mask: u32,
}

/// Parameters to create a new [`RenderPass`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderPassDesc<'a> {
    /// The name of the render pass. This is the name it is archived under.
    ///
    /// The default value is empty.
    pub name: &'a str,

    /// The default value is empty.
    pub attachments: &'a [RenderPassAttachmentDesc],

    /// Must not be empty.
    ///
    /// The default value is empty.
    pub subpasses: &'a [SubpassDesc<'a>],

    /// The default value is empty.
    pub dependencies: &'a [SubpassDependencyDesc],

    pub _ne: NonExhaustive,
}

impl Default for RenderPassDesc<'_> {
    #[inline]
    fn default() -> Self {
        RenderPassDesc {
            name: "",
            attachments: &[],
            subpasses: &[],
            dependencies: &[],
            _ne: NonExhaustive(()),
        }
    }
}

impl<'a> Serialize<'a> for RenderPassDesc<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_str(&mut self.name, allocator)?;
        ser.serialize_array(&mut self.attachments, allocator)?;
        ser.serialize_array(&mut self.subpasses, allocator)?;
        ser.serialize_pod_array(&mut self.dependencies, allocator)
    }
}

impl RenderPassDesc<'_> {
    pub(crate) fn validate(&self) -> Result<(), RenderPassError> {
        if self.subpasses.is_empty() {
            return Err(RenderPassError::NoSubpasses);
        }

        let attachment_count = self.attachments.len() as u32;
        let check_attachment = |subpass: usize, attachment_index: u32| {
            if attachment_index != ATTACHMENT_UNUSED && attachment_index >= attachment_count {
                Err(RenderPassError::AttachmentIndexOutOfRange {
                    subpass,
                    attachment_index,
                })
            } else {
                Ok(())
            }
        };

        for (index, subpass) in self.subpasses.iter().enumerate() {
            for reference in subpass
                .input_attachments
                .iter()
                .chain(subpass.render_target_attachments)
                .chain(subpass.resolve_attachments)
                .chain(&subpass.depth_stencil_attachment)
            {
                check_attachment(index, reference.attachment_index)?;
            }

            for &attachment_index in subpass.preserve_attachments {
                check_attachment(index, attachment_index)?;
            }

            if !subpass.resolve_attachments.is_empty()
                && subpass.resolve_attachments.len() != subpass.render_target_attachments.len()
            {
                return Err(RenderPassError::ResolveAttachmentCountMismatch { subpass: index });
            }
        }

        let subpass_count = self.subpasses.len() as u32;

        for (index, dependency) in self.dependencies.iter().enumerate() {
            let valid = |subpass: u32| subpass == SUBPASS_EXTERNAL || subpass < subpass_count;

            if !valid(dependency.src_subpass) || !valid(dependency.dst_subpass) {
                return Err(RenderPassError::DependencySubpassOutOfRange { dependency: index });
            }
        }

        Ok(())
    }
}

/// A subpass of a [`RenderPass`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subpass {
    pub input_attachments: Vec<AttachmentReference>,
    pub render_target_attachments: Vec<AttachmentReference>,
    pub resolve_attachments: Vec<AttachmentReference>,
    pub depth_stencil_attachment: Option<AttachmentReference>,
    pub preserve_attachments: Vec<u32>,
}

/// A render pass created for a device.
pub struct RenderPass {
    id: NonZero<u64>,
    device: Arc<Device>,
    name: Box<str>,
    attachments: Vec<RenderPassAttachmentDesc>,
    subpasses: Vec<Subpass>,
    dependencies: Vec<SubpassDependencyDesc>,
}

impl RenderPass {
    /// Creates a new `RenderPass`.
    pub fn new(
        device: Arc<Device>,
        desc: &RenderPassDesc<'_>,
    ) -> Result<Arc<Self>, RenderPassError> {
        desc.validate()?;

        let subpasses = desc
            .subpasses
            .iter()
            .map(|subpass| Subpass {
                input_attachments: subpass.input_attachments.to_vec(),
                render_target_attachments: subpass.render_target_attachments.to_vec(),
                resolve_attachments: subpass.resolve_attachments.to_vec(),
                depth_stencil_attachment: subpass.depth_stencil_attachment,
                preserve_attachments: subpass.preserve_attachments.to_vec(),
            })
            .collect();

        Ok(Arc::new(RenderPass {
            id: Self::next_id(),
            device,
            name: desc.name.into(),
            attachments: desc.attachments.to_vec(),
            subpasses,
            dependencies: desc.dependencies.to_vec(),
        }))
    }

    /// Returns the name of the render pass.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn attachments(&self) -> &[RenderPassAttachmentDesc] {
        &self.attachments
    }

    #[inline]
    pub fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }

    #[inline]
    pub fn dependencies(&self) -> &[SubpassDependencyDesc] {
        &self.dependencies
    }
}

impl_id_counter!(RenderPass);

impl DeviceOwned for RenderPass {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Debug for RenderPass {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("RenderPass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("attachments", &self.attachments)
            .field("subpasses", &self.subpasses)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Error that can happen when creating a render pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderPassError {
    /// The render pass has no subpasses.
    NoSubpasses,

    /// A subpass refers to an attachment that doesn't exist.
    AttachmentIndexOutOfRange { subpass: usize, attachment_index: u32 },

    /// A subpass has resolve attachments, but not one per render target.
    ResolveAttachmentCountMismatch { subpass: usize },

    /// A dependency refers to a subpass that doesn't exist.
    DependencySubpassOutOfRange { dependency: usize },
}

impl Error for RenderPassError {}

impl Display for RenderPassError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NoSubpasses => write!(f, "the render pass has no subpasses"),
            Self::AttachmentIndexOutOfRange {
                subpass,
                attachment_index,
            } => write!(
                f,
                "subpass {} refers to attachment {}, which doesn't exist",
                subpass, attachment_index,
            ),
            Self::ResolveAttachmentCountMismatch { subpass } => write!(
                f,
                "subpass {} has resolve attachments, but not one for every render target",
                subpass,
            ),
            Self::DependencySubpassOutOfRange { dependency } => write!(
                f,
                "dependency {} refers to a subpass that doesn't exist",
                dependency,
            ),
        }
    }
}
