// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    serializer::{deserialize, deserialize_prefix},
    Archive, ArchiveError, ChunkType, DecodeError, RenderPassChunk, SignatureChunkHeader,
    SignatureCommonData,
};
use crate::{
    backend::{Backend, SerializedSignatureData, SignatureData},
    cache::OnceCache,
    device::{Device, DeviceOwned},
    memory::FixedLinearAllocator,
    pipeline::{PipelineResourceSignature, RenderPass, SignatureLayout},
    NonExhaustive,
};
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    sync::Arc,
};

/// Parameters to unpack a resource signature.
#[derive(Clone, Debug)]
pub struct ResourceSignatureUnpackInfo<'a> {
    /// The name of the signature chunk.
    ///
    /// The default value is empty.
    pub name: &'a str,

    /// Overrides the number of shader resource bindings whose memory is allocated at once.
    /// `0` keeps the value the signature was archived with.
    ///
    /// The default value is `0`.
    pub srb_allocation_granularity: u32,

    pub _ne: NonExhaustive,
}

impl Default for ResourceSignatureUnpackInfo<'_> {
    #[inline]
    fn default() -> Self {
        ResourceSignatureUnpackInfo {
            name: "",
            srb_allocation_granularity: 0,
            _ne: NonExhaustive(()),
        }
    }
}

impl<'a> ResourceSignatureUnpackInfo<'a> {
    /// Returns a `ResourceSignatureUnpackInfo` with the specified `name`.
    #[inline]
    pub fn new(name: &'a str) -> Self {
        ResourceSignatureUnpackInfo {
            name,
            ..Default::default()
        }
    }
}

/// Unpacks the objects of an [`Archive`] for a device of backend `B`.
///
/// Every object is decoded at most once per name, also when it is requested from several threads
/// at the same time. Later requests return the same object. If several requests for a name race,
/// the unpack info of the one that decodes the object applies.
pub struct DeviceObjectArchive<B: Backend> {
    archive: Arc<Archive>,
    device: Arc<Device>,
    signatures: OnceCache<Box<str>, Arc<PipelineResourceSignature<B>>>,
    render_passes: OnceCache<Box<str>, Arc<RenderPass>>,
}

impl<B: Backend> DeviceObjectArchive<B> {
    /// Creates a new `DeviceObjectArchive`.
    ///
    /// The device must be of the type of backend `B`.
    pub fn new(archive: Arc<Archive>, device: Arc<Device>) -> Result<Self, ArchiveError> {
        if device.device_type() != B::DEVICE_TYPE {
            return Err(ArchiveError::IncompatibleDevice {
                expected: B::DEVICE_TYPE,
                found: device.device_type(),
            });
        }

        Ok(DeviceObjectArchive {
            archive,
            device,
            signatures: OnceCache::new(),
            render_passes: OnceCache::new(),
        })
    }

    /// Returns the archive that objects are unpacked from.
    #[inline]
    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    /// Unpacks the resource signature named `unpack_info.name`.
    pub fn unpack_resource_signature(
        &self,
        unpack_info: &ResourceSignatureUnpackInfo<'_>,
    ) -> Result<Arc<PipelineResourceSignature<B>>, ArchiveError> {
        let name = unpack_info.name;

        if let Some(signature) = self.signatures.get(name) {
            log::trace!("resource signature `{}` is already unpacked", name);
            return Ok(signature);
        }

        self.signatures
            .get_or_try_insert(name, || {
                let signature = self.decode_resource_signature(unpack_info)?;

                log::debug!(
                    "unpacked resource signature `{}` with {} resources",
                    name,
                    signature.resources().len(),
                );

                Ok((name.into(), signature))
            })
            .inspect_err(|err| {
                log::error!("failed to unpack resource signature `{}`: {}", name, err);
            })
    }

    /// Unpacks the render pass named `name`.
    pub fn unpack_render_pass(&self, name: &str) -> Result<Arc<RenderPass>, ArchiveError> {
        if let Some(render_pass) = self.render_passes.get(name) {
            log::trace!("render pass `{}` is already unpacked", name);
            return Ok(render_pass);
        }

        self.render_passes
            .get_or_try_insert(name, || {
                let render_pass = self.decode_render_pass(name)?;
                log::debug!("unpacked render pass `{}`", name);

                Ok((name.into(), render_pass))
            })
            .inspect_err(|err| {
                log::error!("failed to unpack render pass `{}`: {}", name, err);
            })
    }

    fn decode_resource_signature(
        &self,
        unpack_info: &ResourceSignatureUnpackInfo<'_>,
    ) -> Result<Arc<PipelineResourceSignature<B>>, ArchiveError> {
        let name = unpack_info.name;
        let chunk = self.archive.chunk(ChunkType::ResourceSignature, name)?;
        let raw_allocator = self.device.raw_allocator();

        let arena = FixedLinearAllocator::new(raw_allocator.clone());
        let (header, header_size): (SignatureChunkHeader, _) = deserialize_prefix(chunk, &arena)?;
        check_chunk_type(name, ChunkType::ResourceSignature, header.chunk_type)?;

        let common_bytes = section(chunk, header_size, header.common_size as usize)?;
        let mut end = header_size + common_bytes.len();
        let mut device_ranges = header.device_data;
        device_ranges.sort_unstable_by_key(|range| range.offset);

        // Sections must not overlap the common section or each other.
        for range in device_ranges.iter().filter(|range| range.size != 0) {
            if (range.offset as usize) < end {
                return Err(DecodeError::InconsistentData {
                    what: "a device section overlaps another section",
                }
                .into());
            }

            let device_bytes = section(chunk, range.offset as usize, range.size as usize)?;
            end = range.offset as usize + device_bytes.len();
        }

        if end != chunk.len() {
            return Err(DecodeError::SizeMismatch {
                expected: chunk.len(),
                consumed: end,
            }
            .into());
        }

        let arena = FixedLinearAllocator::new(raw_allocator.clone());
        let common: SignatureCommonData<'_> = deserialize(common_bytes, &arena)?;
        let desc = common.desc;

        if desc.name != name {
            return Err(DecodeError::InconsistentData {
                what: "the name of a signature differs from the name of its chunk",
            }
            .into());
        }

        let layout = SignatureLayout::new(&desc)?;

        if layout.internal_data() != common.internal_data {
            return Err(DecodeError::InconsistentData {
                what: "the archived layout of a signature differs from its description",
            }
            .into());
        }

        let range = header.device_data[B::DEVICE_TYPE as usize];

        if range.size == 0 {
            return Err(DecodeError::MissingDeviceData {
                name: name.to_owned(),
                device_type: B::DEVICE_TYPE,
            }
            .into());
        }

        let device_bytes = section(chunk, range.offset as usize, range.size as usize)?;
        let arena = FixedLinearAllocator::new(raw_allocator.clone());
        let serialized: SerializedSignatureData<'_, B> = deserialize(device_bytes, &arena)?;
        B::validate_signature_data(&desc, &layout, &serialized)?;

        let srb_allocation_granularity = match unpack_info.srb_allocation_granularity {
            0 => desc.srb_allocation_granularity,
            granularity => granularity,
        };

        let signature = PipelineResourceSignature::from_parts(
            self.device.clone(),
            &desc,
            layout,
            SignatureData::from_serialized(&serialized),
            srb_allocation_granularity,
        )?;

        Ok(signature)
    }

    fn decode_render_pass(&self, name: &str) -> Result<Arc<RenderPass>, ArchiveError> {
        let chunk = self.archive.chunk(ChunkType::RenderPass, name)?;

        let arena = FixedLinearAllocator::new(self.device.raw_allocator().clone());
        let archived: RenderPassChunk<'_> = deserialize(chunk, &arena)?;
        check_chunk_type(name, ChunkType::RenderPass, archived.chunk_type)?;

        if archived.desc.name != name {
            return Err(DecodeError::InconsistentData {
                what: "the name of a render pass differs from the name of its chunk",
            }
            .into());
        }

        Ok(RenderPass::new(self.device.clone(), &archived.desc)?)
    }
}

/// Returns `size` bytes of `chunk`, starting at `offset`.
fn section(chunk: &[u8], offset: usize, size: usize) -> Result<&[u8], DecodeError> {
    offset
        .checked_add(size)
        .and_then(|end| chunk.get(offset..end))
        .ok_or(DecodeError::UnexpectedEnd {
            needed: size,
            remaining: chunk.len().saturating_sub(offset),
        })
}

// The type tag that a payload starts with must agree with the table.
fn check_chunk_type(
    name: &str,
    expected: ChunkType,
    found: ChunkType,
) -> Result<(), DecodeError> {
    if found != expected {
        return Err(DecodeError::ChunkTypeMismatch {
            name: name.to_owned(),
            expected,
            found,
        });
    }

    Ok(())
}

impl<B: Backend> DeviceOwned for DeviceObjectArchive<B> {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl<B: Backend> Debug for DeviceObjectArchive<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("DeviceObjectArchive")
            .field("archive", &self.archive)
            .field("device", &self.device)
            .field("unpacked_signatures", &self.signatures.len())
            .field("unpacked_render_passes", &self.render_passes.len())
            .finish()
    }
}
