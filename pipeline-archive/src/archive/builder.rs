// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    serializer::{measure, serialize_to_vec},
    ChunkHeader, ChunkTable, ChunkType, DeviceDataRange, RenderPassChunk, SerializedDebugInfo,
    SignatureChunkHeader, SignatureCommonData, ARCHIVE_MAGIC, ARCHIVE_VERSION, HEADER_SIZE,
};
use crate::{
    backend::{Backend, Direct3D12, Vulkan},
    device::DeviceType,
    pipeline::{
        PipelineResourceSignatureDesc, RenderPassDesc, RenderPassError, SignatureError,
        SignatureLayout,
    },
};

/// The name of the debug info chunk.
const DEBUG_INFO_CHUNK_NAME: &str = "ArchiveDebugInfo";

/// Writes an archive.
///
/// Chunks are written in the order they were added, after the debug info chunk if there is one.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    chunks: Vec<PendingChunk>,
    debug_info: Option<(u32, String)>,
}

#[derive(Debug)]
struct PendingChunk {
    chunk_type: ChunkType,
    name: String,
    payload: Vec<u8>,
}

impl ArchiveBuilder {
    /// Creates an empty `ArchiveBuilder`.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of chunks added so far, not counting the debug info.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Adds a chunk with an already encoded payload.
    ///
    /// Names are not checked for uniqueness here. An archive with two chunks of the same type and
    /// name is rejected when it is parsed.
    pub fn add_chunk(&mut self, chunk_type: ChunkType, name: &str, payload: Vec<u8>) -> &mut Self {
        self.chunks.push(PendingChunk {
            chunk_type,
            name: name.to_owned(),
            payload,
        });

        self
    }

    /// Adds a resource signature, with a section for each of `device_types`.
    pub fn add_resource_signature(
        &mut self,
        desc: &PipelineResourceSignatureDesc<'_>,
        device_types: &[DeviceType],
    ) -> Result<&mut Self, SignatureError> {
        let layout = SignatureLayout::new(desc)?;
        let common = serialize_to_vec(&SignatureCommonData {
            desc: *desc,
            internal_data: layout.internal_data(),
        });

        let mut header = SignatureChunkHeader {
            chunk_type: ChunkType::ResourceSignature,
            common_size: to_u32(common.len()),
            ..Default::default()
        };
        let header_size = measure(&header);

        let mut payload = vec![0; header_size];
        payload.extend_from_slice(&common);

        for device_type in DeviceType::ALL {
            if !device_types.contains(&device_type) {
                continue;
            }

            let section = match device_type {
                DeviceType::Vulkan => device_section::<Vulkan>(desc, &layout)?,
                DeviceType::Direct3D12 => device_section::<Direct3D12>(desc, &layout)?,
            };

            header.device_data[device_type as usize] = DeviceDataRange {
                offset: to_u32(payload.len()),
                size: to_u32(section.len()),
            };
            payload.extend_from_slice(&section);
        }

        payload[..header_size].copy_from_slice(&serialize_to_vec(&header));

        Ok(self.add_chunk(ChunkType::ResourceSignature, desc.name, payload))
    }

    /// Adds a render pass.
    pub fn add_render_pass(
        &mut self,
        desc: &RenderPassDesc<'_>,
    ) -> Result<&mut Self, RenderPassError> {
        desc.validate()?;

        let payload = serialize_to_vec(&RenderPassChunk {
            chunk_type: ChunkType::RenderPass,
            desc: *desc,
        });

        Ok(self.add_chunk(ChunkType::RenderPass, desc.name, payload))
    }

    /// Records the version of the writer. Replaces any previous debug info.
    pub fn set_debug_info(&mut self, api_version: u32, git_hash: &str) -> &mut Self {
        self.debug_info = Some((api_version, git_hash.to_owned()));

        self
    }

    /// Writes the archive.
    ///
    /// # Panics
    ///
    /// - Panics if the archive would be larger than 4 GiB.
    pub fn build(&self) -> Vec<u8> {
        let debug_info = self.debug_info.as_ref().map(|(api_version, git_hash)| {
            serialize_to_vec(&SerializedDebugInfo {
                api_version: *api_version,
                git_hash,
            })
        });

        let payloads: Vec<(ChunkType, &str, &[u8])> = debug_info
            .as_deref()
            .map(|payload| (ChunkType::ArchiveDebugInfo, DEBUG_INFO_CHUNK_NAME, payload))
            .into_iter()
            .chain(self.chunks.iter().map(|chunk| {
                (chunk.chunk_type, chunk.name.as_str(), chunk.payload.as_slice())
            }))
            .collect();

        let mut headers: Vec<ChunkHeader<'_>> = payloads
            .iter()
            .map(|&(chunk_type, name, _)| ChunkHeader {
                chunk_type,
                name,
                offset: 0,
                size: 0,
            })
            .collect();

        // Offsets have a fixed size, so the table can be measured before they are known.
        let table_size = measure(&ChunkTable { chunks: &headers });
        let mut offset = HEADER_SIZE + table_size;

        for (header, &(_, _, payload)) in headers.iter_mut().zip(&payloads) {
            header.offset = to_u32(offset);
            header.size = to_u32(payload.len());
            offset += payload.len();
        }

        let total_size = to_u32(offset) as usize;

        let mut data = Vec::with_capacity(total_size);
        data.extend_from_slice(&ARCHIVE_MAGIC.to_le_bytes());
        data.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&serialize_to_vec(&ChunkTable { chunks: &headers }));

        for &(_, _, payload) in &payloads {
            data.extend_from_slice(payload);
        }

        debug_assert_eq!(data.len(), total_size);

        log::debug!(
            "built an archive of {} bytes with {} chunks",
            data.len(),
            headers.len(),
        );

        data
    }
}

fn device_section<B: Backend>(
    desc: &PipelineResourceSignatureDesc<'_>,
    layout: &SignatureLayout,
) -> Result<Vec<u8>, SignatureError> {
    let data = B::build_signature_data(desc, layout)?;

    Ok(serialize_to_vec(&data.as_serialized()))
}

fn to_u32(len: usize) -> u32 {
    match u32::try_from(len) {
        Ok(len) => len,
        Err(_) => panic!("archives are limited to 4 GiB"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::{
            serializer::{deserialize, deserialize_prefix},
            Archive,
        },
        backend::tests::sample_resources,
        memory::{DefaultRawAllocator, FixedLinearAllocator},
    };
    use std::sync::Arc;

    #[test]
    fn chunks_follow_the_table() {
        let mut builder = ArchiveBuilder::new();
        builder
            .add_chunk(ChunkType::Shaders, "a", vec![1; 3])
            .add_chunk(ChunkType::Shaders, "b", vec![2; 5])
            .set_debug_info(7, "abc");
        assert_eq!(builder.chunk_count(), 2);

        let data = builder.build();
        assert_eq!(&data[..4], b"DGPA");
        assert_eq!(data[8..12], [0; 4]);

        let archive = Archive::new(data).unwrap();
        let chunks = archive.chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk_type, ChunkType::ArchiveDebugInfo);
        assert_eq!(&*chunks[1].name, "a");
        assert_eq!(chunks[2].size(), 5);
        assert_eq!(
            chunks[1].range.end, chunks[2].range.start,
            "payloads are written back to back",
        );
        assert_eq!(chunks[2].range.end, archive.data().len());
    }

    #[test]
    fn resource_signature_sections() {
        let resources = sample_resources();
        let desc = PipelineResourceSignatureDesc {
            name: "Sample",
            resources: &resources,
            ..Default::default()
        };

        let mut builder = ArchiveBuilder::new();
        builder
            .add_resource_signature(&desc, &[DeviceType::Direct3D12])
            .unwrap();
        let archive = Archive::new(builder.build()).unwrap();
        let chunk = archive.chunk(ChunkType::ResourceSignature, "Sample").unwrap();

        let arena = FixedLinearAllocator::new(Arc::new(DefaultRawAllocator));
        let header_size = measure(&SignatureChunkHeader::default());
        let (header, consumed): (SignatureChunkHeader, _) =
            deserialize_prefix(chunk, &arena).unwrap();
        assert_eq!(consumed, header_size);
        assert_eq!(header.chunk_type, ChunkType::ResourceSignature);
        assert_eq!(header.device_data[DeviceType::Vulkan as usize].size, 0);

        let d3d12 = header.device_data[DeviceType::Direct3D12 as usize];
        assert_eq!(d3d12.offset as usize, header_size + header.common_size as usize);
        assert_eq!((d3d12.offset + d3d12.size) as usize, chunk.len());

        let arena = FixedLinearAllocator::new(Arc::new(DefaultRawAllocator));
        let common_bytes = &chunk[header_size..d3d12.offset as usize];
        let common: SignatureCommonData<'_> = deserialize(common_bytes, &arena).unwrap();
        assert_eq!(common.desc, desc);
    }

    #[test]
    fn invalid_objects_are_rejected() {
        let mut builder = ArchiveBuilder::new();

        assert_eq!(
            builder
                .add_resource_signature(
                    &PipelineResourceSignatureDesc {
                        binding_index: 200,
                        ..Default::default()
                    },
                    &DeviceType::ALL,
                )
                .unwrap_err(),
            SignatureError::BindingIndexOutOfRange { binding_index: 200 },
        );
        assert_eq!(
            builder
                .add_render_pass(&RenderPassDesc::default())
                .unwrap_err(),
            RenderPassError::NoSubpasses,
        );
        assert_eq!(builder.chunk_count(), 0);
    }
}
