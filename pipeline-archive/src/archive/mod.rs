// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Reading and writing pipeline object archives.
//!
//! An archive is an immutable block of bytes that holds named, typed chunks:
//!
//! ```text
//! header:   magic: u32, version: u32, reserved: u32
//! table:    count: u32, then per chunk { type: u8, name: str, offset: u32, size: u32 }
//! payloads: the bytes of every chunk, at the offsets of the table
//! ```
//!
//! Offsets are relative to the start of the archive. Chunk names are unique per chunk type. The
//! payload of a chunk is the output of the [`serializer`] for the structure stored in it.
//!
//! Archives are written with an [`ArchiveBuilder`], parsed with [`Archive::new`] and unpacked
//! into objects for a specific device with a [`DeviceObjectArchive`].

pub use self::{
    builder::ArchiveBuilder,
    dearchiver::{DeviceObjectArchive, ResourceSignatureUnpackInfo},
};
use self::serializer::{deserialize, deserialize_prefix, Serialize, Serializer};
use crate::{
    device::DeviceType,
    macros::archive_enum,
    memory::{AllocationError, DefaultRawAllocator, FixedLinearAllocator},
    pipeline::{
        PipelineResourceSignatureDesc, PipelineResourceSignatureInternalData, RenderPassDesc,
        RenderPassError, SignatureError,
    },
};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    ops::Range,
    sync::Arc,
};

mod builder;
mod dearchiver;
pub mod serializer;

/// The first four bytes of every archive.
pub const ARCHIVE_MAGIC: u32 = u32::from_le_bytes(*b"DGPA");

/// The version of the archive layout and of the chunk schemas.
pub const ARCHIVE_VERSION: u32 = 1;

/// The version of this crate's object model, recorded in the debug info of an archive.
pub const API_VERSION: u32 = 250_014;

const HEADER_SIZE: usize = 12;

archive_enum! {
    /// The kind of object stored in a chunk.
    ChunkType = u8;

    ArchiveDebugInfo = 0,
    ResourceSignature = 1,
    GraphicsPipelineStates = 2,
    ComputePipelineStates = 3,
    RayTracingPipelineStates = 4,
    TilePipelineStates = 5,
    RenderPass = 6,
    Shaders = 7,
}

impl Default for ChunkType {
    #[inline]
    fn default() -> Self {
        ChunkType::ArchiveDebugInfo
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ChunkHeader<'a> {
    pub(crate) chunk_type: ChunkType,
    pub(crate) name: &'a str,
    pub(crate) offset: u32,
    pub(crate) size: u32,
}

impl<'a> Serialize<'a> for ChunkHeader<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_enum(&mut self.chunk_type)?;
        ser.serialize_str(&mut self.name, allocator)?;
        ser.serialize_u32(&mut self.offset)?;
        ser.serialize_u32(&mut self.size)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ChunkTable<'a> {
    pub(crate) chunks: &'a [ChunkHeader<'a>],
}

impl<'a> Serialize<'a> for ChunkTable<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_array(&mut self.chunks, allocator)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SerializedDebugInfo<'a> {
    pub(crate) api_version: u32,
    pub(crate) git_hash: &'a str,
}

impl<'a> Serialize<'a> for SerializedDebugInfo<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_u32(&mut self.api_version)?;
        ser.serialize_str(&mut self.git_hash, allocator)
    }
}

/// Where the section of one device type is stored in a resource signature chunk.
///
/// The offset is relative to the start of the chunk. A size of zero means that the chunk has no
/// section for the device type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DeviceDataRange {
    pub(crate) offset: u32,
    pub(crate) size: u32,
}

/// The start of a resource signature chunk. It is followed by the common section, of
/// `common_size` bytes, and then by the device sections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SignatureChunkHeader {
    pub(crate) chunk_type: ChunkType,
    pub(crate) common_size: u32,
    pub(crate) device_data: [DeviceDataRange; DeviceType::COUNT],
}

impl<'a> Serialize<'a> for SignatureChunkHeader {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        _allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_enum(&mut self.chunk_type)?;
        ser.serialize_u32(&mut self.common_size)?;

        for range in &mut self.device_data {
            ser.serialize_u32(&mut range.offset)?;
            ser.serialize_u32(&mut range.size)?;
        }

        Ok(())
    }
}

/// The part of a resource signature chunk that all device types share.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct SignatureCommonData<'a> {
    pub(crate) desc: PipelineResourceSignatureDesc<'a>,
    pub(crate) internal_data: PipelineResourceSignatureInternalData,
}

impl<'a> Serialize<'a> for SignatureCommonData<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        self.desc.serialize(ser, allocator)?;
        self.internal_data.serialize(ser, allocator)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RenderPassChunk<'a> {
    pub(crate) chunk_type: ChunkType,
    pub(crate) desc: RenderPassDesc<'a>,
}

impl<'a> Serialize<'a> for RenderPassChunk<'a> {
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        ser.serialize_enum(&mut self.chunk_type)?;
        self.desc.serialize(ser, allocator)
    }
}

/// Information about the build that wrote an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugInfo {
    pub api_version: u32,
    pub git_hash: String,
}

/// Describes one chunk of an [`Archive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_type: ChunkType,
    pub name: Box<str>,
    range: Range<usize>,
}

impl ChunkInfo {
    /// Returns the number of bytes in the chunk.
    #[inline]
    pub fn size(&self) -> usize {
        self.range.len()
    }
}

/// A parsed archive.
///
/// The archive is read-only. Lookups don't lock and can happen from any number of threads.
pub struct Archive {
    data: Vec<u8>,
    chunks: Vec<ChunkInfo>,
    // Chunk indices by name. A name is usually used by a single chunk type.
    index: HashMap<Box<str>, SmallVec<[usize; 1]>>,
}

impl Archive {
    /// Parses the header and chunk table of `data`.
    ///
    /// The payloads of the chunks are only decoded when objects are unpacked from them.
    pub fn new(data: Vec<u8>) -> Result<Arc<Archive>, ArchiveError> {
        let mut ser = Serializer::read(&data);
        let mut magic = 0;
        ser.serialize_u32(&mut magic)?;

        if magic != ARCHIVE_MAGIC {
            return Err(DecodeError::BadMagic { found: magic }.into());
        }

        let mut version = 0;
        ser.serialize_u32(&mut version)?;

        if version != ARCHIVE_VERSION {
            return Err(DecodeError::VersionMismatch {
                expected: ARCHIVE_VERSION,
                found: version,
            }
            .into());
        }

        let mut reserved = 0;
        ser.serialize_u32(&mut reserved)?;
        debug_assert_eq!(ser.position(), HEADER_SIZE);

        let arena = FixedLinearAllocator::new(Arc::new(DefaultRawAllocator));
        let (table, table_size): (ChunkTable<'_>, _) =
            deserialize_prefix(&data[HEADER_SIZE..], &arena)?;
        let payload_start = HEADER_SIZE + table_size;

        let mut chunks: Vec<ChunkInfo> = Vec::with_capacity(table.chunks.len());
        let mut index = HashMap::<Box<str>, SmallVec<[usize; 1]>>::default();

        for header in table.chunks {
            let start = header.offset as usize;
            let range = match start.checked_add(header.size as usize) {
                Some(end) if start >= payload_start && end <= data.len() => start..end,
                _ => {
                    return Err(DecodeError::ChunkOutOfBounds {
                        name: header.name.to_owned(),
                        offset: header.offset,
                        size: header.size,
                    }
                    .into());
                }
            };

            let indices = index.entry(header.name.into()).or_default();

            if indices
                .iter()
                .any(|&i| chunks[i].chunk_type == header.chunk_type)
            {
                return Err(DecodeError::DuplicateChunk {
                    chunk_type: header.chunk_type,
                    name: header.name.to_owned(),
                }
                .into());
            }

            indices.push(chunks.len());
            chunks.push(ChunkInfo {
                chunk_type: header.chunk_type,
                name: header.name.into(),
                range,
            });
        }

        drop(arena);

        let archive = Archive {
            data,
            chunks,
            index,
        };

        if let Some(debug_info) = archive.debug_info()? {
            if debug_info.api_version != API_VERSION {
                log::warn!(
                    "the archive was written with API version {} (git hash `{}`), \
                    but this build has API version {}",
                    debug_info.api_version,
                    debug_info.git_hash,
                    API_VERSION,
                );
            }
        }

        log::debug!(
            "parsed an archive of {} bytes with {} chunks",
            archive.data.len(),
            archive.chunks.len(),
        );

        Ok(Arc::new(archive))
    }

    /// Returns every chunk of the archive, in table order.
    #[inline]
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    /// Returns the whole archive.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the bytes of the chunk of type `chunk_type` named `name`.
    ///
    /// If there is no such chunk, but a chunk of another type has this name, this is a
    /// [`DecodeError::ChunkTypeMismatch`] rather than [`ArchiveError::NotFound`].
    pub fn chunk(&self, chunk_type: ChunkType, name: &str) -> Result<&[u8], ArchiveError> {
        let indices = self.index.get(name).map_or(&[][..], |indices| &indices[..]);

        if let Some(chunk) = indices
            .iter()
            .map(|&i| &self.chunks[i])
            .find(|chunk| chunk.chunk_type == chunk_type)
        {
            return Ok(&self.data[chunk.range.clone()]);
        }

        match indices.first() {
            Some(&i) => Err(DecodeError::ChunkTypeMismatch {
                name: name.to_owned(),
                expected: chunk_type,
                found: self.chunks[i].chunk_type,
            }
            .into()),
            None => Err(ArchiveError::NotFound {
                chunk_type,
                name: name.to_owned(),
            }),
        }
    }

    /// Decodes the debug info chunk, if the archive has one.
    pub fn debug_info(&self) -> Result<Option<DebugInfo>, ArchiveError> {
        let Some(chunk) = self
            .chunks
            .iter()
            .find(|chunk| chunk.chunk_type == ChunkType::ArchiveDebugInfo)
        else {
            return Ok(None);
        };

        let arena = FixedLinearAllocator::new(Arc::new(DefaultRawAllocator));
        let info: SerializedDebugInfo<'_> = deserialize(&self.data[chunk.range.clone()], &arena)?;

        Ok(Some(DebugInfo {
            api_version: info.api_version,
            git_hash: info.git_hash.to_owned(),
        }))
    }
}

impl Debug for Archive {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Archive")
            .field("size", &self.data.len())
            .field("chunks", &self.chunks)
            .finish()
    }
}

/// Error that can happen when reading an archive or unpacking an object from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveError {
    /// The archive has no chunk with this type and name.
    NotFound { chunk_type: ChunkType, name: String },

    /// The archive is corrupt or was written by an incompatible version.
    Decode(DecodeError),

    /// Host memory for the unpacked object could not be allocated.
    Allocation(AllocationError),

    /// Objects were unpacked for a device of another type than the backend.
    IncompatibleDevice {
        expected: DeviceType,
        found: DeviceType,
    },

    /// The archived description of a signature is not valid.
    InvalidSignature(SignatureError),

    /// The archived description of a render pass is not valid.
    InvalidRenderPass(RenderPassError),
}

impl Error for ArchiveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::Allocation(err) => Some(err),
            Self::InvalidSignature(err) => Some(err),
            Self::InvalidRenderPass(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ArchiveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NotFound { chunk_type, name } => {
                write!(f, "the archive has no {:?} chunk named `{}`", chunk_type, name)
            }
            Self::Decode(_) => write!(f, "the archive could not be decoded"),
            Self::Allocation(_) => write!(f, "allocating host memory failed"),
            Self::IncompatibleDevice { expected, found } => write!(
                f,
                "the backend requires a {} device, but a {} device was provided",
                expected.name(),
                found.name(),
            ),
            Self::InvalidSignature(_) => {
                write!(f, "the archived resource signature description is invalid")
            }
            Self::InvalidRenderPass(_) => {
                write!(f, "the archived render pass description is invalid")
            }
        }
    }
}

impl From<DecodeError> for ArchiveError {
    #[inline]
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<AllocationError> for ArchiveError {
    #[inline]
    fn from(err: AllocationError) -> Self {
        Self::Allocation(err)
    }
}

impl From<RenderPassError> for ArchiveError {
    #[inline]
    fn from(err: RenderPassError) -> Self {
        Self::InvalidRenderPass(err)
    }
}

impl From<SignatureError> for ArchiveError {
    #[inline]
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::IncompatibleDevice { expected, found } => {
                Self::IncompatibleDevice { expected, found }
            }
            SignatureError::Allocation(err) => Self::Allocation(err),
            err => Self::InvalidSignature(err),
        }
    }
}

/// Error that can happen when decoding archived data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The data ended while `needed` more bytes were expected.
    UnexpectedEnd { needed: usize, remaining: usize },

    /// A section was not consumed exactly by its structure.
    SizeMismatch { expected: usize, consumed: usize },

    /// The data doesn't start with [`ARCHIVE_MAGIC`].
    BadMagic { found: u32 },

    /// The archive was written with another layout version.
    VersionMismatch { expected: u32, found: u32 },

    /// The chunk with the requested name has another type.
    ChunkTypeMismatch {
        name: String,
        expected: ChunkType,
        found: ChunkType,
    },

    /// An enum has a value that doesn't correspond to any variant.
    InvalidEnumValue { ty: &'static str, value: u32 },

    /// A set of flags has unknown bits set.
    InvalidFlags { ty: &'static str, value: u32 },

    /// A string is not valid UTF-8.
    InvalidUtf8,

    /// Two chunks of the same type have the same name.
    DuplicateChunk { chunk_type: ChunkType, name: String },

    /// The byte range of a chunk is outside of the payload area.
    ChunkOutOfBounds { name: String, offset: u32, size: u32 },

    /// The chunk has no section for the device type.
    MissingDeviceData { name: String, device_type: DeviceType },

    /// Two parts of the archived data contradict each other.
    InconsistentData { what: &'static str },
}

impl Error for DecodeError {}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::UnexpectedEnd { needed, remaining } => write!(
                f,
                "the data ended early: {} bytes are needed but only {} remain",
                needed, remaining,
            ),
            Self::SizeMismatch { expected, consumed } => write!(
                f,
                "the section is {} bytes long, but its contents took up {} bytes",
                expected, consumed,
            ),
            Self::BadMagic { found } => {
                write!(f, "the data is not an archive (magic number {:#010x})", found)
            }
            Self::VersionMismatch { expected, found } => write!(
                f,
                "the archive has version {}, but version {} is required",
                found, expected,
            ),
            Self::ChunkTypeMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "the chunk `{}` is a {:?} chunk, but a {:?} chunk was requested",
                name, found, expected,
            ),
            Self::InvalidEnumValue { ty, value } => {
                write!(f, "{} is not a valid `{}` value", value, ty)
            }
            Self::InvalidFlags { ty, value } => {
                write!(f, "{:#x} contains unknown `{}` bits", value, ty)
            }
            Self::InvalidUtf8 => write!(f, "a string is not valid UTF-8"),
            Self::DuplicateChunk { chunk_type, name } => write!(
                f,
                "there is more than one {:?} chunk named `{}`",
                chunk_type, name,
            ),
            Self::ChunkOutOfBounds { name, offset, size } => write!(
                f,
                "the chunk `{}` ({} bytes at offset {}) is outside of the payload area",
                name, size, offset,
            ),
            Self::MissingDeviceData { name, device_type } => write!(
                f,
                "the chunk `{}` has no data for {} devices",
                name,
                device_type.name(),
            ),
            Self::InconsistentData { what } => write!(f, "inconsistent archive data: {}", what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{serializer::serialize_to_vec, *};

    fn two_chunk_archive() -> Vec<u8> {
        let mut builder = ArchiveBuilder::new();
        builder.add_chunk(ChunkType::Shaders, "Blur", vec![1, 2, 3]);
        builder.add_chunk(ChunkType::RenderPass, "Blur", vec![4]);
        builder.build()
    }

    #[test]
    fn chunk_lookup() {
        let archive = Archive::new(two_chunk_archive()).unwrap();

        assert_eq!(archive.chunks().len(), 2);
        assert_eq!(archive.chunk(ChunkType::Shaders, "Blur").unwrap(), [1, 2, 3]);
        assert_eq!(archive.chunk(ChunkType::RenderPass, "Blur").unwrap(), [4]);
        assert_eq!(
            archive.chunk(ChunkType::Shaders, "Sharpen"),
            Err(ArchiveError::NotFound {
                chunk_type: ChunkType::Shaders,
                name: "Sharpen".into(),
            }),
        );
        assert_eq!(
            archive.chunk(ChunkType::ResourceSignature, "Blur"),
            Err(ArchiveError::Decode(DecodeError::ChunkTypeMismatch {
                name: "Blur".into(),
                expected: ChunkType::ResourceSignature,
                found: ChunkType::Shaders,
            })),
        );
        assert_eq!(archive.debug_info(), Ok(None));
    }

    #[test]
    fn corrupt_headers() {
        let data = two_chunk_archive();

        let mut bad_magic = data.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            Archive::new(bad_magic),
            Err(ArchiveError::Decode(DecodeError::BadMagic { .. })),
        ));

        let mut bad_version = data.clone();
        bad_version[4] = 9;
        assert_eq!(
            Archive::new(bad_version).unwrap_err(),
            ArchiveError::Decode(DecodeError::VersionMismatch {
                expected: ARCHIVE_VERSION,
                found: 9,
            }),
        );

        for len in [0, 7, HEADER_SIZE + 2] {
            assert!(matches!(
                Archive::new(data[..len].to_vec()),
                Err(ArchiveError::Decode(DecodeError::UnexpectedEnd { .. })),
            ));
        }
    }

    #[test]
    fn truncated_payload() {
        let data = two_chunk_archive();
        let truncated = data[..data.len() - 1].to_vec();

        assert!(matches!(
            Archive::new(truncated),
            Err(ArchiveError::Decode(DecodeError::ChunkOutOfBounds { .. })),
        ));
    }

    #[test]
    fn chunk_past_the_end() {
        let mut data = Vec::new();
        data.extend_from_slice(&ARCHIVE_MAGIC.to_le_bytes());
        data.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&serialize_to_vec(&ChunkTable {
            chunks: &[ChunkHeader {
                chunk_type: ChunkType::Shaders,
                name: "Huge",
                offset: u32::MAX,
                size: u32::MAX,
            }],
        }));

        assert_eq!(
            Archive::new(data).unwrap_err(),
            ArchiveError::Decode(DecodeError::ChunkOutOfBounds {
                name: "Huge".into(),
                offset: u32::MAX,
                size: u32::MAX,
            }),
        );
    }

    #[test]
    fn duplicate_chunks() {
        let mut builder = ArchiveBuilder::new();
        builder.add_chunk(ChunkType::Shaders, "Blur", vec![1]);
        builder.add_chunk(ChunkType::Shaders, "Blur", vec![2]);

        assert_eq!(
            Archive::new(builder.build()).unwrap_err(),
            ArchiveError::Decode(DecodeError::DuplicateChunk {
                chunk_type: ChunkType::Shaders,
                name: "Blur".into(),
            }),
        );
    }

    #[test]
    fn debug_info() {
        let mut builder = ArchiveBuilder::new();
        builder.set_debug_info(API_VERSION + 1, "0123abcd");
        let archive = Archive::new(builder.build()).unwrap();

        assert_eq!(
            archive.debug_info().unwrap(),
            Some(DebugInfo {
                api_version: API_VERSION + 1,
                git_hash: "0123abcd".into(),
            }),
        );
    }

    #[test]
    fn error_sources() {
        let err = ArchiveError::from(DecodeError::InvalidUtf8);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "the archive could not be decoded");

        let err = ArchiveError::from(SignatureError::IncompatibleDevice {
            expected: DeviceType::Vulkan,
            found: DeviceType::Direct3D12,
        });
        assert!(matches!(err, ArchiveError::IncompatibleDevice { .. }));
    }
}
