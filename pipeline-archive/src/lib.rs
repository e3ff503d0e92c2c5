// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Persisted pipeline objects and runtime shader resource bindings.
//!
//! # Overview
//!
//! - An [`Archive`](crate::archive::Archive) is an immutable binary store of named, typed chunks.
//!   Archives are written once with an [`ArchiveBuilder`](crate::archive::ArchiveBuilder) and
//!   then shared between threads.
//!
//! - A [`DeviceObjectArchive`](crate::archive::DeviceObjectArchive) unpacks the chunks of an
//!   archive into objects for a [`Device`](crate::device::Device) of one
//!   [`Backend`](crate::backend::Backend). The backend specific layout of a resource signature is
//!   stored in the archive, so unpacking it doesn't need to derive the layout again. Every object
//!   is decoded at most once per name.
//!
//! - A [`PipelineResourceSignature`](crate::pipeline::PipelineResourceSignature) describes the
//!   resources that the shaders of a pipeline access. It owns the static resources, and the
//!   memory pools that its shader resource bindings allocate from.
//!
//! - A [`ShaderResourceBinding`](crate::binding::ShaderResourceBinding) holds the resources that
//!   are bound to a signature for a draw or dispatch. Resources are bound through per-stage
//!   variables, by name, by index or all at once from a
//!   [`ResourceMapping`](crate::binding::ResourceMapping).
//!
//! # Memory
//!
//! All host memory of unpacked objects and bindings comes from the
//! [`RawAllocator`](crate::memory::RawAllocator) of the device. See the [`memory`] module.

pub use crate::{
    archive::{Archive, ArchiveError, DecodeError, DeviceObjectArchive},
    backend::{Backend, Direct3D12, Vulkan},
    binding::ShaderResourceBinding,
    device::{Device, DeviceCreateInfo, DeviceType},
    pipeline::PipelineResourceSignature,
};

mod macros;

pub mod archive;
pub mod backend;
pub mod binding;
mod cache;
pub mod device;
pub mod memory;
pub mod pipeline;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside of this crate. Structures with a field of this type
/// can only be constructed by calling a constructor function or `Default::default()`. The effect
/// is similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
