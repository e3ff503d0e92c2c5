// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Binding resources to the slots of a signature.
//!
//! Resources are stored in a [`ShaderResourceCache`], a fixed table of slots partitioned by
//! [`ShaderResourceVariableType`]. Static resources live in a cache owned by the signature; they
//! are copied into the cache of every [`ShaderResourceBinding`] that is created from it. Mutable
//! and dynamic resources live in the cache of the binding itself.
//!
//! Slots are written through [`ShaderResourceVariable`]s. Every shader stage has its own set of
//! variables, managed by a [`ShaderVariableManager`], so a resource that is visible to two
//! stages has a variable in each of them. Both variables refer to the same slots.

pub use self::{
    resource_cache::{ResourceCacheContentType, ShaderResourceCache},
    srb::{ShaderResourceBinding, SrbCreationError},
    variable::{
        ResourceCacheAccess, SetShaderResourceFlags, ShaderResourceVariable, ShaderVariableManager,
    },
};
use crate::{
    device::{DeviceObject, DeviceObjectKind},
    macros::archive_flags,
    pipeline::{ShaderResourceType, ShaderResourceVariableType},
};
use std::{
    collections::HashMap,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    hash::BuildHasher,
    sync::Arc,
};

pub mod resource_cache;
pub mod srb;
pub mod variable;

archive_flags! {
    /// Controls which variables [`bind_resources`] writes to.
    ///
    /// If none of the `UPDATE_*` flags are set, variables of every type are updated.
    ///
    /// [`bind_resources`]: ShaderResourceBinding::bind_resources
    BindShaderResourcesFlags
    impl {
        /// Returns whether variables of `var_type` are updated.
        #[inline]
        pub const fn updates(self, var_type: ShaderResourceVariableType) -> bool {
            let update_flags = self.intersection(Self::UPDATE_ALL);

            if update_flags.is_empty() {
                return true;
            }

            update_flags.intersects(match var_type {
                ShaderResourceVariableType::Static => Self::UPDATE_STATIC,
                ShaderResourceVariableType::Mutable => Self::UPDATE_MUTABLE,
                ShaderResourceVariableType::Dynamic => Self::UPDATE_DYNAMIC,
            })
        }

        /// All `UPDATE_*` flags.
        pub const UPDATE_ALL: BindShaderResourcesFlags = BindShaderResourcesFlags(0x7);
    }
    = u32;

    UPDATE_STATIC = 0x01,
    UPDATE_MUTABLE = 0x02,
    UPDATE_DYNAMIC = 0x04,
    /// Slots that are already bound are left as they are.
    KEEP_EXISTING = 0x08,
    /// Fail if a slot is still unbound after looking it up in the mapping.
    VERIFY_ALL_RESOLVED = 0x10,
    /// Allow replacing the resource bound to a static or mutable slot.
    ALLOW_OVERWRITE = 0x20,
}

/// Resolves resources by name when binding all variables at once.
pub trait ResourceMapping {
    /// Returns the resource for element `array_index` of the resource named `name`.
    fn get_resource(&self, name: &str, array_index: u32) -> Option<Arc<dyn DeviceObject>>;
}

impl<S: BuildHasher> ResourceMapping for HashMap<String, Arc<dyn DeviceObject>, S> {
    #[inline]
    fn get_resource(&self, name: &str, array_index: u32) -> Option<Arc<dyn DeviceObject>> {
        if array_index == 0 {
            self.get(name).cloned()
        } else {
            None
        }
    }
}

impl<S: BuildHasher> ResourceMapping for HashMap<String, Vec<Arc<dyn DeviceObject>>, S> {
    #[inline]
    fn get_resource(&self, name: &str, array_index: u32) -> Option<Arc<dyn DeviceObject>> {
        self.get(name)?.get(array_index as usize).cloned()
    }
}

/// Error that can happen when binding a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingError {
    /// No resource was found for an element, and every element had to be resolved.
    UnresolvedResource { name: String, array_index: u32 },

    /// The object can't be bound to a resource of this type.
    IncompatibleResource {
        name: String,
        resource_type: ShaderResourceType,
        kind: DeviceObjectKind,
    },

    /// The array element doesn't exist.
    ArrayIndexOutOfRange {
        name: String,
        array_index: u32,
        array_size: u32,
    },

    /// Another object is already bound to a static or mutable element.
    AlreadyBound { name: String, array_index: u32 },

    /// Slots of this variable type can't be written in this cache.
    NotWritable {
        var_type: ShaderResourceVariableType,
        content_type: ResourceCacheContentType,
    },
}

impl Error for BindingError {}

impl Display for BindingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::UnresolvedResource { name, array_index } => write!(
                f,
                "no resource was found for element {} of `{}`",
                array_index, name,
            ),
            Self::IncompatibleResource {
                name,
                resource_type,
                kind,
            } => write!(
                f,
                "a {:?} can't be bound to `{}`, which is a {:?} resource",
                kind, name, resource_type,
            ),
            Self::ArrayIndexOutOfRange {
                name,
                array_index,
                array_size,
            } => write!(
                f,
                "element {} of `{}` doesn't exist, the array has {} elements",
                array_index, name, array_size,
            ),
            Self::AlreadyBound { name, array_index } => write!(
                f,
                "element {} of `{}` is already bound, and the variable is not dynamic",
                array_index, name,
            ),
            Self::NotWritable {
                var_type,
                content_type,
            } => write!(
                f,
                "{:?} slots can't be written in a cache owned by a {:?}",
                var_type, content_type,
            ),
        }
    }
}
