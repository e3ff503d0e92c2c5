// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The target device and the objects that can be bound to it.
//!
//! Creating the underlying API device is not the job of this crate. A [`Device`] only records
//! which backend objects are created for and which allocator their host memory comes from.

use crate::{
    macros::{archive_enum, impl_id_counter},
    memory::{DefaultRawAllocator, RawAllocator},
    NonExhaustive,
};
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    num::NonZero,
    sync::Arc,
};

archive_enum! {
    /// The graphics API that a device drives.
    DeviceType
    impl {
        /// Every device type, in the order of their archive sections.
        pub const ALL: [DeviceType; 2] = [DeviceType::Vulkan, DeviceType::Direct3D12];

        /// Returns a human readable name of the API.
        #[inline]
        pub const fn name(self) -> &'static str {
            match self {
                DeviceType::Vulkan => "Vulkan",
                DeviceType::Direct3D12 => "Direct3D12",
            }
        }
    }
    = u8;

    Vulkan = 0,
    Direct3D12 = 1,
}

/// Parameters to create a new [`Device`].
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The API of the device.
    ///
    /// The default value is [`DeviceType::Vulkan`].
    pub device_type: DeviceType,

    /// The allocator that host memory of objects created for the device comes from.
    ///
    /// The default value is `None`, which uses [`DefaultRawAllocator`].
    pub allocator: Option<Arc<dyn RawAllocator>>,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            device_type: DeviceType::Vulkan,
            allocator: None,
            _ne: NonExhaustive(()),
        }
    }
}

/// Handle to the device that objects are unpacked for.
pub struct Device {
    id: NonZero<u64>,
    device_type: DeviceType,
    allocator: Arc<dyn RawAllocator>,
}

impl Device {
    /// Creates a new `Device`.
    pub fn new(create_info: DeviceCreateInfo) -> Arc<Device> {
        let DeviceCreateInfo {
            device_type,
            allocator,
            _ne: _,
        } = create_info;

        Arc::new(Device {
            id: Self::next_id(),
            device_type,
            allocator: allocator.unwrap_or_else(|| Arc::new(DefaultRawAllocator)),
        })
    }

    /// Returns the API of the device.
    #[inline]
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Returns the allocator used for host memory of objects created for this device.
    #[inline]
    pub fn raw_allocator(&self) -> &Arc<dyn RawAllocator> {
        &self.allocator
    }
}

impl_id_counter!(Device);

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("device_type", &self.device_type)
            .finish_non_exhaustive()
    }
}

/// Implemented on objects that belong to a device.
pub trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

/// The kind of a GPU object that can be bound to a shader resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceObjectKind {
    Buffer,
    BufferView,
    TextureView,
    Sampler,
    AccelerationStructure,
}

/// A GPU object that can be bound to a shader resource variable.
///
/// The objects themselves are created by the backend and are opaque to the binding code, which
/// only checks that their kind matches the slot they are bound to.
pub trait DeviceObject: Debug + Send + Sync {
    /// Returns the kind of the object.
    fn kind(&self) -> DeviceObjectKind;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::CountingAllocator;

    #[test]
    fn devices_are_distinct() {
        let a = crate::tests::device(DeviceType::Vulkan);
        let b = crate::tests::device(DeviceType::Direct3D12);

        assert_ne!(*a, *b);
        assert_eq!(a.device_type().name(), "Vulkan");
        assert_eq!(b.device_type(), DeviceType::Direct3D12);
    }

    #[test]
    fn custom_allocator() {
        let raw = Arc::new(CountingAllocator::new());
        let device = crate::tests::device_with_allocator(DeviceType::Vulkan, raw.clone());
        let layout = std::alloc::Layout::new::<u64>();
        let ptr = device.raw_allocator().allocate(layout).unwrap();
        assert_eq!(raw.live_allocations(), 1);
        unsafe { device.raw_allocator().deallocate(ptr, layout) };
        assert_eq!(raw.live_allocations(), 0);
    }

    #[test]
    fn objects_are_printed_by_name() {
        let object = crate::tests::mock(DeviceObjectKind::Sampler, "linear");

        assert_eq!(object.kind(), DeviceObjectKind::Sampler);
        assert_eq!(format!("{:?}", object), "Sampler `linear`");
    }

    #[test]
    fn device_type_raw_values() {
        assert_eq!(u8::from(DeviceType::Direct3D12), 1);
        assert_eq!(DeviceType::try_from(0), Ok(DeviceType::Vulkan));
        assert_eq!(DeviceType::try_from(7), Err(()));
        assert_eq!(DeviceType::COUNT, DeviceType::ALL.len());
    }
}
