// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Binary encoding of archive structures.
//!
//! Every archived structure implements [`Serialize`] once. The same function measures the
//! encoded size, writes it and reads it back, depending on the mode of the [`Serializer`] it is
//! given. Fields are visited through `&mut` references: in measuring and writing mode they are
//! only read, in reading mode they are overwritten.
//!
//! # Encoding
//!
//! - Integers and floats are little endian, with the size of their Rust type.
//! - `bool` is one byte, 0 or 1.
//! - Enums are one byte, flags are four bytes.
//! - Strings are a `u32` byte length followed by UTF-8 bytes, without a terminator.
//! - Arrays are a `u32` element count followed by the elements.
//! - Arrays of [`Pod`] records are a `u32` element count followed by the records copied as one
//!   flat byte span. These records must not contain padding, which `Pod` guarantees.
//!
//! # Reading
//!
//! Strings and arrays that are read are copied into a [`FixedLinearAllocator`]. Reading a
//! structure is done twice over the same bytes, see [`deserialize`]: the first pass only declares
//! the arrays that will be needed, then the allocator reserves its block, and the second pass
//! fills in the structure.

use super::{ArchiveError, DecodeError};
use crate::memory::FixedLinearAllocator;
use bytemuck::Pod;
use std::mem;

/// A structure that has an archived representation.
///
/// `'a` is the lifetime of the allocator that strings and arrays are read into.
pub trait Serialize<'a>: Default {
    /// Visits every field of `self` in archive order.
    ///
    /// `allocator` is only used in reading mode and may be `None` otherwise.
    fn serialize(
        &mut self,
        ser: &mut Serializer<'_>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError>;
}

/// An enum that is archived as a single byte.
pub trait SerializedEnum: Copy {
    const NAME: &'static str;

    fn to_raw(self) -> u8;

    fn from_raw(raw: u8) -> Option<Self>;
}

/// A set of flags that is archived as four bytes.
pub trait SerializedFlags: Copy {
    const NAME: &'static str;

    fn to_raw(self) -> u32;

    fn from_raw(raw: u32) -> Option<Self>;
}

/// What a [`Serializer`] does with the fields it visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerializerMode {
    /// Adds up the encoded size.
    Measure,
    /// Encodes the fields into a buffer.
    Write,
    /// Decodes the fields from a buffer.
    Read,
}

/// Visits the fields of archived structures, see the [module-level documentation](self).
pub struct Serializer<'s> {
    buffer: Buffer<'s>,
    cursor: usize,
}

enum Buffer<'s> {
    Measure,
    Write(&'s mut [u8]),
    Read(&'s [u8]),
}

macro_rules! serialize_primitives {
    ($($name:ident: $ty:ty,)*) => {
        $(
            #[doc = concat!("Visits a `", stringify!($ty), "`.")]
            #[inline]
            pub fn $name(&mut self, value: &mut $ty) -> Result<(), DecodeError> {
                if self.is_reading() {
                    let mut bytes = [0; mem::size_of::<$ty>()];
                    bytes.copy_from_slice(self.take(mem::size_of::<$ty>())?);
                    *value = <$ty>::from_le_bytes(bytes);
                } else {
                    self.put(&value.to_le_bytes());
                }

                Ok(())
            }
        )*
    };
}

impl<'s> Serializer<'s> {
    /// Creates a serializer that measures the encoded size.
    #[inline]
    pub fn measure() -> Self {
        Serializer {
            buffer: Buffer::Measure,
            cursor: 0,
        }
    }

    /// Creates a serializer that writes into `dst`, which must be exactly as large as the
    /// measured size.
    #[inline]
    pub fn write(dst: &'s mut [u8]) -> Self {
        Serializer {
            buffer: Buffer::Write(dst),
            cursor: 0,
        }
    }

    /// Creates a serializer that reads from `src`.
    #[inline]
    pub fn read(src: &'s [u8]) -> Self {
        Serializer {
            buffer: Buffer::Read(src),
            cursor: 0,
        }
    }

    /// Returns the mode of the serializer.
    #[inline]
    pub fn mode(&self) -> SerializerMode {
        match self.buffer {
            Buffer::Measure => SerializerMode::Measure,
            Buffer::Write(_) => SerializerMode::Write,
            Buffer::Read(_) => SerializerMode::Read,
        }
    }

    #[inline]
    fn is_reading(&self) -> bool {
        matches!(self.buffer, Buffer::Read(_))
    }

    /// Returns the number of bytes visited so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Returns the number of bytes left in the buffer. Always 0 when measuring.
    #[inline]
    pub fn remaining(&self) -> usize {
        match &self.buffer {
            Buffer::Measure => 0,
            Buffer::Write(dst) => dst.len() - self.cursor,
            Buffer::Read(src) => src.len() - self.cursor,
        }
    }

    /// Returns whether the whole buffer has been visited. Always true when measuring.
    #[inline]
    pub fn is_ended(&self) -> bool {
        self.remaining() == 0
    }

    /// Appends `bytes` when writing, or only counts them when measuring.
    fn put(&mut self, bytes: &[u8]) {
        let len = bytes.len();

        if let Buffer::Write(dst) = &mut self.buffer {
            assert!(
                len <= dst.len() - self.cursor,
                "the write buffer is smaller than the measured size",
            );
            dst[self.cursor..self.cursor + len].copy_from_slice(bytes);
        }

        self.cursor += len;
    }

    /// Consumes `len` bytes of the read buffer.
    fn take(&mut self, len: usize) -> Result<&'s [u8], DecodeError> {
        let Buffer::Read(src) = self.buffer else {
            unreachable!("only a reading serializer consumes its buffer");
        };

        let remaining = src.len() - self.cursor;

        if len > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }

        let bytes = &src[self.cursor..self.cursor + len];
        self.cursor += len;

        Ok(bytes)
    }

    serialize_primitives! {
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_i8: i8,
        serialize_i32: i32,
        serialize_f32: f32,
    }

    /// Visits a `bool`.
    pub fn serialize_bool(&mut self, value: &mut bool) -> Result<(), DecodeError> {
        let mut raw = *value as u8;
        self.serialize_u8(&mut raw)?;

        if self.is_reading() {
            *value = match raw {
                0 => false,
                1 => true,
                _ => {
                    return Err(DecodeError::InvalidEnumValue {
                        ty: "bool",
                        value: raw as u32,
                    })
                }
            };
        }

        Ok(())
    }

    /// Visits an enum.
    pub fn serialize_enum<E: SerializedEnum>(&mut self, value: &mut E) -> Result<(), DecodeError> {
        let mut raw = value.to_raw();
        self.serialize_u8(&mut raw)?;

        if self.is_reading() {
            *value = E::from_raw(raw).ok_or(DecodeError::InvalidEnumValue {
                ty: E::NAME,
                value: raw as u32,
            })?;
        }

        Ok(())
    }

    /// Visits a set of flags.
    pub fn serialize_flags<F: SerializedFlags>(
        &mut self,
        value: &mut F,
    ) -> Result<(), DecodeError> {
        let mut raw = value.to_raw();
        self.serialize_u32(&mut raw)?;

        if self.is_reading() {
            *value = F::from_raw(raw).ok_or(DecodeError::InvalidFlags {
                ty: F::NAME,
                value: raw,
            })?;
        }

        Ok(())
    }

    fn serialize_len(&mut self, len: usize) -> Result<usize, DecodeError> {
        let mut len = u32::try_from(len).unwrap_or_else(|_| {
            panic!("arrays and strings in an archive can't have more than u32::MAX elements")
        });
        self.serialize_u32(&mut len)?;

        Ok(len as usize)
    }

    /// Visits a string.
    pub fn serialize_str<'a>(
        &mut self,
        value: &mut &'a str,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        let len = self.serialize_len(value.len())?;

        if !self.is_reading() {
            self.put(value.as_bytes());
            return Ok(());
        }

        let bytes = self.take(len)?;
        let string = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        let allocator = read_allocator(allocator);

        if allocator.is_reserved() {
            *value = allocator.copy_str(string);
        } else {
            allocator.add_space_for_string(string);
            *value = "";
        }

        Ok(())
    }

    /// Visits an array of structures.
    ///
    /// When reading, every element is assumed to take up at least one byte.
    pub fn serialize_array<'a, T: Serialize<'a> + Copy>(
        &mut self,
        array: &mut &'a [T],
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        let count = self.serialize_len(array.len())?;

        if !self.is_reading() {
            for element in array.iter() {
                let mut element = *element;
                element.serialize(self, allocator)?;
            }

            return Ok(());
        }

        if count > self.remaining() {
            return Err(DecodeError::UnexpectedEnd {
                needed: count,
                remaining: self.remaining(),
            });
        }

        let arena = read_allocator(allocator);

        if !arena.is_reserved() {
            arena.add_space::<T>(count);

            for _ in 0..count {
                T::default().serialize(self, allocator)?;
            }

            *array = &[];

            return Ok(());
        }

        let slots = arena.allocate::<T>(count);

        for slot in slots.iter_mut() {
            let mut element = T::default();
            element.serialize(self, allocator)?;
            slot.write(element);
        }

        // SAFETY: Every element was initialized above.
        *array = unsafe { std::slice::from_raw_parts(slots.as_ptr().cast::<T>(), count) };

        Ok(())
    }

    /// Visits an array of records that are copied as a flat byte span.
    pub fn serialize_pod_array<'a, T: Pod>(
        &mut self,
        array: &mut &'a [T],
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        let count = self.serialize_len(array.len())?;

        if !self.is_reading() {
            self.put(bytemuck::cast_slice::<T, u8>(array));
            return Ok(());
        }

        let byte_len = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(DecodeError::UnexpectedEnd {
                needed: usize::MAX,
                remaining: self.remaining(),
            })?;
        let src = self.take(byte_len)?;
        let arena = read_allocator(allocator);

        if !arena.is_reserved() {
            arena.add_space::<T>(count);
            *array = &[];

            return Ok(());
        }

        // The source bytes are not necessarily aligned for `T`, so they are copied as bytes.
        let dst = arena.allocate_zeroed::<T>(count);
        bytemuck::cast_slice_mut::<T, u8>(dst).copy_from_slice(src);
        *array = dst;

        Ok(())
    }

    /// Visits an optional structure, preceded by a `bool` that tells whether it is present.
    pub fn serialize_option<'a, T: Serialize<'a>>(
        &mut self,
        value: &mut Option<T>,
        allocator: Option<&'a FixedLinearAllocator>,
    ) -> Result<(), DecodeError> {
        let mut present = value.is_some();
        self.serialize_bool(&mut present)?;

        if self.is_reading() {
            *value = if present {
                let mut inner = T::default();
                inner.serialize(self, allocator)?;

                Some(inner)
            } else {
                None
            };
        } else if let Some(inner) = value {
            inner.serialize(self, allocator)?;
        }

        Ok(())
    }
}

fn read_allocator(allocator: Option<&FixedLinearAllocator>) -> &FixedLinearAllocator {
    match allocator {
        Some(allocator) => allocator,
        None => panic!("an allocator is required to read strings and arrays"),
    }
}

/// Returns the number of bytes that `value` is encoded into.
pub fn measure<'a, T: Serialize<'a> + Copy>(value: &T) -> usize {
    let mut ser = Serializer::measure();

    if let Err(err) = { *value }.serialize(&mut ser, None) {
        unreachable!("measuring can't fail: {}", err);
    }

    ser.position()
}

/// Encodes `value`.
///
/// # Panics
///
/// - Panics if the written size differs from the measured size.
pub fn serialize_to_vec<'a, T: Serialize<'a> + Copy>(value: &T) -> Vec<u8> {
    let size = measure(value);
    let mut data = vec![0; size];
    let mut ser = Serializer::write(&mut data);

    if let Err(err) = { *value }.serialize(&mut ser, None) {
        unreachable!("writing can't fail: {}", err);
    }

    assert_eq!(
        ser.position(),
        size,
        "the written size differs from the measured size",
    );

    data
}

/// Decodes a `T` that must take up all of `bytes`.
///
/// `allocator` must be a fresh allocator. It is sized by a first pass over `bytes`, reserved, and
/// then receives the strings and arrays of `T` during the second pass.
///
/// # Panics
///
/// - Panics if `allocator` is already reserved.
pub fn deserialize<'a, T: Serialize<'a>>(
    bytes: &[u8],
    allocator: &'a FixedLinearAllocator,
) -> Result<T, ArchiveError> {
    let (value, consumed) = deserialize_prefix(bytes, allocator)?;

    if consumed != bytes.len() {
        return Err(DecodeError::SizeMismatch {
            expected: bytes.len(),
            consumed,
        }
        .into());
    }

    Ok(value)
}

/// Decodes a `T` from the start of `bytes`, and returns it together with the number of bytes it
/// took up.
///
/// # Panics
///
/// - Panics if `allocator` is already reserved.
pub fn deserialize_prefix<'a, T: Serialize<'a>>(
    bytes: &[u8],
    allocator: &'a FixedLinearAllocator,
) -> Result<(T, usize), ArchiveError> {
    assert!(
        !allocator.is_reserved(),
        "deserializing requires an allocator that has not been reserved yet",
    );

    let mut ser = Serializer::read(bytes);
    T::default().serialize(&mut ser, Some(allocator))?;
    let consumed = ser.position();

    allocator.reserve()?;

    let mut value = T::default();
    let mut ser = Serializer::read(&bytes[..consumed]);
    value.serialize(&mut ser, Some(allocator))?;

    Ok((value, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::DeviceType, tests::CountingAllocator};
    use bytemuck::Zeroable;
    use std::sync::Arc;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    struct Pair {
        a: u32,
        b: u16,
        c: u16,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    struct Entry<'a> {
        name: &'a str,
        values: &'a [Pair],
        device_type: Option<DeviceTypeField>,
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct DeviceTypeField(DeviceType);

    impl Default for DeviceTypeField {
        fn default() -> Self {
            DeviceTypeField(DeviceType::Vulkan)
        }
    }

    impl<'a> Serialize<'a> for DeviceTypeField {
        fn serialize(
            &mut self,
            ser: &mut Serializer<'_>,
            _allocator: Option<&'a FixedLinearAllocator>,
        ) -> Result<(), DecodeError> {
            ser.serialize_enum(&mut self.0)
        }
    }

    impl<'a> Serialize<'a> for Entry<'a> {
        fn serialize(
            &mut self,
            ser: &mut Serializer<'_>,
            allocator: Option<&'a FixedLinearAllocator>,
        ) -> Result<(), DecodeError> {
            ser.serialize_str(&mut self.name, allocator)?;
            ser.serialize_pod_array(&mut self.values, allocator)?;
            ser.serialize_option(&mut self.device_type, allocator)
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    struct Table<'a> {
        version: u16,
        enabled: bool,
        scale: f32,
        entries: &'a [Entry<'a>],
    }

    impl<'a> Serialize<'a> for Table<'a> {
        fn serialize(
            &mut self,
            ser: &mut Serializer<'_>,
            allocator: Option<&'a FixedLinearAllocator>,
        ) -> Result<(), DecodeError> {
            ser.serialize_u16(&mut self.version)?;
            ser.serialize_bool(&mut self.enabled)?;
            ser.serialize_f32(&mut self.scale)?;
            ser.serialize_array(&mut self.entries, allocator)
        }
    }

    fn sample_pairs() -> [Pair; 2] {
        [Pair { a: 1, b: 2, c: 3 }, Pair { a: 0xdead_beef, b: 5, c: 6 }]
    }

    fn arena() -> FixedLinearAllocator {
        FixedLinearAllocator::new(Arc::new(CountingAllocator::new()))
    }

    #[test]
    fn little_endian_layout() {
        let mut value = 0x0102_0304u32;
        let mut data = [0u8; 4];
        Serializer::write(&mut data)
            .serialize_u32(&mut value)
            .unwrap();
        assert_eq!(data, [4, 3, 2, 1]);

        let pairs = sample_pairs();
        let entry = Entry {
            name: "ab",
            values: &pairs[..1],
            device_type: None,
        };
        assert_eq!(
            serialize_to_vec(&entry),
            [2, 0, 0, 0, b'a', b'b', 1, 0, 0, 0, 1, 0, 0, 0, 2, 0, 3, 0, 0],
        );
    }

    #[test]
    fn measured_size_matches_written_size() {
        let pairs = sample_pairs();
        let entries = [
            Entry {
                name: "first",
                values: &pairs,
                device_type: Some(DeviceTypeField(DeviceType::Direct3D12)),
            },
            Entry {
                name: "",
                values: &[],
                device_type: None,
            },
        ];
        let table = Table {
            version: 3,
            enabled: true,
            scale: 0.5,
            entries: &entries,
        };

        let data = serialize_to_vec(&table);
        assert_eq!(measure(&table), data.len());

        let arena = arena();
        let decoded: Table<'_> = deserialize(&data, &arena).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn truncated_input() {
        let pairs = sample_pairs();
        let entry = Entry {
            name: "texture",
            values: &pairs,
            device_type: None,
        };
        let data = serialize_to_vec(&entry);

        for len in [0, 3, 8, data.len() - 1] {
            let arena = arena();
            let result = deserialize::<Entry<'_>>(&data[..len], &arena);
            assert!(
                matches!(
                    result,
                    Err(ArchiveError::Decode(DecodeError::UnexpectedEnd { .. })),
                ),
                "length {}: {:?}",
                len,
                result,
            );
        }
    }

    #[test]
    fn trailing_bytes() {
        let mut data = serialize_to_vec(&Entry::default());
        data.push(0);

        let arena = arena();
        assert!(matches!(
            deserialize::<Entry<'_>>(&data, &arena),
            Err(ArchiveError::Decode(DecodeError::SizeMismatch {
                expected: 10,
                consumed: 9,
            })),
        ));
    }

    #[test]
    fn invalid_values() {
        let entry = Entry {
            name: "x",
            values: &[],
            device_type: Some(DeviceTypeField(DeviceType::Vulkan)),
        };
        let mut data = serialize_to_vec(&entry);

        *data.last_mut().unwrap() = 9;
        assert!(matches!(
            deserialize::<Entry<'_>>(&data, &arena()),
            Err(ArchiveError::Decode(DecodeError::InvalidEnumValue {
                ty: "DeviceType",
                value: 9,
            })),
        ));

        data[4] = 0xff;
        assert!(matches!(
            deserialize::<Entry<'_>>(&data, &arena()),
            Err(ArchiveError::Decode(DecodeError::InvalidUtf8)),
        ));
    }

    #[test]
    fn huge_array_count_is_rejected() {
        let data = [0xff, 0xff, 0xff, 0x7f, 1, 2, 3];
        let arena = arena();
        let mut entries: &[Entry<'_>] = &[];
        let result = Serializer::read(&data).serialize_array(&mut entries, Some(&arena));

        assert!(matches!(result, Err(DecodeError::UnexpectedEnd { .. })));
    }

    #[test]
    fn reading_uses_a_single_block() {
        let pairs = sample_pairs();
        let entries = [
            Entry {
                name: "a",
                values: &pairs,
                device_type: None,
            },
            Entry {
                name: "bcd",
                values: &pairs[1..],
                device_type: None,
            },
        ];
        let table = Table {
            entries: &entries,
            ..Default::default()
        };
        let data = serialize_to_vec(&table);

        let raw = Arc::new(CountingAllocator::new());
        let arena = FixedLinearAllocator::new(raw.clone());
        let decoded: Table<'_> = deserialize(&data, &arena).unwrap();

        assert_eq!(decoded.entries[1].name, "bcd");
        assert_eq!(decoded.entries[0].values, &pairs);
        assert_eq!(raw.allocation_count(), 1);
    }
}
