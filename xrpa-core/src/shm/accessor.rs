// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Bounds-checked typed view over a byte range.
//!
//! All scalar encodings are little-endian regardless of host endianness so
//! the segment layout is identical on every platform. Reads and writes take
//! an external [`MemoryOffset`] cursor and advance it.
//!
//! Going past the end of a view is a schema/size mismatch, never a runtime
//! condition, so it panics. "Not available" is expressed by the null
//! accessor instead (see [`MemoryAccessor::is_null`]).

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use crate::types::ObjectUuid;

/// Read/write cursor into a [`MemoryAccessor`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOffset {
    pub offset: usize,
}

impl MemoryOffset {
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Advance by `count` bytes, returning the position before the advance.
    pub fn advance(&mut self, count: usize) -> usize {
        let pos = self.offset;
        self.offset += count;
        pos
    }
}

/// A `(source, offset, size)` view over memory owned by a region.
///
/// Accessors are `Copy` and write through `&self`: the bytes behind them are
/// shared with other processes, so exclusive Rust borrows would not mean
/// anything. Cross-process exclusion comes from the transport mutex.
#[derive(Clone, Copy)]
pub struct MemoryAccessor<'a> {
    ptr: Option<NonNull<u8>>,
    size: usize,
    _marker: PhantomData<&'a UnsafeCell<[u8]>>,
}

macro_rules! scalar_accessors {
    ($($read:ident, $write:ident, $ty:ty;)*) => {
        $(
            pub fn $read(&self, pos: &mut MemoryOffset) -> $ty {
                let mut buf = [0u8; size_of::<$ty>()];
                self.copy_out(pos.advance(size_of::<$ty>()), &mut buf);
                <$ty>::from_le_bytes(buf)
            }

            pub fn $write(&self, value: $ty, pos: &mut MemoryOffset) {
                self.copy_in(pos.advance(size_of::<$ty>()), &value.to_le_bytes());
            }
        )*
    };
}

impl<'a> MemoryAccessor<'a> {
    /// The null accessor: size 0, no backing store.
    pub const fn null() -> Self {
        Self {
            ptr: None,
            size: 0,
            _marker: PhantomData,
        }
    }

    /// Create an accessor over raw memory.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes for `'a`, and
    /// no Rust reference to those bytes may be alive while the accessor is.
    pub unsafe fn from_raw(ptr: *mut u8, size: usize) -> Self {
        match NonNull::new(ptr) {
            Some(ptr) => Self {
                ptr: Some(ptr),
                size,
                _marker: PhantomData,
            },
            None => Self::null(),
        }
    }

    /// Create an accessor over an exclusively borrowed buffer.
    pub fn from_slice(bytes: &'a mut [u8]) -> Self {
        // SAFETY: the exclusive borrow lives for 'a and is not used elsewhere.
        unsafe { Self::from_raw(bytes.as_mut_ptr(), bytes.len()) }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sub-view at `offset` of `size` bytes, validated against this view.
    pub fn slice(&self, offset: usize, size: usize) -> Self {
        self.check_bounds(offset, size);
        match self.ptr {
            // SAFETY: bounds checked above
            Some(ptr) => Self {
                ptr: Some(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset)) }),
                size,
                _marker: PhantomData,
            },
            None => Self::null(),
        }
    }

    /// Sub-view from `offset` to the end of this view.
    pub fn slice_from(&self, offset: usize) -> Self {
        self.check_bounds(offset, 0);
        self.slice(offset, self.size - offset)
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    fn check_bounds(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.size),
            "memory access out of bounds: offset {} + size {} > view size {}",
            offset,
            len,
            self.size
        );
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        self.check_bounds(offset, dst.len());
        if dst.is_empty() {
            return;
        }
        // SAFETY: bounds checked; a non-empty range implies a non-null view
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    fn copy_in(&self, offset: usize, src: &[u8]) {
        self.check_bounds(offset, src.len());
        if src.is_empty() {
            return;
        }
        // SAFETY: bounds checked; a non-empty range implies a non-null view
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
    }

    scalar_accessors! {
        read_u8, write_u8, u8;
        read_i8, write_i8, i8;
        read_i16, write_i16, i16;
        read_u16, write_u16, u16;
        read_i32, write_i32, i32;
        read_u32, write_u32, u32;
        read_i64, write_i64, i64;
        read_u64, write_u64, u64;
        read_f32, write_f32, f32;
        read_f64, write_f64, f64;
    }

    pub fn read_uuid(&self, pos: &mut MemoryOffset) -> ObjectUuid {
        let id0 = self.read_u64(pos);
        let id1 = self.read_u64(pos);
        ObjectUuid::new(id0, id1)
    }

    pub fn write_uuid(&self, id: ObjectUuid, pos: &mut MemoryOffset) {
        self.write_u64(id.id0, pos);
        self.write_u64(id.id1, pos);
    }

    /// Serialized size of a length-prefixed string.
    pub fn dyn_size_of_str(value: &str) -> usize {
        size_of::<i32>() + value.len()
    }

    /// Serialized size of a length-prefixed byte array.
    pub fn dyn_size_of_bytearray(value: &[u8]) -> usize {
        size_of::<i32>() + value.len()
    }

    pub fn read_str(&self, pos: &mut MemoryOffset) -> String {
        String::from_utf8_lossy(&self.read_bytearray(pos)).into_owned()
    }

    pub fn write_str(&self, value: &str, pos: &mut MemoryOffset) {
        self.write_bytearray(value.as_bytes(), pos);
    }

    pub fn read_bytearray(&self, pos: &mut MemoryOffset) -> Vec<u8> {
        let count = self.read_i32(pos);
        assert!(count >= 0, "negative length prefix {}", count);
        let mut bytes = vec![0u8; count as usize];
        self.copy_out(pos.advance(bytes.len()), &mut bytes);
        bytes
    }

    pub fn write_bytearray(&self, value: &[u8], pos: &mut MemoryOffset) {
        assert!(
            value.len() <= i32::MAX as usize,
            "byte array of {} bytes exceeds the length prefix",
            value.len()
        );
        self.write_i32(value.len() as i32, pos);
        self.copy_in(pos.advance(value.len()), value);
    }

    /// Raw copy of `min(src.size, self.size)` bytes.
    pub fn copy_from(&self, src: MemoryAccessor<'_>) {
        let count = src.size.min(self.size);
        if count == 0 {
            return;
        }
        // SAFETY: both ranges are in bounds of their views; views may overlap
        unsafe {
            std::ptr::copy(src.as_ptr(), self.as_ptr(), count);
        }
    }

    pub fn fill(&self, byte: u8) {
        if self.size == 0 {
            return;
        }
        // SAFETY: whole view is in bounds
        unsafe {
            std::ptr::write_bytes(self.as_ptr(), byte, self.size);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size];
        self.copy_out(0, &mut bytes);
        bytes
    }
}

impl fmt::Debug for MemoryAccessor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAccessor")
            .field("null", &self.is_null())
            .field("size", &self.size)
            .finish()
    }
}

impl Default for MemoryAccessor<'_> {
    fn default() -> Self {
        Self::null()
    }
}
