// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Fixed 56-byte header at offset 0 of every transport region.
//!
//! ```text
//! @0  i32  transport version ((major << 16) | minor)
//! @4  i32  total region bytes
//! @8  32B  schema hash
//! @40 u64  base timestamp, µs since epoch (0 = not initialized)
//! @48 i32  last changelog id
//! @52 u32  last update age, µs since base timestamp
//! ```
//!
//! The base timestamp, last changelog id and update age are read without the
//! lock, so they are accessed through atomics. The base timestamp is written
//! last during initialization and read with acquire ordering: a non-zero
//! value means every other field is in place.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::shm::{MemoryAccessor, MemoryOffset};
use crate::types::HashValue;

pub const TRANSPORT_VERSION_MAJOR: u16 = 1;
pub const TRANSPORT_VERSION_MINOR: u16 = 0;

/// Encoded version stamped into new segments.
pub const TRANSPORT_VERSION: i32 =
    ((TRANSPORT_VERSION_MAJOR as i32) << 16) | TRANSPORT_VERSION_MINOR as i32;

/// Major component of an encoded version.
pub const fn version_major(version: i32) -> u16 {
    ((version as u32) >> 16) as u16
}

const VERSION_OFFSET: usize = 0;
const TOTAL_BYTES_OFFSET: usize = 4;
const SCHEMA_HASH_OFFSET: usize = 8;
const BASE_TIMESTAMP_OFFSET: usize = 40;
const LAST_CHANGELOG_ID_OFFSET: usize = 48;
const LAST_UPDATE_AGE_OFFSET: usize = 52;

/// View over a transport header.
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader<'a> {
    mem: MemoryAccessor<'a>,
}

impl<'a> TransportHeader<'a> {
    pub const BYTE_COUNT: usize = 56;

    /// Bind to the start of `region`. The region base must be 8-byte aligned.
    pub fn new(region: MemoryAccessor<'a>) -> Self {
        let mem = region.slice(0, Self::BYTE_COUNT);
        assert!(
            mem.as_ptr() as usize % std::mem::align_of::<AtomicU64>() == 0,
            "transport header must be 8-byte aligned"
        );
        Self { mem }
    }

    fn atomic_u64(&self, offset: usize) -> &'a AtomicU64 {
        // SAFETY: in bounds of the header, base is 8-aligned and offset is a
        // multiple of 8; the memory lives for 'a.
        unsafe { &*(self.mem.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn atomic_u32(&self, offset: usize) -> &'a AtomicU32 {
        // SAFETY: as above with a 4-aligned offset.
        unsafe { &*(self.mem.as_ptr().add(offset) as *const AtomicU32) }
    }

    pub fn version(&self) -> i32 {
        self.mem.read_i32(&mut MemoryOffset::new(VERSION_OFFSET))
    }

    pub fn set_version(&self, version: i32) {
        self.mem
            .write_i32(version, &mut MemoryOffset::new(VERSION_OFFSET));
    }

    pub fn total_bytes(&self) -> i32 {
        self.mem.read_i32(&mut MemoryOffset::new(TOTAL_BYTES_OFFSET))
    }

    pub fn set_total_bytes(&self, total_bytes: i32) {
        self.mem
            .write_i32(total_bytes, &mut MemoryOffset::new(TOTAL_BYTES_OFFSET));
    }

    pub fn schema_hash(&self) -> HashValue {
        let mut pos = MemoryOffset::new(SCHEMA_HASH_OFFSET);
        HashValue::new(
            self.mem.read_u64(&mut pos),
            self.mem.read_u64(&mut pos),
            self.mem.read_u64(&mut pos),
            self.mem.read_u64(&mut pos),
        )
    }

    pub fn set_schema_hash(&self, hash: HashValue) {
        let mut pos = MemoryOffset::new(SCHEMA_HASH_OFFSET);
        for word in [hash.value0, hash.value1, hash.value2, hash.value3] {
            self.mem.write_u64(word, &mut pos);
        }
    }

    pub fn base_timestamp(&self) -> u64 {
        u64::from_le(self.atomic_u64(BASE_TIMESTAMP_OFFSET).load(Ordering::Acquire))
    }

    pub fn set_base_timestamp(&self, base_timestamp_us: u64) {
        self.atomic_u64(BASE_TIMESTAMP_OFFSET)
            .store(base_timestamp_us.to_le(), Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.base_timestamp() != 0
    }

    pub fn last_changelog_id(&self) -> i32 {
        u32::from_le(self.atomic_u32(LAST_CHANGELOG_ID_OFFSET).load(Ordering::Acquire)) as i32
    }

    pub fn set_last_changelog_id(&self, id: i32) {
        self.atomic_u32(LAST_CHANGELOG_ID_OFFSET)
            .store((id as u32).to_le(), Ordering::Release);
    }

    pub fn last_update_age(&self) -> u32 {
        u32::from_le(self.atomic_u32(LAST_UPDATE_AGE_OFFSET).load(Ordering::Acquire))
    }

    pub fn set_last_update_age(&self, age_us: u32) {
        self.atomic_u32(LAST_UPDATE_AGE_OFFSET)
            .store(age_us.to_le(), Ordering::Release);
    }

    /// Record `now_us` as the time of the latest update.
    pub fn stamp_update(&self, now_us: u64) {
        let since_base = now_us.wrapping_sub(self.base_timestamp()) as u32;
        self.set_last_update_age(since_base);
    }

    /// Microseconds since the latest update.
    ///
    /// The age field is 32 bits of µs, so this wraps every ~71 minutes; a
    /// segment idle for longer can look fresh again.
    pub fn age_us(&self, now_us: u64) -> u32 {
        let since_base = now_us.wrapping_sub(self.base_timestamp()) as u32;
        since_base.wrapping_sub(self.last_update_age())
    }

    /// Zero every field. The base timestamp goes first so lock-free readers
    /// see "not initialized" before anything else changes.
    pub fn clear(&self) {
        self.set_base_timestamp(0);
        self.mem.slice(0, BASE_TIMESTAMP_OFFSET).fill(0);
        self.set_last_changelog_id(0);
        self.set_last_update_age(0);
    }
}
