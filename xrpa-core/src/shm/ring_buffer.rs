// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Circular changelog placed at a fixed offset of a shared region.
//!
//! Elements are variable-size, prefixed by a 4-byte length and laid out on
//! 4-byte boundaries. Every push gets the next ID of a monotonic sequence.
//! When a push does not fit, the oldest elements are evicted first: a slow
//! reader loses entries instead of blocking the writer, and finds out via
//! [`PlacedRingBufferIterator::has_missed_entries`].
//!
//! Layout:
//! ```text
//! [i32 pool_size][i32 count][i32 start_id][i32 start_offset]
//! [i32 last_elem_offset][i32 prewrap_offset][pool_size bytes of elements]
//! ```
//! Live elements occupy `[start_offset, prewrap_offset)` and, once wrapped,
//! `[0, last_elem_end)`.
//!
//! All mutation must happen under the transport mutex.

use crate::shm::{MemoryAccessor, MemoryOffset};

/// Size of the props block in bytes.
const PROPS_SIZE: usize = 24;

/// Size of each element's length prefix.
const ELEMENT_HEADER_SIZE: usize = 4;

/// Alignment for elements (4 bytes).
const ELEMENT_ALIGNMENT: usize = 4;

const POOL_SIZE_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const START_ID_OFFSET: usize = 8;
const START_OFFSET_OFFSET: usize = 12;
const LAST_ELEM_OFFSET_OFFSET: usize = 16;
const PREWRAP_OFFSET_OFFSET: usize = 20;

/// View over a changelog placed in shared memory.
#[derive(Debug, Clone, Copy)]
pub struct PlacedRingBuffer<'a> {
    props: MemoryAccessor<'a>,
    pool: MemoryAccessor<'a>,
}

impl<'a> PlacedRingBuffer<'a> {
    /// Bytes needed to place a changelog with a pool of `pool_size` bytes.
    pub const fn get_mem_size(pool_size: usize) -> usize {
        PROPS_SIZE + pool_size
    }

    /// Bind to `mem`. Call [`init`](Self::init) once if the memory is fresh.
    pub fn new(mem: MemoryAccessor<'a>) -> Self {
        Self {
            props: mem.slice(0, PROPS_SIZE),
            pool: mem.slice_from(PROPS_SIZE),
        }
    }

    /// Reset to an empty changelog with a pool of `pool_size` bytes.
    pub fn init(&self, pool_size: usize) {
        assert!(
            pool_size <= self.pool.size(),
            "changelog pool of {} bytes does not fit in {} bytes",
            pool_size,
            self.pool.size()
        );
        self.set_prop(POOL_SIZE_OFFSET, pool_size as i32);
        self.set_prop(COUNT_OFFSET, 0);
        self.set_prop(START_ID_OFFSET, 0);
        self.set_prop(START_OFFSET_OFFSET, 0);
        self.set_prop(LAST_ELEM_OFFSET_OFFSET, 0);
        self.set_prop(PREWRAP_OFFSET_OFFSET, pool_size as i32);
    }

    fn prop(&self, offset: usize) -> i32 {
        self.props.read_i32(&mut MemoryOffset::new(offset))
    }

    fn set_prop(&self, offset: usize, value: i32) {
        self.props.write_i32(value, &mut MemoryOffset::new(offset));
    }

    pub fn pool_size(&self) -> usize {
        self.prop(POOL_SIZE_OFFSET) as usize
    }

    /// Number of live elements.
    pub fn count(&self) -> i32 {
        self.prop(COUNT_OFFSET)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// ID of the oldest live element.
    pub fn start_id(&self) -> i32 {
        self.prop(START_ID_OFFSET)
    }

    /// ID of the newest element ever pushed (`start_id - 1` when empty).
    pub fn max_id(&self) -> i32 {
        self.start_id() + self.count() - 1
    }

    fn start_offset(&self) -> usize {
        self.prop(START_OFFSET_OFFSET) as usize
    }

    fn last_elem_offset(&self) -> usize {
        self.prop(LAST_ELEM_OFFSET_OFFSET) as usize
    }

    fn prewrap_offset(&self) -> usize {
        self.prop(PREWRAP_OFFSET_OFFSET) as usize
    }

    /// Payload length recorded at `offset`, validated against the pool.
    fn element_size_at(&self, offset: usize) -> usize {
        let size = self.pool.read_i32(&mut MemoryOffset::new(offset));
        assert!(
            size >= 0 && offset + ELEMENT_HEADER_SIZE + size as usize <= self.pool_size(),
            "malformed changelog element at offset {}: size {}",
            offset,
            size
        );
        size as usize
    }

    fn element_end(&self, offset: usize) -> usize {
        offset + ELEMENT_HEADER_SIZE + align_up(self.element_size_at(offset))
    }

    fn payload_at(&self, offset: usize) -> MemoryAccessor<'a> {
        let size = self.element_size_at(offset);
        self.pool.slice(offset + ELEMENT_HEADER_SIZE, size)
    }

    /// Offset of the element following the one at `offset`.
    pub fn get_next_offset(&self, offset: usize) -> usize {
        let next = self.element_end(offset);
        if next >= self.prewrap_offset() {
            0
        } else {
            next
        }
    }

    /// Allocate an element of `num_bytes`, evicting the oldest as needed.
    ///
    /// Returns the payload accessor and the assigned ID, or a null accessor
    /// and `-1` when the element can never fit in the pool.
    pub fn push(&self, num_bytes: usize) -> (MemoryAccessor<'a>, i32) {
        let pool_size = self.pool_size();
        let total = ELEMENT_HEADER_SIZE + align_up(num_bytes);

        if total >= pool_size {
            tracing::error!(
                num_bytes = num_bytes,
                pool_size = pool_size,
                "Changelog element does not fit in the pool"
            );
            return (MemoryAccessor::null(), -1);
        }

        // Once every element is evicted the pool is empty and must fit.
        let mut evictions_left = self.count();
        let offset = loop {
            if let Some(offset) = self.find_free_offset(total) {
                break offset;
            }
            if evictions_left <= 0 || self.shift().is_null() {
                tracing::error!(
                    num_bytes = num_bytes,
                    count = self.count(),
                    "Changelog has no free space after evicting every element"
                );
                return (MemoryAccessor::null(), -1);
            }
            evictions_left -= 1;
        };

        self.pool
            .write_i32(num_bytes as i32, &mut MemoryOffset::new(offset));

        let count = self.count() + 1;
        self.set_prop(COUNT_OFFSET, count);
        self.set_prop(LAST_ELEM_OFFSET_OFFSET, offset as i32);

        let id = self.start_id() + count - 1;
        (self.pool.slice(offset + ELEMENT_HEADER_SIZE, num_bytes), id)
    }

    fn find_free_offset(&self, total: usize) -> Option<usize> {
        if self.is_empty() {
            // offsets were reset when the last element left
            return Some(0);
        }

        let start = self.start_offset();
        let last = self.last_elem_offset();
        let tail_end = self.element_end(last);

        if start <= last {
            if tail_end + total <= self.pool_size() {
                return Some(tail_end);
            }
            if total <= start {
                self.set_prop(PREWRAP_OFFSET_OFFSET, tail_end as i32);
                return Some(0);
            }
            None
        } else if tail_end + total <= start {
            Some(tail_end)
        } else {
            None
        }
    }

    /// Remove the oldest element. Returns null when already empty.
    pub fn shift(&self) -> MemoryAccessor<'a> {
        let count = self.count();
        if count <= 0 {
            return MemoryAccessor::null();
        }

        let start = self.start_offset();
        let removed = self.payload_at(start);
        let next = self.element_end(start);

        let count = count - 1;
        self.set_prop(COUNT_OFFSET, count);
        self.set_prop(START_ID_OFFSET, self.start_id() + 1);

        if count == 0 {
            self.set_prop(START_OFFSET_OFFSET, 0);
            self.set_prop(LAST_ELEM_OFFSET_OFFSET, 0);
            self.set_prop(PREWRAP_OFFSET_OFFSET, self.pool_size() as i32);
        } else if next >= self.prewrap_offset() {
            self.set_prop(START_OFFSET_OFFSET, 0);
            self.set_prop(PREWRAP_OFFSET_OFFSET, self.pool_size() as i32);
        } else {
            self.set_prop(START_OFFSET_OFFSET, next as i32);
        }

        removed
    }

    /// Element at `index` positions after the oldest. O(index).
    pub fn get_at(&self, index: i32) -> MemoryAccessor<'a> {
        if index < 0 || index >= self.count() {
            return MemoryAccessor::null();
        }
        let mut offset = self.start_offset();
        for _ in 0..index {
            offset = self.get_next_offset(offset);
        }
        self.payload_at(offset)
    }

    pub fn get_by_id(&self, id: i32) -> MemoryAccessor<'a> {
        if id < self.start_id() {
            return MemoryAccessor::null();
        }
        self.get_at(id - self.start_id())
    }

    /// Index of a live ID; 0 for IDs that are evicted or not yet assigned.
    pub fn get_index_for_id(&self, id: i32) -> i32 {
        if id < self.start_id() || id > self.max_id() {
            0
        } else {
            id - self.start_id()
        }
    }
}

/// Reader position in a [`PlacedRingBuffer`].
///
/// Holds no reference to the buffer so it can outlive a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedRingBufferIterator {
    last_read_id: i32,
    last_read_offset: usize,
}

impl Default for PlacedRingBufferIterator {
    fn default() -> Self {
        Self {
            last_read_id: -1,
            last_read_offset: 0,
        }
    }
}

impl PlacedRingBufferIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_read_id(&self) -> i32 {
        self.last_read_id
    }

    pub fn has_next(&self, ring: &PlacedRingBuffer<'_>) -> bool {
        self.last_read_id < ring.max_id()
    }

    /// True when the next element this iterator expects was already evicted.
    pub fn has_missed_entries(&self, ring: &PlacedRingBuffer<'_>) -> bool {
        self.last_read_id < ring.start_id() - 1
    }

    /// Advance to the next element. Null when there is none or entries were
    /// missed (callers check [`has_missed_entries`](Self::has_missed_entries)).
    pub fn next<'a>(&mut self, ring: &PlacedRingBuffer<'a>) -> MemoryAccessor<'a> {
        if !self.has_next(ring) || self.has_missed_entries(ring) {
            return MemoryAccessor::null();
        }

        let next_id = self.last_read_id + 1;
        let offset = if next_id == ring.start_id() {
            ring.start_offset()
        } else {
            ring.get_next_offset(self.last_read_offset)
        };

        self.last_read_id = next_id;
        self.last_read_offset = offset;
        ring.payload_at(offset)
    }

    /// Skip everything currently in the buffer.
    pub fn set_to_end(&mut self, ring: &PlacedRingBuffer<'_>) {
        self.last_read_id = ring.max_id();
        self.last_read_offset = if ring.is_empty() {
            0
        } else {
            ring.last_elem_offset()
        };
    }
}

/// Align value up to the element alignment.
const fn align_up(value: usize) -> usize {
    (value + ELEMENT_ALIGNMENT - 1) & !(ELEMENT_ALIGNMENT - 1)
}
