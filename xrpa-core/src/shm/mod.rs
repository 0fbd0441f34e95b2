// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared memory building blocks.
//!
//! Typed byte views, file-backed and heap regions, the placed changelog and
//! the cross-process mutex that guards it.

mod accessor;
mod mutex;
mod region;
mod ring_buffer;

pub use accessor::{MemoryAccessor, MemoryOffset};
pub use mutex::{FileLockMutex, InterprocessLockGuard, InterprocessMutex, LocalMutex};
pub use region::{HeapRegion, MemoryRegion, SharedMemoryRegion};
pub use ring_buffer::{PlacedRingBuffer, PlacedRingBufferIterator};
