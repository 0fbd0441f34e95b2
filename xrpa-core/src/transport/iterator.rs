// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Reader position in a transport's changelog.

use crate::shm::PlacedRingBufferIterator;
use crate::transport::events::{ChangeEventAccessor, ChangeEventKind};
use crate::transport::{TransportStream, TransportStreamAccessor};

/// Per-reader cursor. Remembers which initialization of the segment it was
/// reading so that a writer recreating the segment is seen as lost entries
/// rather than as a continuation.
#[derive(Debug, Clone, Default)]
pub struct TransportStreamIterator {
    position: PlacedRingBufferIterator,
    generation: u64,
}

impl TransportStreamIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_read_id(&self) -> i32 {
        self.position.last_read_id()
    }

    /// Lock-free check for unread entries. Only a hint: the answer is
    /// re-validated under the lock.
    pub fn needs_processing(&self, stream: &dyn TransportStream) -> bool {
        match stream.peek() {
            Some(peek) => {
                let reinitialized =
                    self.generation != 0 && peek.base_timestamp_us != self.generation;
                reinitialized || peek.last_changelog_id != self.position.last_read_id()
            }
            _ => false,
        }
    }

    /// True when entries were evicted before this reader saw them, or the
    /// segment was reinitialized since the last read. Stays true until
    /// [`set_to_end`](Self::set_to_end).
    pub fn has_missed_entries(&mut self, acc: &TransportStreamAccessor<'_>) -> bool {
        if self.generation != acc.base_timestamp_us() {
            if self.generation != 0 {
                return true;
            }
            // first read: adopt the segment as found
            self.generation = acc.base_timestamp_us();
            self.position = PlacedRingBufferIterator::new();
        }
        self.position.has_missed_entries(acc.changelog())
    }

    /// Next unread record, or `None` when caught up or entries were missed.
    pub fn next<'a>(&mut self, acc: &TransportStreamAccessor<'a>) -> Option<ChangeEventAccessor<'a>> {
        if self.generation != acc.base_timestamp_us() {
            return None;
        }
        let mem = self.position.next(acc.changelog());
        if mem.is_null() {
            None
        } else {
            Some(ChangeEventAccessor::from_memory(mem))
        }
    }

    /// Acknowledge lost entries and continue from the newest one.
    pub fn set_to_end(&mut self, acc: &TransportStreamAccessor<'_>) {
        self.generation = acc.base_timestamp_us();
        self.position.set_to_end(acc.changelog());
    }
}
