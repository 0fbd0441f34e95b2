// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Work waiting for the next outbound tick.
//!
//! Object writes are coalesced: requesting a write for an object that is
//! already queued does nothing, since the object serializes its current
//! state at flush time. Message payloads live in a fixed-size arena that is
//! reset after every successful flush.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use crate::clock::Clock;
use crate::shm::{HeapRegion, MemoryAccessor, MemoryRegion};
use crate::transport::{ChangeEventKind, TransportStreamAccessor};
use crate::types::ObjectUuid;

#[derive(Debug, Clone, Copy)]
struct PendingMessage {
    collection_id: i32,
    object_id: ObjectUuid,
    message_type: i32,
    timestamp_us: u64,
    offset: usize,
    size: usize,
}

#[derive(Debug, Default)]
struct OutboundState {
    writes: Vec<(i32, ObjectUuid)>,
    queued: HashSet<(i32, ObjectUuid)>,
    messages: Vec<PendingMessage>,
    arena_used: usize,
    messages_dropped: u64,
}

/// Shared handle to the pending outbound work of one reconciler.
#[derive(Clone)]
pub struct OutboundQueue {
    state: Rc<RefCell<OutboundState>>,
    arena: Rc<HeapRegion>,
    clock: Arc<dyn Clock>,
}

impl OutboundQueue {
    pub fn new(message_pool_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Rc::new(RefCell::new(OutboundState::default())),
            arena: Rc::new(HeapRegion::new_zeroed(message_pool_bytes)),
            clock,
        }
    }

    /// Queue `id` to be written on the next flush.
    pub fn request_write(&self, collection_id: i32, id: ObjectUuid) {
        let mut state = self.state.borrow_mut();
        if state.queued.insert((collection_id, id)) {
            state.writes.push((collection_id, id));
        }
    }

    /// Reserve `num_bytes` for a message to `object_id`, stamped now.
    ///
    /// Returns the null accessor when the arena is exhausted; the message is
    /// dropped.
    pub fn send_message(
        &self,
        collection_id: i32,
        object_id: ObjectUuid,
        message_type: i32,
        num_bytes: usize,
    ) -> MemoryAccessor<'_> {
        let mut state = self.state.borrow_mut();
        let offset = state.arena_used;

        if offset + num_bytes > self.arena.size() {
            state.messages_dropped += 1;
            tracing::warn!(
                collection_id = collection_id,
                message_type = message_type,
                num_bytes = num_bytes,
                "Outbound message pool exhausted, dropping message"
            );
            return MemoryAccessor::null();
        }

        state.arena_used += num_bytes;
        state.messages.push(PendingMessage {
            collection_id,
            object_id,
            message_type,
            timestamp_us: self.clock.now_us(),
            offset,
            size: num_bytes,
        });

        self.arena.accessor().slice(offset, num_bytes)
    }

    pub fn has_pending(&self) -> bool {
        let state = self.state.borrow();
        !state.writes.is_empty() || !state.messages.is_empty()
    }

    pub fn pending_write_count(&self) -> usize {
        self.state.borrow().writes.len()
    }

    pub fn pending_message_count(&self) -> usize {
        self.state.borrow().messages.len()
    }

    pub fn messages_dropped(&self) -> u64 {
        self.state.borrow().messages_dropped
    }

    /// Queued writes in request order.
    pub fn pending_writes(&self) -> Vec<(i32, ObjectUuid)> {
        self.state.borrow().writes.clone()
    }

    /// Copy every queued message into the changelog. Returns how many were
    /// written.
    pub fn write_messages(&self, acc: &mut TransportStreamAccessor<'_>) -> usize {
        let state = self.state.borrow();
        let arena = self.arena.accessor();
        let mut written = 0;

        for message in &state.messages {
            match acc.write_message(
                message.collection_id,
                message.object_id,
                message.message_type,
                message.size,
                message.timestamp_us,
            ) {
                Some(event) => {
                    event
                        .access_change_data()
                        .copy_from(arena.slice(message.offset, message.size));
                    written += 1;
                }
                None => {
                    tracing::warn!(
                        collection_id = message.collection_id,
                        message_type = message.message_type,
                        size = message.size,
                        "Message does not fit in the outbound changelog, dropping"
                    );
                }
            }
        }

        written
    }

    /// Forget everything flushed by the last transaction and reset the arena.
    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.writes.clear();
        state.queued.clear();
        state.messages.clear();
        state.arena_used = 0;
    }
}

/// Lets a reconciled object ask for its own write or send messages.
#[derive(Clone)]
pub struct ObjectHandle {
    queue: OutboundQueue,
    collection_id: i32,
    id: ObjectUuid,
}

impl ObjectHandle {
    pub fn new(queue: OutboundQueue, collection_id: i32, id: ObjectUuid) -> Self {
        Self {
            queue,
            collection_id,
            id,
        }
    }

    pub fn id(&self) -> ObjectUuid {
        self.id
    }

    pub fn collection_id(&self) -> i32 {
        self.collection_id
    }

    /// Serialize this object on the next outbound tick.
    pub fn request_write(&self) {
        self.queue.request_write(self.collection_id, self.id);
    }

    pub fn send_message(&self, message_type: i32, num_bytes: usize) -> MemoryAccessor<'_> {
        self.queue
            .send_message(self.collection_id, self.id, message_type, num_bytes)
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("collection_id", &self.collection_id)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shm::MemoryOffset;

    fn queue(pool: usize) -> OutboundQueue {
        OutboundQueue::new(pool, Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_writes_are_coalesced() {
        let queue = queue(256);
        let a = ObjectUuid::new(0, 1);
        let b = ObjectUuid::new(0, 2);

        queue.request_write(1, a);
        queue.request_write(1, b);
        queue.request_write(1, a);
        // same id in another collection is a separate write
        queue.request_write(2, a);

        assert_eq!(queue.pending_writes(), vec![(1, a), (1, b), (2, a)]);
        queue.clear();
        assert!(!queue.has_pending());
        queue.request_write(1, a);
        assert_eq!(queue.pending_write_count(), 1);
    }

    #[test]
    fn test_message_pool_exhaustion() {
        let queue = queue(256);
        let id = ObjectUuid::new(0, 1);

        let first = queue.send_message(1, id, 0, 200);
        assert_eq!(first.size(), 200);
        let second = queue.send_message(1, id, 0, 100);
        assert!(second.is_null());
        assert_eq!(queue.messages_dropped(), 1);
        assert_eq!(queue.pending_message_count(), 1);

        queue.clear();
        assert!(!queue.send_message(1, id, 0, 100).is_null());
    }

    #[test]
    fn test_handle_targets_its_object() {
        let queue = queue(256);
        let handle = ObjectHandle::new(queue.clone(), 4, ObjectUuid::new(9, 9));

        handle.request_write();
        let payload = handle.send_message(2, 4);
        payload.write_i32(17, &mut MemoryOffset::new(0));

        assert_eq!(queue.pending_writes(), vec![(4, ObjectUuid::new(9, 9))]);
        assert_eq!(queue.pending_message_count(), 1);
    }
}
