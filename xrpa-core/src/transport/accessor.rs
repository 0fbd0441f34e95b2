// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Write side of a transaction on a transport.

use crate::shm::{MemoryAccessor, PlacedRingBuffer};
use crate::transport::events::{
    ChangeEventAccessor, ChangeEventKind, ChangeType, CollectionChangeEvent,
    CollectionChangeEventAccessor, CollectionMessageChangeEventAccessor,
    CollectionUpdateChangeEventAccessor,
};
use crate::transport::TransportHeader;
use crate::types::ObjectUuid;

/// Handed to the closure passed to `transact`; valid only while the lock is
/// held.
#[derive(Debug)]
pub struct TransportStreamAccessor<'a> {
    header: TransportHeader<'a>,
    changelog: PlacedRingBuffer<'a>,
    base_timestamp_us: u64,
    now_us: u64,
    events_written: u32,
}

impl<'a> TransportStreamAccessor<'a> {
    pub(crate) fn new(
        header: TransportHeader<'a>,
        changelog: PlacedRingBuffer<'a>,
        now_us: u64,
    ) -> Self {
        Self {
            base_timestamp_us: header.base_timestamp(),
            header,
            changelog,
            now_us,
            events_written: 0,
        }
    }

    pub fn changelog(&self) -> &PlacedRingBuffer<'a> {
        &self.changelog
    }

    /// Identifies the current initialization of the segment.
    pub fn base_timestamp_us(&self) -> u64 {
        self.base_timestamp_us
    }

    /// Time the transaction started.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn events_written(&self) -> u32 {
        self.events_written
    }

    /// Push a changelog element and publish its id in the header.
    fn allocate(&mut self, num_bytes: usize) -> MemoryAccessor<'a> {
        let (mem, id) = self.changelog.push(num_bytes);
        if !mem.is_null() {
            self.header.set_last_changelog_id(id);
            self.events_written += 1;
        }
        mem
    }

    /// Allocate a record of kind `K` with `extra_bytes` of payload.
    ///
    /// `timestamp_us` of 0 stamps the transaction time. `None` when the record
    /// cannot fit in the changelog.
    pub fn write_change_event<K: ChangeEventKind<'a>>(
        &mut self,
        change_type: ChangeType,
        extra_bytes: usize,
        timestamp_us: u64,
    ) -> Option<K> {
        let mem = self.allocate(K::HEADER_SIZE + extra_bytes);
        if mem.is_null() {
            return None;
        }

        let event = K::from_memory(mem);
        event.set_change_type(change_type);
        let timestamp_us = if timestamp_us == 0 {
            self.now_us
        } else {
            timestamp_us
        };
        event.set_timestamp_us(timestamp_us, self.base_timestamp_us);
        Some(event)
    }

    /// Write a payload-less marker (RequestFullUpdate, FullUpdate, Shutdown).
    pub fn write_marker(&mut self, change_type: ChangeType) -> bool {
        self.write_change_event::<ChangeEventAccessor>(change_type, 0, 0)
            .is_some()
    }

    /// Create record for `id`; the caller fills `num_bytes` of field data.
    pub fn write_create(
        &mut self,
        collection_id: i32,
        id: ObjectUuid,
        num_bytes: usize,
    ) -> Option<CollectionChangeEventAccessor<'a>> {
        let event = self.write_change_event::<CollectionChangeEventAccessor>(
            ChangeType::CreateObject,
            num_bytes,
            0,
        )?;
        event.set_object_id(id);
        event.set_collection_id(collection_id);
        Some(event)
    }

    pub fn write_update(
        &mut self,
        collection_id: i32,
        id: ObjectUuid,
        fields_changed: u64,
        num_bytes: usize,
    ) -> Option<CollectionUpdateChangeEventAccessor<'a>> {
        let event = self.write_change_event::<CollectionUpdateChangeEventAccessor>(
            ChangeType::UpdateObject,
            num_bytes,
            0,
        )?;
        event.set_object_id(id);
        event.set_collection_id(collection_id);
        event.set_fields_changed(fields_changed);
        Some(event)
    }

    pub fn write_delete(&mut self, collection_id: i32, id: ObjectUuid) -> bool {
        match self.write_change_event::<CollectionChangeEventAccessor>(
            ChangeType::DeleteObject,
            0,
            0,
        ) {
            Some(event) => {
                event.set_object_id(id);
                event.set_collection_id(collection_id);
                true
            }
            None => false,
        }
    }

    pub fn write_message(
        &mut self,
        collection_id: i32,
        id: ObjectUuid,
        message_type: i32,
        num_bytes: usize,
        timestamp_us: u64,
    ) -> Option<CollectionMessageChangeEventAccessor<'a>> {
        let event = self.write_change_event::<CollectionMessageChangeEventAccessor>(
            ChangeType::Message,
            num_bytes,
            timestamp_us,
        )?;
        event.set_object_id(id);
        event.set_collection_id(collection_id);
        event.set_message_type(message_type);
        Some(event)
    }
}
