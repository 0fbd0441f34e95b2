// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Reconciled objects and the helpers their implementations share.
//!
//! Field payload convention: fields are identified by single bits of a
//! 64-bit mask and serialized in ascending bit order. A create record
//! carries every field of the type; an update record carries exactly the
//! fields in its changed mask.

use std::collections::HashMap;

use crate::reconciler::ObjectHandle;
use crate::shm::{MemoryAccessor, MemoryOffset};
use crate::transport::{ChangeEventKind, TransportStreamAccessor};
use crate::types::ObjectUuid;

/// A process-local entity bound to one id in one collection.
///
/// Every method except [`id`](Self::id) has a no-op default, so an object
/// only implements what its collection flavor needs.
pub trait ReconciledObject: 'static {
    /// Mask of every field the type serializes.
    const ALL_FIELDS: u64;

    fn id(&self) -> ObjectUuid;

    /// Apply inbound field values. Mirrored collections only.
    fn process_update(&mut self, _update: &mut ObjectUpdate<'_>) {}

    /// The object is leaving its collection.
    fn process_delete(&mut self) {}

    fn process_message(&mut self, _message_type: i32, _timestamp_us: u64, _data: MemoryAccessor<'_>) {}

    /// Periodic work, once per outbound tick.
    fn tick(&mut self) {}

    /// Handle for requesting writes and sending messages.
    fn bind_outbound(&mut self, _handle: ObjectHandle) {}

    /// Serialize pending state into the outbound changelog. Locally owned
    /// collections only.
    fn write_changes(&mut self, _acc: &mut TransportStreamAccessor<'_>, _collection_id: i32) {}

    /// Mark the whole object for rewriting as a create.
    fn prep_full_update(&mut self) {}
}

/// Sequential reader over the field payload of a create or update record.
#[derive(Debug)]
pub struct ObjectUpdate<'a> {
    data: MemoryAccessor<'a>,
    pos: MemoryOffset,
    fields_present: u64,
    fields_changed: u64,
}

impl<'a> ObjectUpdate<'a> {
    /// `fields_present` describes the payload layout, `fields_changed` the
    /// subset the receiver applies.
    pub fn new(data: MemoryAccessor<'a>, fields_present: u64, fields_changed: u64) -> Self {
        Self {
            data,
            pos: MemoryOffset::default(),
            fields_present,
            fields_changed: fields_changed & fields_present,
        }
    }

    pub fn fields_changed(&self) -> u64 {
        self.fields_changed
    }

    pub fn has_changed(&self, field: u64) -> bool {
        self.fields_changed & field != 0
    }

    /// Read the next field. Must be called for every field of the type in
    /// ascending bit order; returns `Some` only for applied fields.
    pub fn read_field<V>(
        &mut self,
        field: u64,
        read: impl FnOnce(&MemoryAccessor<'a>, &mut MemoryOffset) -> V,
    ) -> Option<V> {
        if self.fields_present & field == 0 {
            return None;
        }
        let value = read(&self.data, &mut self.pos);
        if self.fields_changed & field != 0 {
            Some(value)
        } else {
            None
        }
    }
}

type FieldsChangedHandler = Box<dyn FnMut(u64)>;
type DeleteHandler = Box<dyn FnMut()>;
type MessageHandler = Box<dyn FnMut(u64, MemoryAccessor<'_>)>;

/// Application callbacks attached to an object. Unset handlers are no-ops.
#[derive(Default)]
pub struct ObjectHandlers {
    on_fields_changed: Option<FieldsChangedHandler>,
    on_delete: Option<DeleteHandler>,
    on_message: HashMap<i32, MessageHandler>,
}

impl ObjectHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fields_changed(&mut self, handler: impl FnMut(u64) + 'static) {
        self.on_fields_changed = Some(Box::new(handler));
    }

    pub fn on_delete(&mut self, handler: impl FnMut() + 'static) {
        self.on_delete = Some(Box::new(handler));
    }

    pub fn on_message(
        &mut self,
        message_type: i32,
        handler: impl FnMut(u64, MemoryAccessor<'_>) + 'static,
    ) {
        self.on_message.insert(message_type, Box::new(handler));
    }

    pub fn notify_fields_changed(&mut self, fields_changed: u64) {
        if fields_changed == 0 {
            return;
        }
        if let Some(handler) = &mut self.on_fields_changed {
            handler(fields_changed);
        }
    }

    pub fn notify_delete(&mut self) {
        if let Some(handler) = &mut self.on_delete {
            handler();
        }
    }

    /// Returns false when no handler is registered for `message_type`.
    pub fn dispatch_message(
        &mut self,
        message_type: i32,
        timestamp_us: u64,
        data: MemoryAccessor<'_>,
    ) -> bool {
        match self.on_message.get_mut(&message_type) {
            Some(handler) => {
                handler(timestamp_us, data);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ObjectHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut message_types: Vec<_> = self.on_message.keys().collect();
        message_types.sort();
        f.debug_struct("ObjectHandlers")
            .field("on_fields_changed", &self.on_fields_changed.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("message_types", &message_types)
            .finish()
    }
}

/// What a locally owned object still has to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectWriteState {
    create_pending: bool,
    dirty_fields: u64,
}

impl ObjectWriteState {
    /// State of a new object: the first write is a create.
    pub fn new() -> Self {
        Self {
            create_pending: true,
            dirty_fields: 0,
        }
    }

    pub fn mark_dirty(&mut self, fields: u64) {
        self.dirty_fields |= fields;
    }

    pub fn prep_full_update(&mut self) {
        self.create_pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.create_pending || self.dirty_fields != 0
    }

    /// Write a create (all fields) or an update (dirty fields) for `id`.
    ///
    /// `fields_size` returns the payload size of a mask and `write_fields`
    /// serializes a mask into the payload. State is only cleared when the
    /// record was allocated.
    pub fn write_changes(
        &mut self,
        acc: &mut TransportStreamAccessor<'_>,
        collection_id: i32,
        id: ObjectUuid,
        all_fields: u64,
        fields_size: impl Fn(u64) -> usize,
        write_fields: impl FnOnce(u64, MemoryAccessor<'_>),
    ) -> bool {
        if self.create_pending {
            let Some(event) = acc.write_create(collection_id, id, fields_size(all_fields)) else {
                return false;
            };
            write_fields(all_fields, event.access_change_data());
            self.create_pending = false;
            self.dirty_fields = 0;
            return true;
        }

        if self.dirty_fields != 0 {
            let fields = self.dirty_fields;
            let Some(event) = acc.write_update(collection_id, id, fields, fields_size(fields)) else {
                return false;
            };
            write_fields(fields, event.access_change_data());
            self.dirty_fields = 0;
            return true;
        }

        false
    }
}

impl Default for ObjectWriteState {
    fn default() -> Self {
        Self::new()
    }
}
