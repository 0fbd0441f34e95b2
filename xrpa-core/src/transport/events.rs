// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Typed views over change records stored in the changelog.
//!
//! Every record starts with `[i32 change_type][i32 timestamp]`. Collection
//! scoped records add the object id and collection id, updates add the
//! changed-field mask and messages add the message type. Each kind is a plain
//! struct with fixed offsets; the reader picks the kind from the tag.

use std::fmt;

use crate::shm::{MemoryAccessor, MemoryOffset};
use crate::types::ObjectUuid;

/// Tag stored in the first word of every change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ChangeType {
    RequestFullUpdate = 0,
    FullUpdate = 1,
    Shutdown = 2,
    CreateObject = 3,
    DeleteObject = 4,
    UpdateObject = 5,
    Message = 6,
}

impl ChangeType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RequestFullUpdate => "RequestFullUpdate",
            Self::FullUpdate => "FullUpdate",
            Self::Shutdown => "Shutdown",
            Self::CreateObject => "CreateObject",
            Self::DeleteObject => "DeleteObject",
            Self::UpdateObject => "UpdateObject",
            Self::Message => "Message",
        }
    }
}

impl TryFrom<i32> for ChangeType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::RequestFullUpdate,
            1 => Self::FullUpdate,
            2 => Self::Shutdown,
            3 => Self::CreateObject,
            4 => Self::DeleteObject,
            5 => Self::UpdateObject,
            6 => Self::Message,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

const CHANGE_TYPE_OFFSET: usize = 0;
const TIMESTAMP_OFFSET: usize = 4;
const OBJECT_ID_OFFSET: usize = 8;
const COLLECTION_ID_OFFSET: usize = 24;
const FIELDS_CHANGED_OFFSET: usize = 28;
const MESSAGE_TYPE_OFFSET: usize = 28;

/// Shared behavior of every record kind.
///
/// Record timestamps are millisecond offsets from the transport's base
/// timestamp.
pub trait ChangeEventKind<'a>: Sized {
    /// Bytes before the record's payload.
    const HEADER_SIZE: usize;

    fn from_memory(mem: MemoryAccessor<'a>) -> Self;

    fn memory(&self) -> MemoryAccessor<'a>;

    fn raw_change_type(&self) -> i32 {
        self.memory()
            .read_i32(&mut MemoryOffset::new(CHANGE_TYPE_OFFSET))
    }

    /// `None` for tags this build does not know.
    fn change_type(&self) -> Option<ChangeType> {
        ChangeType::try_from(self.raw_change_type()).ok()
    }

    fn set_change_type(&self, change_type: ChangeType) {
        self.memory().write_i32(
            change_type as i32,
            &mut MemoryOffset::new(CHANGE_TYPE_OFFSET),
        );
    }

    fn timestamp_offset_ms(&self) -> i32 {
        self.memory().read_i32(&mut MemoryOffset::new(TIMESTAMP_OFFSET))
    }

    fn set_timestamp_offset_ms(&self, offset_ms: i32) {
        self.memory()
            .write_i32(offset_ms, &mut MemoryOffset::new(TIMESTAMP_OFFSET));
    }

    /// Absolute record time in µs given the transport's base timestamp.
    fn timestamp_us(&self, base_timestamp_us: u64) -> u64 {
        let offset_us = self.timestamp_offset_ms() as i64 * 1000;
        base_timestamp_us.saturating_add_signed(offset_us)
    }

    fn set_timestamp_us(&self, timestamp_us: u64, base_timestamp_us: u64) {
        let offset_ms = (timestamp_us as i128 - base_timestamp_us as i128) / 1000;
        let offset_ms = offset_ms.clamp(i32::MIN as i128, i32::MAX as i128) as i32;
        self.set_timestamp_offset_ms(offset_ms);
    }

    /// Payload past this kind's header.
    fn access_change_data(&self) -> MemoryAccessor<'a> {
        self.memory().slice_from(Self::HEADER_SIZE)
    }
}

/// Records addressed to an object in a collection.
pub trait CollectionChangeEvent<'a>: ChangeEventKind<'a> {
    fn object_id(&self) -> ObjectUuid {
        self.memory()
            .read_uuid(&mut MemoryOffset::new(OBJECT_ID_OFFSET))
    }

    fn set_object_id(&self, id: ObjectUuid) {
        self.memory()
            .write_uuid(id, &mut MemoryOffset::new(OBJECT_ID_OFFSET));
    }

    fn collection_id(&self) -> i32 {
        self.memory()
            .read_i32(&mut MemoryOffset::new(COLLECTION_ID_OFFSET))
    }

    fn set_collection_id(&self, collection_id: i32) {
        self.memory()
            .write_i32(collection_id, &mut MemoryOffset::new(COLLECTION_ID_OFFSET));
    }
}

macro_rules! change_event_kind {
    ($(#[$meta:meta])* $name:ident, $header_size:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name<'a> {
            mem: MemoryAccessor<'a>,
        }

        impl<'a> ChangeEventKind<'a> for $name<'a> {
            const HEADER_SIZE: usize = $header_size;

            fn from_memory(mem: MemoryAccessor<'a>) -> Self {
                Self { mem }
            }

            fn memory(&self) -> MemoryAccessor<'a> {
                self.mem
            }
        }
    };
}

change_event_kind!(
    /// Marker records: RequestFullUpdate, FullUpdate, Shutdown.
    ChangeEventAccessor,
    8
);

change_event_kind!(
    /// CreateObject and DeleteObject records.
    CollectionChangeEventAccessor,
    28
);

change_event_kind!(
    /// UpdateObject records.
    CollectionUpdateChangeEventAccessor,
    36
);

change_event_kind!(
    /// Message records. The message type is followed by 4 bytes of padding.
    CollectionMessageChangeEventAccessor,
    36
);

impl<'a> CollectionChangeEvent<'a> for CollectionChangeEventAccessor<'a> {}
impl<'a> CollectionChangeEvent<'a> for CollectionUpdateChangeEventAccessor<'a> {}
impl<'a> CollectionChangeEvent<'a> for CollectionMessageChangeEventAccessor<'a> {}

impl CollectionUpdateChangeEventAccessor<'_> {
    pub fn fields_changed(&self) -> u64 {
        self.mem
            .read_u64(&mut MemoryOffset::new(FIELDS_CHANGED_OFFSET))
    }

    pub fn set_fields_changed(&self, fields_changed: u64) {
        self.mem
            .write_u64(fields_changed, &mut MemoryOffset::new(FIELDS_CHANGED_OFFSET));
    }
}

impl CollectionMessageChangeEventAccessor<'_> {
    pub fn message_type(&self) -> i32 {
        self.mem
            .read_i32(&mut MemoryOffset::new(MESSAGE_TYPE_OFFSET))
    }

    pub fn set_message_type(&self, message_type: i32) {
        self.mem
            .write_i32(message_type, &mut MemoryOffset::new(MESSAGE_TYPE_OFFSET));
    }
}

impl<'a> ChangeEventAccessor<'a> {
    /// Reinterpret this record as a larger kind after checking its tag.
    pub fn cast<K: ChangeEventKind<'a>>(&self) -> K {
        K::from_memory(self.mem)
    }
}
