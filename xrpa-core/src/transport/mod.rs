// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transports: a changelog in a shared region plus the lock around it.
//!
//! All mutation happens inside [`TransportStream::transact`]. The only
//! lock-free operations are header peeks, which can say "something might
//! have changed" and nothing more.

mod accessor;
pub mod events;
mod header;
mod heap;
mod iterator;
mod shared;
mod stream;

use std::time::Duration;

use crate::types::TransportConfig;

pub use accessor::TransportStreamAccessor;
pub use events::{
    ChangeEventAccessor, ChangeEventKind, ChangeType, CollectionChangeEvent,
    CollectionChangeEventAccessor, CollectionMessageChangeEventAccessor,
    CollectionUpdateChangeEventAccessor,
};
pub use header::{
    version_major, TransportHeader, TRANSPORT_VERSION, TRANSPORT_VERSION_MAJOR,
    TRANSPORT_VERSION_MINOR,
};
pub use iterator::TransportStreamIterator;
pub use shared::segment_name;
pub use stream::{MemoryTransportStream, EXPIRE_TIME, HEARTBEAT_INTERVAL};

/// Header fields readable without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportPeek {
    pub base_timestamp_us: u64,
    pub last_changelog_id: i32,
    pub last_update_age_us: u32,
}

/// What reconcilers need from a transport.
pub trait TransportStream: Send + Sync {
    /// Run `f` with the lock held. `false` when the lock was not acquired
    /// within `timeout` or the segment is unusable; try again next tick.
    fn transact(
        &self,
        timeout: Duration,
        f: &mut dyn FnMut(&mut TransportStreamAccessor<'_>),
    ) -> bool;

    /// A fresh reader positioned before the first entry.
    fn create_iterator(&self) -> TransportStreamIterator {
        TransportStreamIterator::new()
    }

    /// Lock-free header snapshot, `None` while the segment is not initialized.
    fn peek(&self) -> Option<TransportPeek>;

    /// True when nothing was written for longer than the heartbeat interval.
    fn needs_heartbeat(&self) -> bool;

    fn is_ready(&self) -> bool;

    fn config(&self) -> &TransportConfig;
}
