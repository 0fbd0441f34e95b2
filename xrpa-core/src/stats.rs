// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

use serde::{Deserialize, Serialize};

/// Counters kept by a reconciler over its lifetime.
/// Serializable so hosts can export them however they like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerStats {
    /// Records read from the inbound changelog.
    pub inbound_events: u64,
    /// Records written to the outbound changelog.
    pub outbound_events: u64,
    pub messages_sent: u64,
    /// Inbound messages older than the message lifetime.
    pub stale_messages_dropped: u64,
    /// Outbound messages refused because the message pool was full.
    pub pool_messages_dropped: u64,
    pub full_updates_sent: u64,
    pub full_updates_received: u64,
    pub full_update_requests_sent: u64,
    /// Times the inbound reader fell behind the writer.
    pub missed_entry_events: u64,
    /// Transactions abandoned because the lock was busy or the transport
    /// was not usable.
    pub lock_timeouts: u64,
}
