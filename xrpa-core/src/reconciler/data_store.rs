// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! The reconciler: drives collections from an inbound transport and writes
//! their changes to an outbound transport.
//!
//! Both directions are tick-driven from one thread. A tick that has nothing
//! to do never takes a lock: inbound work is detected from the header
//! lock-free, outbound work from the local queue and the heartbeat age.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::ReconcilerSettings;
use crate::error::CollectionError;
use crate::reconciler::{
    CollectionHandler, FullUpdateState, FullUpdateStateMachine, OutboundQueue,
};
use crate::shm::MemoryAccessor;
use crate::stats::ReconcilerStats;
use crate::transport::{
    ChangeEventAccessor, ChangeEventKind, ChangeType, CollectionChangeEvent,
    CollectionChangeEventAccessor, CollectionMessageChangeEventAccessor,
    CollectionUpdateChangeEventAccessor, TransportStream, TransportStreamAccessor,
    TransportStreamIterator,
};
use crate::types::ObjectUuid;

/// Ids named by a full update, per collection.
type ReconciledIds = HashMap<i32, HashSet<ObjectUuid>>;

/// Keeps a set of collections in sync with a peer through a pair of
/// transports. Either direction may be absent.
///
/// Not `Send`: collections are shared with the application through
/// `Rc<RefCell<_>>`. Handlers run while their collection is borrowed and
/// must not borrow it again.
pub struct DataStoreReconciler {
    inbound: Option<Arc<dyn TransportStream>>,
    outbound: Option<Arc<dyn TransportStream>>,
    inbound_iter: TransportStreamIterator,
    collections: BTreeMap<i32, Rc<RefCell<dyn CollectionHandler>>>,
    queue: OutboundQueue,
    sync_state: FullUpdateStateMachine,
    pending_outbound_full_update: bool,
    settings: ReconcilerSettings,
    stats: ReconcilerStats,
    is_shutdown: bool,
}

impl DataStoreReconciler {
    /// The first outbound tick announces a full update so that a reader
    /// holding objects from an earlier writer drops the ones this writer no
    /// longer has.
    pub fn new(
        inbound: Option<Arc<dyn TransportStream>>,
        outbound: Option<Arc<dyn TransportStream>>,
        settings: ReconcilerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inbound_iter = inbound
            .as_ref()
            .map(|stream| stream.create_iterator())
            .unwrap_or_default();
        Self {
            inbound,
            outbound,
            inbound_iter,
            collections: BTreeMap::new(),
            queue: OutboundQueue::new(settings.outbound_message_pool_bytes, clock),
            sync_state: FullUpdateStateMachine::new(),
            pending_outbound_full_update: true,
            settings,
            stats: ReconcilerStats::default(),
            is_shutdown: false,
        }
    }

    /// Add a collection. Its objects get handles onto this reconciler's
    /// outbound queue.
    pub fn register_collection<C>(&mut self, collection: Rc<RefCell<C>>) -> Result<(), CollectionError>
    where
        C: CollectionHandler + 'static,
    {
        let collection_id = collection.borrow().collection_id();
        if self.collections.contains_key(&collection_id) {
            return Err(CollectionError::AlreadyRegistered { collection_id });
        }
        collection.borrow_mut().bind_outbound(self.queue.clone());
        self.collections.insert(collection_id, collection);
        tracing::debug!(collection_id = collection_id, "Registered collection");
        Ok(())
    }

    pub fn full_update_state(&self) -> FullUpdateState {
        self.sync_state.state()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            pool_messages_dropped: self.queue.messages_dropped(),
            ..self.stats.clone()
        }
    }

    /// Reserve a message to `object_id`, sent on the next outbound tick.
    /// The null accessor means the message was dropped.
    pub fn send_message(
        &self,
        object_id: ObjectUuid,
        collection_id: i32,
        message_type: i32,
        num_bytes: usize,
    ) -> MemoryAccessor<'_> {
        if self.is_shutdown || self.outbound.is_none() {
            return MemoryAccessor::null();
        }
        self.queue
            .send_message(collection_id, object_id, message_type, num_bytes)
    }

    /// Apply everything the peer wrote since the last tick.
    pub fn tick_inbound(&mut self) {
        if self.is_shutdown {
            return;
        }
        let Some(inbound) = self.inbound.clone() else {
            return;
        };
        if !self.inbound_iter.needs_processing(inbound.as_ref()) {
            return;
        }

        let timeout = self.settings.lock_timeout;
        let mut reconciled: Option<ReconciledIds> = None;
        let ok = inbound.transact(timeout, &mut |acc| self.drain_inbound(acc, &mut reconciled));
        if !ok {
            self.stats.lock_timeouts += 1;
            tracing::debug!("Inbound transport busy, retrying next tick");
            return;
        }

        if let Some(reconciled) = reconciled {
            let empty = HashSet::new();
            for (collection_id, collection) in &self.collections {
                let mut collection = collection.borrow_mut();
                if !collection.is_local_owned() {
                    collection.process_full_reconcile(reconciled.get(collection_id).unwrap_or(&empty));
                }
            }
        }
    }

    fn drain_inbound(&mut self, acc: &TransportStreamAccessor<'_>, reconciled: &mut Option<ReconciledIds>) {
        if self.inbound_iter.has_missed_entries(acc) {
            tracing::warn!(
                last_read_id = self.inbound_iter.last_read_id(),
                "Inbound changelog overflowed, requesting full update"
            );
            self.stats.missed_entry_events += 1;
            self.inbound_iter.set_to_end(acc);
            self.transition(FullUpdateState::Requested);
            return;
        }

        while let Some(event) = self.inbound_iter.next(acc) {
            self.stats.inbound_events += 1;
            self.dispatch(acc, event, reconciled);
        }
    }

    fn dispatch(
        &mut self,
        acc: &TransportStreamAccessor<'_>,
        event: ChangeEventAccessor<'_>,
        reconciled: &mut Option<ReconciledIds>,
    ) {
        let Some(change_type) = event.change_type() else {
            tracing::warn!(change_type = event.raw_change_type(), "Unknown change type skipped");
            return;
        };

        match change_type {
            ChangeType::RequestFullUpdate => {
                self.pending_outbound_full_update = true;
                return;
            }
            ChangeType::FullUpdate => {
                self.transition(FullUpdateState::NotRequested);
                self.stats.full_updates_received += 1;
                *reconciled = Some(ReconciledIds::new());
                return;
            }
            ChangeType::Shutdown => {
                for collection in self.collections.values() {
                    let mut collection = collection.borrow_mut();
                    if !collection.is_local_owned() {
                        collection.process_shutdown();
                    }
                }
                return;
            }
            _ if self.sync_state.state().is_discarding() => return,
            _ => {}
        }

        let header = event.cast::<CollectionChangeEventAccessor>();
        let collection_id = header.collection_id();
        let object_id = header.object_id();
        let Some(collection) = self.collections.get(&collection_id) else {
            tracing::debug!(collection_id = collection_id, "Record for unknown collection skipped");
            return;
        };
        let mut collection = collection.borrow_mut();

        match change_type {
            ChangeType::CreateObject => {
                let upsert = match reconciled.as_mut() {
                    Some(ids) => {
                        ids.entry(collection_id).or_default().insert(object_id);
                        true
                    }
                    None => false,
                };
                collection.process_create(object_id, header.access_change_data(), upsert);
            }
            ChangeType::UpdateObject => {
                let event = event.cast::<CollectionUpdateChangeEventAccessor>();
                collection.process_update(object_id, event.access_change_data(), event.fields_changed());
            }
            ChangeType::DeleteObject => collection.process_delete(object_id),
            ChangeType::Message => {
                let event = event.cast::<CollectionMessageChangeEventAccessor>();
                let timestamp_us = event.timestamp_us(acc.base_timestamp_us());
                let age_us = acc.now_us().saturating_sub(timestamp_us);
                if age_us > self.settings.message_lifetime.as_micros() as u64 {
                    self.stats.stale_messages_dropped += 1;
                    tracing::debug!(
                        collection_id = collection_id,
                        message_type = event.message_type(),
                        age_us = age_us,
                        "Stale message dropped"
                    );
                    return;
                }
                collection.process_message(
                    object_id,
                    event.message_type(),
                    timestamp_us,
                    event.access_change_data(),
                );
            }
            ChangeType::RequestFullUpdate | ChangeType::FullUpdate | ChangeType::Shutdown => {}
        }
    }

    /// Write pending object state and messages to the peer.
    pub fn tick_outbound(&mut self) {
        if self.is_shutdown {
            return;
        }
        for collection in self.collections.values() {
            collection.borrow_mut().tick();
        }

        let Some(outbound) = self.outbound.clone() else {
            return;
        };
        let request_full_update = self.sync_state.state() == FullUpdateState::Requested;
        let send_full_update = self.pending_outbound_full_update;
        if !request_full_update
            && !send_full_update
            && !self.queue.has_pending()
            && !outbound.needs_heartbeat()
        {
            return;
        }

        if send_full_update {
            for collection in self.collections.values() {
                let mut collection = collection.borrow_mut();
                if collection.is_local_owned() {
                    collection.prep_full_update();
                }
            }
        }

        let writes = self.queue.pending_writes();
        let collections = &self.collections;
        let queue = &self.queue;
        let mut events_written = 0;
        let mut messages_written = 0;
        let ok = outbound.transact(self.settings.lock_timeout, &mut |acc| {
            if request_full_update {
                acc.write_marker(ChangeType::RequestFullUpdate);
            }
            if send_full_update {
                acc.write_marker(ChangeType::FullUpdate);
            }
            for (collection_id, id) in &writes {
                if let Some(collection) = collections.get(collection_id) {
                    collection.borrow_mut().write_changes(acc, *id);
                }
            }
            messages_written = queue.write_messages(acc);
            events_written = acc.events_written();
        });

        if !ok {
            self.stats.lock_timeouts += 1;
            tracing::debug!("Outbound transport busy, retrying next tick");
            return;
        }

        self.queue.clear();
        self.stats.outbound_events += u64::from(events_written);
        self.stats.messages_sent += messages_written as u64;
        if request_full_update {
            self.stats.full_update_requests_sent += 1;
            self.transition(FullUpdateState::Awaiting);
        }
        if send_full_update {
            self.stats.full_updates_sent += 1;
            self.pending_outbound_full_update = false;
        }
    }

    /// Tell the peer this side is going away and stop ticking. Idempotent.
    pub fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.is_shutdown = true;

        if let Some(outbound) = self.outbound.take() {
            let written = outbound.transact(self.settings.lock_timeout, &mut |acc| {
                acc.write_marker(ChangeType::Shutdown);
            });
            if !written {
                tracing::warn!("Could not write shutdown marker");
            }
        }
        self.inbound = None;
        self.queue.clear();
        tracing::debug!("Reconciler shut down");
    }

    fn transition(&mut self, target: FullUpdateState) {
        if let Err(e) = self.sync_state.transition_to(target) {
            tracing::error!(error = %e, "Full update state machine rejected transition");
        }
    }
}

impl std::fmt::Debug for DataStoreReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStoreReconciler")
            .field("has_inbound", &self.inbound.is_some())
            .field("has_outbound", &self.outbound.is_some())
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("full_update_state", &self.sync_state.state())
            .field("is_shutdown", &self.is_shutdown)
            .finish()
    }
}
