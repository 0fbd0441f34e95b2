// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Typed object registries keyed by [`ObjectUuid`].
//!
//! A collection is either locally owned (this process creates the objects
//! and the reconciler writes their state out) or remote mirrored (objects
//! are created, updated and deleted by records from the inbound stream).
//! Messages are delivered to objects of either flavor.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use crate::error::CollectionError;
use crate::reconciler::{IndexHook, ObjectHandle, ObjectUpdate, OutboundQueue, ReconciledObject};
use crate::shm::MemoryAccessor;
use crate::transport::TransportStreamAccessor;
use crate::types::ObjectUuid;

/// What the reconciler needs from a collection, independent of its object
/// type.
pub trait CollectionHandler {
    fn collection_id(&self) -> i32;

    fn is_local_owned(&self) -> bool;

    /// Called once on registration.
    fn bind_outbound(&mut self, queue: OutboundQueue);

    /// `upsert` is set while applying a full update; an existing object
    /// then takes the payload as an update.
    fn process_create(&mut self, id: ObjectUuid, data: MemoryAccessor<'_>, upsert: bool);

    fn process_update(&mut self, id: ObjectUuid, data: MemoryAccessor<'_>, fields_changed: u64);

    fn process_delete(&mut self, id: ObjectUuid);

    fn process_message(
        &mut self,
        id: ObjectUuid,
        message_type: i32,
        timestamp_us: u64,
        data: MemoryAccessor<'_>,
    );

    /// Drop every mirrored object not named by the full update just
    /// received.
    fn process_full_reconcile(&mut self, reconciled_ids: &HashSet<ObjectUuid>);

    /// The peer shut down.
    fn process_shutdown(&mut self);

    /// Serialize `id`, or write its deletion when it no longer exists.
    fn write_changes(&mut self, acc: &mut TransportStreamAccessor<'_>, id: ObjectUuid);

    /// Queue every object for rewriting as a create.
    fn prep_full_update(&mut self);

    fn tick(&mut self);
}

type CreateDelegate<T> = Box<dyn FnMut(ObjectUuid, MemoryAccessor<'_>, i32) -> T>;

/// Collection of reconciled objects of one type.
pub struct ObjectCollection<T: ReconciledObject> {
    collection_id: i32,
    inbound_field_mask: u64,
    indexed_field_mask: u64,
    is_local_owned: bool,
    create_delegate: Option<CreateDelegate<T>>,
    objects: BTreeMap<ObjectUuid, T>,
    index_hooks: Vec<Rc<RefCell<dyn IndexHook<T>>>>,
    queue: Option<OutboundQueue>,
}

impl<T: ReconciledObject> ObjectCollection<T> {
    /// Collection mirrored from the inbound stream. `create_delegate` builds
    /// an object from a create record; the full payload is then applied
    /// through [`ReconciledObject::process_update`].
    pub fn new_remote(
        collection_id: i32,
        inbound_field_mask: u64,
        create_delegate: impl FnMut(ObjectUuid, MemoryAccessor<'_>, i32) -> T + 'static,
    ) -> Self {
        Self {
            collection_id,
            inbound_field_mask,
            indexed_field_mask: 0,
            is_local_owned: false,
            create_delegate: Some(Box::new(create_delegate)),
            objects: BTreeMap::new(),
            index_hooks: Vec::new(),
            queue: None,
        }
    }

    /// Collection whose objects are added by this process.
    pub fn new_local(collection_id: i32) -> Self {
        Self {
            collection_id,
            inbound_field_mask: 0,
            indexed_field_mask: 0,
            is_local_owned: true,
            create_delegate: None,
            objects: BTreeMap::new(),
            index_hooks: Vec::new(),
            queue: None,
        }
    }

    pub fn with_inbound_field_mask(mut self, mask: u64) -> Self {
        self.inbound_field_mask = mask;
        self
    }

    /// Fields whose changes re-run index update hooks.
    pub fn with_indexed_field_mask(mut self, mask: u64) -> Self {
        self.indexed_field_mask = mask;
        self
    }

    /// Objects already present are reported to the hook as creates.
    pub fn add_index_hook(&mut self, hook: Rc<RefCell<dyn IndexHook<T>>>) {
        {
            let mut h = hook.borrow_mut();
            for object in self.objects.values() {
                h.on_create(object);
            }
        }
        self.index_hooks.push(hook);
    }

    pub fn inbound_field_mask(&self) -> u64 {
        self.inbound_field_mask
    }

    pub fn indexed_field_mask(&self) -> u64 {
        self.indexed_field_mask
    }

    pub fn get_object(&self, id: &ObjectUuid) -> Option<&T> {
        self.objects.get(id)
    }

    pub fn get_object_mut(&mut self, id: &ObjectUuid) -> Option<&mut T> {
        self.objects.get_mut(id)
    }

    /// Objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: &ObjectUuid) -> bool {
        self.objects.contains_key(id)
    }

    /// Take ownership of a locally created object and queue its create.
    pub fn add_object(&mut self, mut object: T) -> Result<(), CollectionError> {
        if !self.is_local_owned {
            return Err(CollectionError::NotLocallyOwned {
                collection_id: self.collection_id,
            });
        }
        let id = object.id();
        if self.objects.contains_key(&id) {
            return Err(CollectionError::DuplicateObject {
                collection_id: self.collection_id,
                id,
            });
        }

        if let Some(queue) = &self.queue {
            object.bind_outbound(ObjectHandle::new(queue.clone(), self.collection_id, id));
            queue.request_write(self.collection_id, id);
        }
        self.insert(id, object);
        Ok(())
    }

    /// Remove a locally owned object; its deletion is written on the next
    /// outbound tick. `Ok(None)` when the id is unknown.
    pub fn remove_object(&mut self, id: &ObjectUuid) -> Result<Option<T>, CollectionError> {
        if !self.is_local_owned {
            return Err(CollectionError::NotLocallyOwned {
                collection_id: self.collection_id,
            });
        }
        let removed = self.erase(id);
        if removed.is_some() {
            if let Some(queue) = &self.queue {
                queue.request_write(self.collection_id, *id);
            }
        }
        Ok(removed)
    }

    fn insert(&mut self, id: ObjectUuid, object: T) {
        for hook in &self.index_hooks {
            hook.borrow_mut().on_create(&object);
        }
        self.objects.insert(id, object);
    }

    fn erase(&mut self, id: &ObjectUuid) -> Option<T> {
        let mut object = self.objects.remove(id)?;
        object.process_delete();
        for hook in &self.index_hooks {
            hook.borrow_mut().on_delete(&object);
        }
        Some(object)
    }

    fn notify_index_update(&self, id: &ObjectUuid, fields_changed: u64) {
        if fields_changed & self.indexed_field_mask == 0 {
            return;
        }
        if let Some(object) = self.objects.get(id) {
            for hook in &self.index_hooks {
                hook.borrow_mut().on_update(object, fields_changed);
            }
        }
    }

    fn apply_update(&mut self, id: &ObjectUuid, data: MemoryAccessor<'_>, fields_present: u64) -> bool {
        let fields_changed = fields_present & self.inbound_field_mask;
        if fields_changed == 0 {
            return false;
        }
        let Some(object) = self.objects.get_mut(id) else {
            tracing::debug!(
                collection_id = self.collection_id,
                object_id = %id,
                "Update for unknown object ignored"
            );
            return false;
        };
        object.process_update(&mut ObjectUpdate::new(data, fields_present, fields_changed));
        self.notify_index_update(id, fields_changed);
        true
    }
}

impl<T: ReconciledObject> CollectionHandler for ObjectCollection<T> {
    fn collection_id(&self) -> i32 {
        self.collection_id
    }

    fn is_local_owned(&self) -> bool {
        self.is_local_owned
    }

    fn bind_outbound(&mut self, queue: OutboundQueue) {
        for (id, object) in self.objects.iter_mut() {
            object.bind_outbound(ObjectHandle::new(queue.clone(), self.collection_id, *id));
            if self.is_local_owned {
                queue.request_write(self.collection_id, *id);
            }
        }
        self.queue = Some(queue);
    }

    fn process_create(&mut self, id: ObjectUuid, data: MemoryAccessor<'_>, upsert: bool) {
        if self.is_local_owned {
            tracing::debug!(
                collection_id = self.collection_id,
                object_id = %id,
                "Create for locally owned collection ignored"
            );
            return;
        }

        if self.objects.contains_key(&id) {
            if !upsert {
                tracing::warn!(
                    collection_id = self.collection_id,
                    object_id = %id,
                    "Create for existing object, applying as update"
                );
            }
            self.apply_update(&id, data, T::ALL_FIELDS);
            return;
        }

        let Some(delegate) = self.create_delegate.as_mut() else {
            return;
        };
        let mut object = delegate(id, data, self.collection_id);
        let fields_changed = T::ALL_FIELDS & self.inbound_field_mask;
        object.process_update(&mut ObjectUpdate::new(data, T::ALL_FIELDS, fields_changed));
        if let Some(queue) = &self.queue {
            object.bind_outbound(ObjectHandle::new(queue.clone(), self.collection_id, id));
        }
        self.insert(id, object);
    }

    fn process_update(&mut self, id: ObjectUuid, data: MemoryAccessor<'_>, fields_changed: u64) {
        if self.is_local_owned {
            return;
        }
        self.apply_update(&id, data, fields_changed);
    }

    fn process_delete(&mut self, id: ObjectUuid) {
        if self.is_local_owned {
            return;
        }
        self.erase(&id);
    }

    fn process_message(
        &mut self,
        id: ObjectUuid,
        message_type: i32,
        timestamp_us: u64,
        data: MemoryAccessor<'_>,
    ) {
        match self.objects.get_mut(&id) {
            Some(object) => object.process_message(message_type, timestamp_us, data),
            None => tracing::debug!(
                collection_id = self.collection_id,
                object_id = %id,
                message_type = message_type,
                "Message for unknown object dropped"
            ),
        }
    }

    fn process_full_reconcile(&mut self, reconciled_ids: &HashSet<ObjectUuid>) {
        if self.is_local_owned {
            return;
        }
        let stale: Vec<ObjectUuid> = self
            .objects
            .keys()
            .filter(|id| !reconciled_ids.contains(id))
            .copied()
            .collect();
        if !stale.is_empty() {
            tracing::debug!(
                collection_id = self.collection_id,
                removed = stale.len(),
                "Full update removed stale objects"
            );
        }
        for id in stale {
            self.erase(&id);
        }
    }

    fn process_shutdown(&mut self) {
        if self.is_local_owned {
            return;
        }
        let ids: Vec<ObjectUuid> = self.objects.keys().copied().collect();
        for id in ids {
            self.erase(&id);
        }
    }

    fn write_changes(&mut self, acc: &mut TransportStreamAccessor<'_>, id: ObjectUuid) {
        match self.objects.get_mut(&id) {
            Some(object) => object.write_changes(acc, self.collection_id),
            None => {
                if !acc.write_delete(self.collection_id, id) {
                    tracing::warn!(
                        collection_id = self.collection_id,
                        object_id = %id,
                        "Delete record did not fit in the outbound changelog"
                    );
                }
            }
        }
    }

    fn prep_full_update(&mut self) {
        if !self.is_local_owned {
            return;
        }
        for (id, object) in self.objects.iter_mut() {
            object.prep_full_update();
            if let Some(queue) = &self.queue {
                queue.request_write(self.collection_id, *id);
            }
        }
    }

    fn tick(&mut self) {
        for object in self.objects.values_mut() {
            object.tick();
        }
    }
}

impl<T: ReconciledObject> std::fmt::Debug for ObjectCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCollection")
            .field("collection_id", &self.collection_id)
            .field("is_local_owned", &self.is_local_owned)
            .field("inbound_field_mask", &self.inbound_field_mask)
            .field("indexed_field_mask", &self.indexed_field_mask)
            .field("len", &self.objects.len())
            .finish()
    }
}
