// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Secondary indexes over a collection.
//!
//! An index maps the value of one designated field to the ids of the
//! objects currently holding it. Collections keep indexes consistent through
//! [`IndexHook`] callbacks; update hooks only fire when the changed fields
//! intersect the collection's indexed field mask.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::rc::Rc;

use crate::reconciler::{ObjectCollection, ReconciledObject};
use crate::types::ObjectUuid;

/// Callbacks a collection invokes as its objects come and go.
pub trait IndexHook<T> {
    fn on_create(&mut self, object: &T);

    fn on_update(&mut self, object: &T, fields_changed: u64);

    /// Called while the object is still readable, before it is dropped.
    fn on_delete(&mut self, object: &T);
}

type KeyFn<K, T> = Box<dyn Fn(&T) -> K>;

/// Field value to object ids multimap.
pub struct ObjectCollectionIndex<K, T> {
    key_fn: KeyFn<K, T>,
    index: HashMap<K, Vec<ObjectUuid>>,
    keys: HashMap<ObjectUuid, K>,
}

impl<K, T> ObjectCollectionIndex<K, T>
where
    K: Eq + Hash + Clone,
    T: ReconciledObject,
{
    pub fn new(key_fn: impl Fn(&T) -> K + 'static) -> Self {
        Self {
            key_fn: Box::new(key_fn),
            index: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Ids of the objects whose indexed value is `key`, in insertion order.
    pub fn get_ids(&self, key: &K) -> &[ObjectUuid] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indexed value of `id` as last seen.
    pub fn key_of(&self, id: &ObjectUuid) -> Option<&K> {
        self.keys.get(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn insert(&mut self, id: ObjectUuid, key: K) {
        self.index.entry(key.clone()).or_default().push(id);
        self.keys.insert(id, key);
    }

    fn remove(&mut self, id: &ObjectUuid) -> Option<K> {
        let key = self.keys.remove(id)?;
        if let Some(ids) = self.index.get_mut(&key) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.index.remove(&key);
            }
        }
        Some(key)
    }
}

impl<K, T> IndexHook<T> for ObjectCollectionIndex<K, T>
where
    K: Eq + Hash + Clone,
    T: ReconciledObject,
{
    fn on_create(&mut self, object: &T) {
        let id = object.id();
        self.remove(&id);
        self.insert(id, (self.key_fn)(object));
    }

    fn on_update(&mut self, object: &T, _fields_changed: u64) {
        let id = object.id();
        let key = (self.key_fn)(object);
        if self.keys.get(&id) == Some(&key) {
            return;
        }
        self.remove(&id);
        self.insert(id, key);
    }

    fn on_delete(&mut self, object: &T) {
        self.remove(&object.id());
    }
}

impl<K: std::fmt::Debug, T> std::fmt::Debug for ObjectCollectionIndex<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCollectionIndex")
            .field("index", &self.index)
            .finish()
    }
}

/// A process-local helper object that attaches to reconciled objects.
pub trait BoundLocalObject<T> {
    /// Attach to `object`. Return false to decline the binding.
    fn add_binding(&mut self, object: &T) -> bool;

    fn remove_binding(&mut self, object: &T);
}

struct LocalEntry<L> {
    object: Rc<RefCell<L>>,
    bound: HashSet<ObjectUuid>,
}

/// Binds local objects registered under an index value to every reconciled
/// object currently holding that value, and keeps the bindings current as
/// reconciled objects are created, re-keyed and deleted.
pub struct ObjectCollectionIndexedBinding<K, T, L> {
    index: ObjectCollectionIndex<K, T>,
    locals: HashMap<K, Vec<LocalEntry<L>>>,
}

impl<K, T, L> ObjectCollectionIndexedBinding<K, T, L>
where
    K: Eq + Hash + Clone,
    T: ReconciledObject,
    L: BoundLocalObject<T>,
{
    pub fn new(key_fn: impl Fn(&T) -> K + 'static) -> Self {
        Self {
            index: ObjectCollectionIndex::new(key_fn),
            locals: HashMap::new(),
        }
    }

    pub fn index(&self) -> &ObjectCollectionIndex<K, T> {
        &self.index
    }

    /// Register `local` under `key` and bind it to the matching objects
    /// already in `collection`.
    pub fn add_local_object(
        &mut self,
        key: K,
        local: Rc<RefCell<L>>,
        collection: &ObjectCollection<T>,
    ) {
        let mut entry = LocalEntry {
            object: local,
            bound: HashSet::new(),
        };
        for id in self.index.get_ids(&key) {
            if let Some(object) = collection.get_object(id) {
                if entry.object.borrow_mut().add_binding(object) {
                    entry.bound.insert(*id);
                }
            }
        }
        self.locals.entry(key).or_default().push(entry);
    }

    /// Unbind and forget `local`. Returns false when it was not registered
    /// under `key`.
    pub fn remove_local_object(
        &mut self,
        key: &K,
        local: &Rc<RefCell<L>>,
        collection: &ObjectCollection<T>,
    ) -> bool {
        let Some(entries) = self.locals.get_mut(key) else {
            return false;
        };
        let Some(pos) = entries
            .iter()
            .position(|entry| Rc::ptr_eq(&entry.object, local))
        else {
            return false;
        };

        let entry = entries.remove(pos);
        if entries.is_empty() {
            self.locals.remove(key);
        }
        for id in &entry.bound {
            if let Some(object) = collection.get_object(id) {
                entry.object.borrow_mut().remove_binding(object);
            }
        }
        true
    }

    /// Number of local objects registered under `key`.
    pub fn local_count(&self, key: &K) -> usize {
        self.locals.get(key).map_or(0, Vec::len)
    }

    fn bind_all(&mut self, key: &K, object: &T) {
        let id = object.id();
        if let Some(entries) = self.locals.get_mut(key) {
            for entry in entries {
                if entry.object.borrow_mut().add_binding(object) {
                    entry.bound.insert(id);
                }
            }
        }
    }

    fn unbind_all(&mut self, key: &K, object: &T) {
        let id = object.id();
        if let Some(entries) = self.locals.get_mut(key) {
            for entry in entries {
                if entry.bound.remove(&id) {
                    entry.object.borrow_mut().remove_binding(object);
                }
            }
        }
    }
}

impl<K, T, L> IndexHook<T> for ObjectCollectionIndexedBinding<K, T, L>
where
    K: Eq + Hash + Clone,
    T: ReconciledObject,
    L: BoundLocalObject<T>,
{
    fn on_create(&mut self, object: &T) {
        if let Some(old) = self.index.key_of(&object.id()).cloned() {
            self.unbind_all(&old, object);
        }
        self.index.on_create(object);
        if let Some(key) = self.index.key_of(&object.id()).cloned() {
            self.bind_all(&key, object);
        }
    }

    fn on_update(&mut self, object: &T, fields_changed: u64) {
        let old = self.index.key_of(&object.id()).cloned();
        self.index.on_update(object, fields_changed);
        let new = self.index.key_of(&object.id()).cloned();
        if old == new {
            return;
        }
        if let Some(old) = old {
            self.unbind_all(&old, object);
        }
        if let Some(new) = new {
            self.bind_all(&new, object);
        }
    }

    fn on_delete(&mut self, object: &T) {
        if let Some(key) = self.index.key_of(&object.id()).cloned() {
            self.unbind_all(&key, object);
        }
        self.index.on_delete(object);
    }
}
