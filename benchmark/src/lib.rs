// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Xrpa Benchmark Fixtures
//!
//! Shared setup for the criterion benchmarks.
//!
//! # Benchmark Groups
//!
//! - **changelog**: placed ring buffer push/shift/iterate at various record sizes
//! - **transport**: lock-held writes and drains over heap and file-backed segments
//! - **reconciler**: full writer-to-mirror ticks with dirty objects

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tempfile::TempDir;
use xrpa_core::reconciler::{
    ObjectCollection, ObjectHandle, ObjectUpdate, ObjectWriteState, ReconciledObject,
};
use xrpa_core::transport::{MemoryTransportStream, TransportStream, TransportStreamAccessor};
use xrpa_core::{
    DataStoreReconciler, HashValue, MemoryAccessor, MemoryOffset, ObjectUuid,
    ReconcilerSettings, StreamName, SystemClock, TransportConfig, TransportSettings,
};

/// Collection id used by every fixture.
pub const COLLECTION_ID: i32 = 0;

const COUNTER: u64 = 1 << 0;
const BLOB: u64 = 1 << 1;

pub fn bench_config(changelog_bytes: u32) -> TransportConfig {
    TransportConfig::new(HashValue::from_schema("bench { counter: i32, blob: bytes }"), changelog_bytes)
        .expect("Invalid benchmark transport config")
}

pub fn heap_stream(config: TransportConfig) -> Arc<dyn TransportStream> {
    Arc::new(MemoryTransportStream::heap(config, Arc::new(SystemClock)))
}

/// File-backed segments in a private directory, removed on drop.
pub struct SharedFixture {
    dir: TempDir,
}

impl SharedFixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn open(&self, name: &str, config: TransportConfig) -> Arc<dyn TransportStream> {
        let name = StreamName::new(name).expect("Invalid stream name");
        let settings = TransportSettings::with_shm_dir(self.dir.path());
        let stream = MemoryTransportStream::open_shared(&name, config, &settings, Arc::new(SystemClock))
            .expect("Failed to open shared transport");
        Arc::new(stream)
    }
}

impl Default for SharedFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Locally owned object with a counter and an opaque blob.
pub struct Payload {
    id: ObjectUuid,
    counter: i32,
    blob: Vec<u8>,
    state: ObjectWriteState,
    handle: Option<ObjectHandle>,
}

impl Payload {
    pub fn new(n: u64, blob_size: usize) -> Self {
        Self {
            id: ObjectUuid::new(0, n),
            counter: 0,
            blob: vec![0xAB; blob_size],
            state: ObjectWriteState::new(),
            handle: None,
        }
    }

    pub fn bump(&mut self) {
        self.counter = self.counter.wrapping_add(1);
        self.state.mark_dirty(COUNTER);
        if let Some(handle) = &self.handle {
            handle.request_write();
        }
    }
}

impl ReconciledObject for Payload {
    const ALL_FIELDS: u64 = COUNTER | BLOB;

    fn id(&self) -> ObjectUuid {
        self.id
    }

    fn bind_outbound(&mut self, handle: ObjectHandle) {
        self.handle = Some(handle);
    }

    fn write_changes(&mut self, acc: &mut TransportStreamAccessor<'_>, collection_id: i32) {
        let counter = self.counter;
        let blob = &self.blob;
        self.state.write_changes(
            acc,
            collection_id,
            self.id,
            Self::ALL_FIELDS,
            |mask| {
                let mut size = 0;
                if mask & COUNTER != 0 {
                    size += 4;
                }
                if mask & BLOB != 0 {
                    size += MemoryAccessor::dyn_size_of_bytearray(blob);
                }
                size
            },
            |mask, mem| {
                let mut pos = MemoryOffset::default();
                if mask & COUNTER != 0 {
                    mem.write_i32(counter, &mut pos);
                }
                if mask & BLOB != 0 {
                    mem.write_bytearray(blob, &mut pos);
                }
            },
        );
    }

    fn prep_full_update(&mut self) {
        self.state.prep_full_update();
    }
}

/// Mirror of [`Payload`] on the reading side.
pub struct PayloadMirror {
    id: ObjectUuid,
    pub counter: i32,
    pub blob_len: usize,
}

impl ReconciledObject for PayloadMirror {
    const ALL_FIELDS: u64 = COUNTER | BLOB;

    fn id(&self) -> ObjectUuid {
        self.id
    }

    fn process_update(&mut self, update: &mut ObjectUpdate<'_>) {
        if let Some(counter) = update.read_field(COUNTER, |m, p| m.read_i32(p)) {
            self.counter = counter;
        }
        if let Some(blob) = update.read_field(BLOB, |m, p| m.read_bytearray(p)) {
            self.blob_len = blob.len();
        }
    }
}

/// A writer reconciler owning `objects` payloads and a reader mirroring
/// them, over heap transports.
pub struct ReconcilerPair {
    pub writer: DataStoreReconciler,
    pub reader: DataStoreReconciler,
    pub local: Rc<RefCell<ObjectCollection<Payload>>>,
    pub mirror: Rc<RefCell<ObjectCollection<PayloadMirror>>>,
}

impl ReconcilerPair {
    pub fn new(changelog_bytes: u32, objects: u64, blob_size: usize) -> Self {
        let config = bench_config(changelog_bytes);
        let forward = heap_stream(config);
        let backward = heap_stream(config);
        let clock = Arc::new(SystemClock);

        let mut writer = DataStoreReconciler::new(
            Some(backward.clone()),
            Some(forward.clone()),
            ReconcilerSettings::default(),
            clock.clone(),
        );
        let mut reader = DataStoreReconciler::new(
            Some(forward),
            Some(backward),
            ReconcilerSettings::default(),
            clock,
        );

        let local = Rc::new(RefCell::new(ObjectCollection::<Payload>::new_local(COLLECTION_ID)));
        let mirror = Rc::new(RefCell::new(ObjectCollection::new_remote(
            COLLECTION_ID,
            COUNTER | BLOB,
            |id, _data, _collection_id| PayloadMirror {
                id,
                counter: 0,
                blob_len: 0,
            },
        )));
        writer
            .register_collection(local.clone())
            .expect("Failed to register local collection");
        reader
            .register_collection(mirror.clone())
            .expect("Failed to register mirror collection");

        for n in 0..objects {
            local
                .borrow_mut()
                .add_object(Payload::new(n, blob_size))
                .expect("Duplicate benchmark object");
        }

        let mut pair = Self {
            writer,
            reader,
            local,
            mirror,
        };
        pair.sync();
        pair
    }

    /// Bump every object's counter.
    pub fn touch_all(&self) {
        let mut local = self.local.borrow_mut();
        let ids: Vec<ObjectUuid> = local.iter().map(|p| p.id).collect();
        for id in ids {
            if let Some(payload) = local.get_object_mut(&id) {
                payload.bump();
            }
        }
    }

    /// One outbound tick on the writer and one inbound tick on the reader.
    pub fn sync(&mut self) {
        self.writer.tick_outbound();
        self.reader.tick_inbound();
    }
}
