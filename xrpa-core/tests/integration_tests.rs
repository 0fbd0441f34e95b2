// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end integration tests for Xrpa.
//!
//! These tests run writer and reader reconcilers against file-backed
//! segments in a temporary directory, the way two processes would.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use xrpa_core::reconciler::{
    ObjectCollection, ObjectHandle, ObjectHandlers, ObjectUpdate, ObjectWriteState,
    ReconciledObject,
};
use xrpa_core::shm::{FileLockMutex, InterprocessMutex, SharedMemoryRegion};
use xrpa_core::transport::{
    segment_name, ChangeEventKind, ChangeType, CollectionChangeEvent,
    CollectionChangeEventAccessor, CollectionUpdateChangeEventAccessor, MemoryTransportStream,
    TransportStream, TransportStreamAccessor,
};
use xrpa_core::{
    DataStoreReconciler, FullUpdateState, HashValue, ManualClock, MemoryAccessor, MemoryOffset,
    ObjectUuid, ReconcilerSettings, StreamName, TransportConfig, TransportSettings,
};

const FIELD_A: u64 = 1 << 0;
const FIELD_B: u64 = 1 << 1;
const ALL_FIELDS: u64 = FIELD_A | FIELD_B;
const SENSORS: i32 = 0;
const TIMEOUT: Duration = Duration::from_millis(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fields_size(mask: u64) -> usize {
    (mask & ALL_FIELDS).count_ones() as usize * 4
}

/// Sensor owned by the writing process.
struct Sensor {
    id: ObjectUuid,
    a: i32,
    b: f32,
    state: ObjectWriteState,
    handle: Option<ObjectHandle>,
}

impl Sensor {
    fn new(id: ObjectUuid, a: i32, b: f32) -> Self {
        Self {
            id,
            a,
            b,
            state: ObjectWriteState::new(),
            handle: None,
        }
    }

    fn set_a(&mut self, a: i32) {
        self.a = a;
        self.state.mark_dirty(FIELD_A);
        if let Some(handle) = &self.handle {
            handle.request_write();
        }
    }
}

impl ReconciledObject for Sensor {
    const ALL_FIELDS: u64 = ALL_FIELDS;

    fn id(&self) -> ObjectUuid {
        self.id
    }

    fn bind_outbound(&mut self, handle: ObjectHandle) {
        self.handle = Some(handle);
    }

    fn write_changes(&mut self, acc: &mut TransportStreamAccessor<'_>, collection_id: i32) {
        let (a, b) = (self.a, self.b);
        self.state.write_changes(
            acc,
            collection_id,
            self.id,
            ALL_FIELDS,
            fields_size,
            |mask, mem| {
                let mut pos = MemoryOffset::default();
                if mask & FIELD_A != 0 {
                    mem.write_i32(a, &mut pos);
                }
                if mask & FIELD_B != 0 {
                    mem.write_f32(b, &mut pos);
                }
            },
        );
    }

    fn prep_full_update(&mut self) {
        self.state.prep_full_update();
    }
}

/// Reader-side mirror of [`Sensor`].
struct SensorMirror {
    id: ObjectUuid,
    a: i32,
    b: f32,
    handlers: ObjectHandlers,
}

impl ReconciledObject for SensorMirror {
    const ALL_FIELDS: u64 = ALL_FIELDS;

    fn id(&self) -> ObjectUuid {
        self.id
    }

    fn process_update(&mut self, update: &mut ObjectUpdate<'_>) {
        if let Some(a) = update.read_field(FIELD_A, |m, p| m.read_i32(p)) {
            self.a = a;
        }
        if let Some(b) = update.read_field(FIELD_B, |m, p| m.read_f32(p)) {
            self.b = b;
        }
        self.handlers.notify_fields_changed(update.fields_changed());
    }

    fn process_delete(&mut self) {
        self.handlers.notify_delete();
    }
}

type EventLog = Rc<RefCell<Vec<String>>>;

fn mirror_collection(log: &EventLog) -> Rc<RefCell<ObjectCollection<SensorMirror>>> {
    let log = log.clone();
    Rc::new(RefCell::new(ObjectCollection::new_remote(
        SENSORS,
        ALL_FIELDS,
        move |id, _data, _collection_id| {
            let mut handlers = ObjectHandlers::new();
            let changed = log.clone();
            handlers.on_fields_changed(move |mask| {
                changed.borrow_mut().push(format!("{} changed {}", id.id1, mask))
            });
            let deleted = log.clone();
            handlers.on_delete(move || deleted.borrow_mut().push(format!("{} deleted", id.id1)));
            SensorMirror {
                id,
                a: 0,
                b: 0.0,
                handlers,
            }
        },
    )))
}

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
    config: TransportConfig,
}

impl Harness {
    fn new(changelog_bytes: u32) -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            clock: Arc::new(ManualClock::default()),
            config: TransportConfig::new(HashValue::from_schema("sensor { a: i32, b: f32 }"), changelog_bytes)
                .expect("Invalid transport config"),
        }
    }

    fn settings(&self) -> TransportSettings {
        TransportSettings::with_shm_dir(self.dir.path())
    }

    fn open(&self, name: &str) -> Arc<dyn TransportStream> {
        let name = StreamName::new(name).expect("Invalid stream name");
        let stream =
            MemoryTransportStream::open_shared(&name, self.config, &self.settings(), self.clock.clone())
                .expect("Failed to open transport");
        assert!(stream.is_ready());
        Arc::new(stream)
    }

    fn reconciler(&self, inbound: &str, outbound: &str) -> DataStoreReconciler {
        DataStoreReconciler::new(
            Some(self.open(inbound)),
            Some(self.open(outbound)),
            ReconcilerSettings::default(),
            self.clock.clone(),
        )
    }
}

/// Writer creates a sensor and updates one field; a raw reader sees the
/// exact records.
#[test]
fn test_create_then_update_records() {
    let h = Harness::new(4096);
    let reader_stream = h.open("sensors");
    let mut reader_iter = reader_stream.create_iterator();

    let mut writer = DataStoreReconciler::new(
        None,
        Some(h.open("sensors")),
        ReconcilerSettings::default(),
        h.clock.clone(),
    );
    let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
    writer.register_collection(sensors.clone()).unwrap();

    let id = ObjectUuid::new(1, 100);
    sensors.borrow_mut().add_object(Sensor::new(id, 10, 45.2)).unwrap();
    writer.tick_outbound();

    let mut creates = 0;
    assert!(reader_stream.transact(TIMEOUT, &mut |acc| {
        assert!(!reader_iter.has_missed_entries(acc));
        while let Some(event) = reader_iter.next(acc) {
            if event.change_type() != Some(ChangeType::CreateObject) {
                continue;
            }
            let create = event.cast::<CollectionChangeEventAccessor>();
            assert_eq!(create.object_id(), id);
            assert_eq!(create.collection_id(), SENSORS);
            let data = create.access_change_data();
            let mut pos = MemoryOffset::default();
            assert_eq!(data.read_i32(&mut pos), 10);
            assert!((data.read_f32(&mut pos) - 45.2).abs() < 0.001);
            creates += 1;
        }
    }));
    assert_eq!(creates, 1);

    sensors.borrow_mut().get_object_mut(&id).unwrap().set_a(500);
    writer.tick_outbound();

    let mut updates = Vec::new();
    assert!(reader_stream.transact(TIMEOUT, &mut |acc| {
        while let Some(event) = reader_iter.next(acc) {
            assert_eq!(event.change_type(), Some(ChangeType::UpdateObject));
            let update = event.cast::<CollectionUpdateChangeEventAccessor>();
            assert_eq!(update.object_id(), id);
            let value = update.access_change_data().read_i32(&mut MemoryOffset::default());
            updates.push((update.fields_changed(), value, update.access_change_data().size()));
        }
    }));
    assert_eq!(updates, vec![(FIELD_A, 500, 4)]);

    let sensor = sensors.borrow();
    assert!((sensor.get_object(&id).unwrap().b - 45.2).abs() < 0.001);
}

/// The same scenario through a mirroring reconciler.
#[test]
fn test_mirror_follows_writer() {
    let h = Harness::new(4096);
    let mut writer = h.reconciler("to_writer", "to_reader");
    let mut reader = h.reconciler("to_reader", "to_writer");

    let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
    writer.register_collection(sensors.clone()).unwrap();
    let log = EventLog::default();
    let mirrors = mirror_collection(&log);
    reader.register_collection(mirrors.clone()).unwrap();

    let id = ObjectUuid::new(1, 100);
    sensors.borrow_mut().add_object(Sensor::new(id, 10, 45.2)).unwrap();
    writer.tick_outbound();
    reader.tick_inbound();

    sensors.borrow_mut().get_object_mut(&id).unwrap().set_a(500);
    writer.tick_outbound();
    reader.tick_inbound();

    {
        let mirrors = mirrors.borrow();
        let mirror = mirrors.get_object(&id).unwrap();
        assert_eq!(mirror.a, 500);
        assert!((mirror.b - 45.2).abs() < 0.001);
    }
    assert_eq!(*log.borrow(), vec!["100 changed 3", "100 changed 1"]);

    sensors.borrow_mut().remove_object(&id).unwrap();
    writer.tick_outbound();
    reader.tick_inbound();
    assert!(mirrors.borrow().is_empty());
    assert_eq!(log.borrow().last().unwrap(), "100 deleted");
}

/// A reader that fell behind ends with exactly the writer's objects.
#[test]
fn test_full_resync_after_overflow() {
    let h = Harness::new(512);
    let mut writer = h.reconciler("to_writer", "to_reader");
    let mut reader = h.reconciler("to_reader", "to_writer");

    let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
    writer.register_collection(sensors.clone()).unwrap();
    let log = EventLog::default();
    let mirrors = mirror_collection(&log);
    reader.register_collection(mirrors.clone()).unwrap();

    for n in 1..=3 {
        sensors
            .borrow_mut()
            .add_object(Sensor::new(ObjectUuid::new(1, n), n as i32, 0.5))
            .unwrap();
    }
    writer.tick_outbound();
    reader.tick_inbound();
    assert_eq!(mirrors.borrow().len(), 3);

    // the delete of 1 is evicted along with the churn before the reader looks
    sensors.borrow_mut().remove_object(&ObjectUuid::new(1, 1)).unwrap();
    for value in 0..50 {
        sensors
            .borrow_mut()
            .get_object_mut(&ObjectUuid::new(1, 2))
            .unwrap()
            .set_a(value);
        writer.tick_outbound();
    }

    reader.tick_inbound();
    assert_eq!(reader.full_update_state(), FullUpdateState::Requested);
    assert_eq!(mirrors.borrow().len(), 3);

    reader.tick_outbound();
    assert_eq!(reader.full_update_state(), FullUpdateState::Awaiting);
    writer.tick_inbound();
    writer.tick_outbound();
    reader.tick_inbound();
    assert_eq!(reader.full_update_state(), FullUpdateState::NotRequested);

    let mirrors = mirrors.borrow();
    let ids: Vec<_> = mirrors.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![ObjectUuid::new(1, 2), ObjectUuid::new(1, 3)]);
    assert_eq!(mirrors.get_object(&ObjectUuid::new(1, 2)).unwrap().a, 49);
    assert!(log.borrow().contains(&"1 deleted".to_string()));
    assert_eq!(reader.stats().missed_entry_events, 1);
    assert_eq!(writer.stats().full_updates_sent, 2);
}

/// Nothing to do means no lock traffic on the file lock either.
#[test]
fn test_idle_tick_skips_lock() {
    let h = Harness::new(1024);
    let name = StreamName::new("idle").unwrap();
    let segment = segment_name(&name, &h.config);
    let mutex = Arc::new(FileLockMutex::open(h.dir.path().join(format!("{}.lock", segment))).unwrap());
    let region =
        SharedMemoryRegion::open_or_create(h.dir.path(), &segment, h.config.total_bytes()).unwrap();
    let stream = MemoryTransportStream::new(
        segment,
        h.config,
        Box::new(region),
        mutex.clone() as Arc<dyn InterprocessMutex>,
        h.clock.clone(),
        Duration::from_secs(1),
    );

    let mut writer = DataStoreReconciler::new(
        None,
        Some(Arc::new(stream)),
        ReconcilerSettings::default(),
        h.clock.clone(),
    );
    writer.tick_outbound();
    let baseline = mutex.acquisition_count();

    for _ in 0..10 {
        writer.tick_outbound();
        writer.tick_inbound();
    }
    assert_eq!(mutex.acquisition_count(), baseline);

    assert!(writer.send_message(ObjectUuid::new(0, 1), SENSORS, 1, 8).size() == 8);
    writer.tick_outbound();
    assert_eq!(mutex.acquisition_count(), baseline + 1);
}

/// The writer goes away without a shutdown and a new writer takes over the
/// live segment; the reader keeps consuming and ends up with the new
/// writer's objects only.
#[test]
fn test_changed_writer() {
    let h = Harness::new(4096);
    let mut reader = h.reconciler("to_reader", "to_writer");
    let log = EventLog::default();
    let mirrors = mirror_collection(&log);
    reader.register_collection(mirrors.clone()).unwrap();

    {
        let mut first = h.reconciler("to_writer", "to_reader");
        let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
        first.register_collection(sensors.clone()).unwrap();
        sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 1), 1, 1.0)).unwrap();
        sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 2), 2, 2.0)).unwrap();
        first.tick_outbound();
        reader.tick_inbound();
        assert_eq!(mirrors.borrow().len(), 2);
        // dropped without shutdown, as if the process died
    }

    h.clock.advance(Duration::from_millis(200));
    let mut second = h.reconciler("to_writer", "to_reader");
    let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
    second.register_collection(sensors.clone()).unwrap();
    sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 2), 20, 2.5)).unwrap();
    sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 3), 30, 3.5)).unwrap();
    second.tick_outbound();
    reader.tick_inbound();

    let mirrors = mirrors.borrow();
    let values: Vec<_> = mirrors.iter().map(|m| (m.id.id1, m.a)).collect();
    assert_eq!(values, vec![(2, 20), (3, 30)]);
    assert_eq!(reader.full_update_state(), FullUpdateState::NotRequested);
    assert_eq!(reader.stats().missed_entry_events, 0);
}

/// A writer restarting after the segment expired reinitializes it; the
/// reader notices the new generation and resyncs.
#[test]
fn test_restarted_writer_after_expiry() {
    let h = Harness::new(4096);
    let mut reader = h.reconciler("to_reader", "to_writer");
    let log = EventLog::default();
    let mirrors = mirror_collection(&log);
    reader.register_collection(mirrors.clone()).unwrap();

    {
        let mut first = h.reconciler("to_writer", "to_reader");
        let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
        first.register_collection(sensors.clone()).unwrap();
        sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 1), 1, 1.0)).unwrap();
        first.tick_outbound();
        reader.tick_inbound();
        assert_eq!(mirrors.borrow().len(), 1);
    }

    h.clock.advance(Duration::from_secs(25));
    let mut second = h.reconciler("to_writer", "to_reader");
    let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
    second.register_collection(sensors.clone()).unwrap();
    sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 7), 7, 7.0)).unwrap();
    second.tick_outbound();

    reader.tick_inbound();
    assert_eq!(reader.full_update_state(), FullUpdateState::Requested);
    reader.tick_outbound();
    second.tick_inbound();
    second.tick_outbound();
    reader.tick_inbound();

    let mirrors = mirrors.borrow();
    let ids: Vec<_> = mirrors.iter().map(|m| m.id.id1).collect();
    assert_eq!(ids, vec![7]);
    assert_eq!(reader.full_update_state(), FullUpdateState::NotRequested);
}

#[test]
fn test_schema_mismatch_rejected() {
    let h = Harness::new(1024);
    let name = StreamName::new("mismatch").unwrap();
    let settings = h.settings();
    let ours = TransportConfig::new(HashValue::new(0x1234, 1, 0, 0), 1024).unwrap();
    let theirs = TransportConfig::new(HashValue::new(0x1234, 2, 0, 0), 1024).unwrap();
    assert_eq!(segment_name(&name, &ours), segment_name(&name, &theirs));

    let first = MemoryTransportStream::open_shared(&name, ours, &settings, h.clock.clone()).unwrap();
    assert!(first.is_ready());
    let second =
        MemoryTransportStream::open_shared(&name, theirs, &settings, h.clock.clone()).unwrap();
    assert!(!second.is_ready());
    assert!(!second.transact(TIMEOUT, &mut |_| {}));

    // the original segment is untouched
    assert!(first.transact(TIMEOUT, &mut |acc| {
        assert!(acc.write_marker(ChangeType::FullUpdate));
    }));
}

#[test]
fn test_shutdown_marker_clears_mirror() {
    let h = Harness::new(4096);
    let mut writer = h.reconciler("to_writer", "to_reader");
    let mut reader = h.reconciler("to_reader", "to_writer");
    let sensors = Rc::new(RefCell::new(ObjectCollection::<Sensor>::new_local(SENSORS)));
    writer.register_collection(sensors.clone()).unwrap();
    let log = EventLog::default();
    let mirrors = mirror_collection(&log);
    reader.register_collection(mirrors.clone()).unwrap();

    sensors.borrow_mut().add_object(Sensor::new(ObjectUuid::new(1, 1), 1, 1.0)).unwrap();
    writer.tick_outbound();
    reader.tick_inbound();
    assert_eq!(mirrors.borrow().len(), 1);

    writer.shutdown();
    writer.shutdown();
    writer.tick_outbound();
    reader.tick_inbound();
    assert!(mirrors.borrow().is_empty());
    assert_eq!(*log.borrow().last().unwrap(), "1 deleted");

    // the peer's shutdown leaves this side's outbound usable
    let payload: MemoryAccessor<'_> = reader.send_message(ObjectUuid::new(1, 1), SENSORS, 3, 4);
    assert_eq!(payload.size(), 4);
}
