// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transport over a memory region: header + placed changelog, guarded by an
//! interprocess mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::shm::{
    InterprocessLockGuard, InterprocessMutex, MemoryRegion, PlacedRingBuffer,
};
use crate::transport::header::{version_major, TRANSPORT_VERSION, TRANSPORT_VERSION_MAJOR};
use crate::transport::{TransportHeader, TransportPeek, TransportStream, TransportStreamAccessor};
use crate::types::TransportConfig;

/// A writer that has not touched the segment for this long keeps readers
/// from needing a heartbeat write of their own.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Segments idle for longer are considered abandoned and reinitialized by
/// the next process that attaches.
pub const EXPIRE_TIME: Duration = Duration::from_secs(20);

/// Result of validating a segment header under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttachOutcome {
    Compatible,
    Initialized(&'static str),
    Rejected(String),
}

/// Transport implementation shared by file-backed and heap-backed segments.
pub struct MemoryTransportStream {
    name: String,
    config: TransportConfig,
    region: Box<dyn MemoryRegion>,
    mutex: Arc<dyn InterprocessMutex>,
    clock: Arc<dyn Clock>,
    ready: AtomicBool,
}

impl MemoryTransportStream {
    /// Bind to `region` and run the attach protocol.
    ///
    /// A transport that could not attach (lock timeout, incompatible
    /// segment) is still returned; it retries on every `transact` and
    /// reports `is_ready() == false` until then.
    pub fn new(
        name: impl Into<String>,
        config: TransportConfig,
        region: Box<dyn MemoryRegion>,
        mutex: Arc<dyn InterprocessMutex>,
        clock: Arc<dyn Clock>,
        attach_timeout: Duration,
    ) -> Self {
        assert!(
            region.size() >= config.total_bytes(),
            "region of {} bytes cannot hold a transport of {} bytes",
            region.size(),
            config.total_bytes()
        );

        let stream = Self {
            name: name.into(),
            config,
            region,
            mutex,
            clock,
            ready: AtomicBool::new(false),
        };
        stream.initialize_memory(attach_timeout);
        stream
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> TransportHeader<'_> {
        TransportHeader::new(self.region.accessor())
    }

    fn changelog(&self) -> PlacedRingBuffer<'_> {
        let mem = self
            .region
            .accessor()
            .slice(TransportHeader::BYTE_COUNT, PlacedRingBuffer::get_mem_size(self.pool_size()));
        PlacedRingBuffer::new(mem)
    }

    fn pool_size(&self) -> usize {
        self.config.changelog_byte_count() as usize
    }

    fn initialize_memory(&self, attach_timeout: Duration) {
        if !self.header().is_initialized() {
            tracing::debug!(
                name = %self.name,
                "Segment not initialized yet, waiting for the lock"
            );
        }

        let Some(_guard) = InterprocessLockGuard::acquire(&*self.mutex, attach_timeout) else {
            tracing::warn!(
                name = %self.name,
                timeout_ms = attach_timeout.as_millis() as u64,
                "Timed out waiting for the transport lock while attaching"
            );
            return;
        };

        match self.check_or_initialize_locked() {
            AttachOutcome::Compatible => {
                tracing::debug!(name = %self.name, "Attached to existing segment");
                self.ready.store(true, Ordering::Release);
            }
            AttachOutcome::Initialized(reason) => {
                tracing::info!(name = %self.name, reason = reason, "Initialized segment");
                self.ready.store(true, Ordering::Release);
            }
            AttachOutcome::Rejected(reason) => {
                tracing::error!(
                    name = %self.name,
                    reason = %reason,
                    "Segment is incompatible, transport unusable"
                );
            }
        }
    }

    /// Validate the header, reinitializing a stale or unfinished segment.
    /// Must be called with the lock held.
    fn check_or_initialize_locked(&self) -> AttachOutcome {
        let header = self.header();
        let now = self.clock.now_us();

        if !header.is_initialized() {
            self.initialize_locked(now);
            return AttachOutcome::Initialized("segment was never initialized");
        }

        let segment_major = version_major(header.version());
        if segment_major < TRANSPORT_VERSION_MAJOR {
            self.initialize_locked(now);
            return AttachOutcome::Initialized("segment has an older transport version");
        }
        if segment_major > TRANSPORT_VERSION_MAJOR {
            return AttachOutcome::Rejected(format!(
                "segment transport version {} is newer than {}",
                segment_major, TRANSPORT_VERSION_MAJOR
            ));
        }

        if u64::from(header.age_us(now)) > EXPIRE_TIME.as_micros() as u64 {
            self.initialize_locked(now);
            return AttachOutcome::Initialized("segment heartbeat expired");
        }

        if header.schema_hash() != self.config.schema_hash() {
            return AttachOutcome::Rejected(format!(
                "schema hash mismatch: segment {} expected {}",
                header.schema_hash(),
                self.config.schema_hash()
            ));
        }

        if header.total_bytes() as usize != self.config.total_bytes() {
            return AttachOutcome::Rejected(format!(
                "size mismatch: segment {} bytes expected {}",
                header.total_bytes(),
                self.config.total_bytes()
            ));
        }

        AttachOutcome::Compatible
    }

    /// Zero then stamp the header; the base timestamp is published last.
    fn initialize_locked(&self, now_us: u64) {
        let header = self.header();
        // a new generation must differ from the one it replaces
        let base_timestamp = now_us.max(header.base_timestamp() + 1);

        header.clear();
        header.set_version(TRANSPORT_VERSION);
        header.set_total_bytes(self.config.total_bytes() as i32);
        header.set_schema_hash(self.config.schema_hash());
        header.set_last_changelog_id(-1);
        header.set_last_update_age(0);
        self.changelog().init(self.pool_size());

        header.set_base_timestamp(base_timestamp);
    }

    /// Stop using the segment. Idempotent.
    pub fn close(&self) {
        self.ready.store(false, Ordering::Release);
        self.mutex.close();
    }
}

impl TransportStream for MemoryTransportStream {
    fn transact(
        &self,
        timeout: Duration,
        f: &mut dyn FnMut(&mut TransportStreamAccessor<'_>),
    ) -> bool {
        let Some(_guard) = InterprocessLockGuard::acquire(&*self.mutex, timeout) else {
            return false;
        };

        if !self.ready.load(Ordering::Acquire) {
            match self.check_or_initialize_locked() {
                AttachOutcome::Compatible => {}
                AttachOutcome::Initialized(reason) => {
                    tracing::info!(name = %self.name, reason = reason, "Initialized segment");
                }
                AttachOutcome::Rejected(reason) => {
                    tracing::debug!(name = %self.name, reason = %reason, "Segment still incompatible");
                    return false;
                }
            }
            self.ready.store(true, Ordering::Release);
        }

        let header = self.header();
        let mut accessor =
            TransportStreamAccessor::new(header, self.changelog(), self.clock.now_us());
        f(&mut accessor);
        header.stamp_update(self.clock.now_us());
        true
    }

    fn peek(&self) -> Option<TransportPeek> {
        let header = self.header();
        let base_timestamp_us = header.base_timestamp();
        if base_timestamp_us == 0 {
            return None;
        }
        Some(TransportPeek {
            base_timestamp_us,
            last_changelog_id: header.last_changelog_id(),
            last_update_age_us: header.last_update_age(),
        })
    }

    fn needs_heartbeat(&self) -> bool {
        let header = self.header();
        header.is_initialized()
            && u64::from(header.age_us(self.clock.now_us())) > HEARTBEAT_INTERVAL.as_micros() as u64
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl std::fmt::Debug for MemoryTransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransportStream")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shm::{HeapRegion, LocalMutex, MemoryRegion};
    use crate::transport::events::{ChangeEventKind, ChangeType};
    use crate::types::{HashValue, ObjectUuid};

    fn config(hash: u64) -> TransportConfig {
        TransportConfig::new(HashValue::new(hash, 0, 0, 0), 256).unwrap()
    }

    /// Region shared by several transports in one test.
    struct SharedHeap(Arc<HeapRegion>);

    impl MemoryRegion for SharedHeap {
        fn size(&self) -> usize {
            self.0.size()
        }

        fn accessor(&self) -> crate::shm::MemoryAccessor<'_> {
            self.0.accessor()
        }
    }

    fn open(
        region: &Arc<HeapRegion>,
        mutex: &Arc<LocalMutex>,
        clock: &Arc<ManualClock>,
        config: TransportConfig,
    ) -> MemoryTransportStream {
        MemoryTransportStream::new(
            "test",
            config,
            Box::new(SharedHeap(Arc::clone(region))),
            Arc::clone(mutex) as Arc<dyn InterprocessMutex>,
            Arc::clone(clock) as Arc<dyn Clock>,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_creator_initializes_header() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        let stream = open(&region, &mutex, &clock, cfg);
        assert!(stream.is_ready());

        let header = TransportHeader::new(region.accessor());
        assert_eq!(header.version(), TRANSPORT_VERSION);
        assert_eq!(header.total_bytes() as usize, cfg.total_bytes());
        assert_eq!(header.schema_hash(), cfg.schema_hash());
        assert_eq!(header.base_timestamp(), clock.now_us());
        assert_eq!(header.last_changelog_id(), -1);
        assert_eq!(stream.peek().unwrap().last_changelog_id, -1);
    }

    #[test]
    fn test_second_attacher_keeps_contents() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        let writer = open(&region, &mutex, &clock, cfg);
        assert!(writer.transact(Duration::from_millis(1), &mut |acc| {
            acc.write_marker(ChangeType::FullUpdate);
        }));

        clock.advance(Duration::from_secs(2));
        let reader = open(&region, &mutex, &clock, cfg);
        assert!(reader.is_ready());
        assert_eq!(reader.peek().unwrap().last_changelog_id, 0);
        assert_eq!(
            reader.peek().unwrap().base_timestamp_us,
            writer.peek().unwrap().base_timestamp_us
        );
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let region = Arc::new(HeapRegion::new_zeroed(config(1).total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        let _writer = open(&region, &mutex, &clock, config(1));
        let reader = open(&region, &mutex, &clock, config(2));
        assert!(!reader.is_ready());
        assert!(!reader.transact(Duration::from_millis(1), &mut |_| {}));
        // the original writer's segment is untouched
        assert_eq!(
            TransportHeader::new(region.accessor()).schema_hash(),
            config(1).schema_hash()
        );
    }

    #[test]
    fn test_newer_major_version_rejected() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        let _writer = open(&region, &mutex, &clock, cfg);
        TransportHeader::new(region.accessor())
            .set_version(((TRANSPORT_VERSION_MAJOR as i32) + 1) << 16);

        let reader = open(&region, &mutex, &clock, cfg);
        assert!(!reader.is_ready());
    }

    #[test]
    fn test_older_major_version_reinitialized() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        let writer = open(&region, &mutex, &clock, cfg);
        let old_generation = writer.peek().unwrap().base_timestamp_us;
        TransportHeader::new(region.accessor()).set_version(0);

        let reader = open(&region, &mutex, &clock, cfg);
        assert!(reader.is_ready());
        let header = TransportHeader::new(region.accessor());
        assert_eq!(header.version(), TRANSPORT_VERSION);
        assert_ne!(header.base_timestamp(), old_generation);
    }

    #[test]
    fn test_expired_segment_reinitialized() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        let writer = open(&region, &mutex, &clock, cfg);
        writer.transact(Duration::from_millis(1), &mut |acc| {
            acc.write_delete(1, ObjectUuid::new(0, 1));
        });
        drop(writer);

        clock.advance(EXPIRE_TIME + Duration::from_secs(1));
        let reader = open(&region, &mutex, &clock, cfg);
        assert!(reader.is_ready());
        let peek = reader.peek().unwrap();
        assert_eq!(peek.last_changelog_id, -1);
        assert_eq!(peek.base_timestamp_us, clock.now_us());
    }

    #[test]
    fn test_stuck_initializer_healed() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        // a creator that died after clearing the header
        let header = TransportHeader::new(region.accessor());
        header.set_version(TRANSPORT_VERSION);
        header.set_base_timestamp(0);

        let stream = open(&region, &mutex, &clock, cfg);
        assert!(stream.is_ready());
        assert!(header.is_initialized());
        assert_eq!(header.schema_hash(), cfg.schema_hash());
    }

    #[test]
    fn test_attach_lock_timeout_then_retry_in_transact() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());

        assert!(mutex.try_lock(Duration::ZERO));
        let stream = open(&region, &mutex, &clock, cfg);
        assert!(!stream.is_ready());
        assert!(stream.peek().is_none());
        assert!(!stream.transact(Duration::from_millis(1), &mut |_| {}));

        mutex.release();
        assert!(stream.transact(Duration::from_millis(1), &mut |_| {}));
        assert!(stream.is_ready());
    }

    #[test]
    fn test_heartbeat_and_transact_refresh() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());
        let stream = open(&region, &mutex, &clock, cfg);

        assert!(!stream.needs_heartbeat());
        clock.advance(Duration::from_millis(1500));
        assert!(stream.needs_heartbeat());

        assert!(stream.transact(Duration::from_millis(1), &mut |_| {}));
        assert!(!stream.needs_heartbeat());
        assert_eq!(stream.peek().unwrap().last_update_age_us, 1_500_000);
    }

    #[test]
    fn test_transact_writes_are_readable() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());
        let stream = open(&region, &mutex, &clock, cfg);

        stream.transact(Duration::from_millis(1), &mut |acc| {
            acc.write_marker(ChangeType::RequestFullUpdate);
            acc.write_marker(ChangeType::FullUpdate);
        });

        let mut seen = Vec::new();
        stream.transact(Duration::from_millis(1), &mut |acc| {
            for id in 0..acc.changelog().count() {
                let event = crate::transport::ChangeEventAccessor::from_memory(
                    acc.changelog().get_by_id(id),
                );
                seen.push(event.change_type());
            }
        });
        assert_eq!(
            seen,
            vec![Some(ChangeType::RequestFullUpdate), Some(ChangeType::FullUpdate)]
        );
        assert_eq!(mutex.acquisition_count(), 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let cfg = config(1);
        let region = Arc::new(HeapRegion::new_zeroed(cfg.total_bytes()));
        let mutex = Arc::new(LocalMutex::new());
        let clock = Arc::new(ManualClock::default());
        let stream = open(&region, &mutex, &clock, cfg);

        stream.close();
        stream.close();
        assert!(!stream.is_ready());
        assert!(!stream.transact(Duration::from_millis(1), &mut |_| {}));
    }
}
