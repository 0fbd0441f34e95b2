// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transports that live on the heap, for peers within one process.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::shm::{HeapRegion, InterprocessMutex, LocalMutex};
use crate::transport::MemoryTransportStream;
use crate::types::TransportConfig;

impl MemoryTransportStream {
    /// Heap-backed transport with its own in-process lock.
    pub fn heap(config: TransportConfig, clock: Arc<dyn Clock>) -> Self {
        Self::heap_with_mutex(config, Arc::new(LocalMutex::new()), clock)
    }

    /// Heap-backed transport using `mutex`, so callers can observe or hold
    /// the lock.
    pub fn heap_with_mutex(
        config: TransportConfig,
        mutex: Arc<dyn InterprocessMutex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let region = HeapRegion::new_zeroed(config.total_bytes());
        Self::new(
            "heap",
            config,
            Box::new(region),
            mutex,
            clock,
            Duration::from_millis(1),
        )
    }
}
