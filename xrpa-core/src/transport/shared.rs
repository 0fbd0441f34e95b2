// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transports over named file-backed segments.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::TransportSettings;
use crate::error::SharedMemoryError;
use crate::shm::{FileLockMutex, InterprocessMutex, SharedMemoryRegion};
use crate::transport::header::TRANSPORT_VERSION_MAJOR;
use crate::transport::MemoryTransportStream;
use crate::types::{StreamName, TransportConfig};

/// File name of the segment for `name`.
///
/// The protocol major version and the low 32 bits of the schema hash are
/// part of the name, so builds that could never talk to each other map to
/// different segments instead of rejecting each other on attach.
pub fn segment_name(name: &StreamName, config: &TransportConfig) -> String {
    format!(
        "{}_v{}_{:08x}",
        name,
        TRANSPORT_VERSION_MAJOR,
        config.schema_hash().low32()
    )
}

impl MemoryTransportStream {
    /// Open or create the segment for `name` under `settings.shm_dir`.
    ///
    /// # Errors
    /// Returns SharedMemoryError if the segment or its lock file cannot be
    /// opened. Incompatible segments are not errors: the transport is
    /// returned but stays not ready.
    pub fn open_shared(
        name: &StreamName,
        config: TransportConfig,
        settings: &TransportSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SharedMemoryError> {
        let segment = segment_name(name, &config);
        let lock_path = settings.shm_dir.join(format!("{}.lock", segment));

        let mutex = FileLockMutex::open(lock_path)?;
        let region =
            SharedMemoryRegion::open_or_create(&settings.shm_dir, &segment, config.total_bytes())?;

        tracing::debug!(
            name = %name,
            segment = %segment,
            created = region.created(),
            "Opening shared transport"
        );

        Ok(Self::new(
            segment,
            config,
            Box::new(region),
            Arc::new(mutex) as Arc<dyn InterprocessMutex>,
            clock,
            settings.attach_timeout,
        ))
    }
}
