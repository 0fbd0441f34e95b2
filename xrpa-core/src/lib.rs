// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Xrpa Core Library
//!
//! Brokerless cross-process object reconciliation. A writer appends typed
//! change records to a changelog placed in a shared memory segment; readers
//! drain it under an interprocess lock and apply the records to collections
//! of reconciled objects. Overflow and writer restarts are healed with a
//! full update from the writer.

pub mod clock;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod shm;
pub mod stats;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigLoader, ReconcilerSettings, StreamConfig, TransportSettings};
pub use error::{
    CollectionError, HardValidationError, SharedMemoryError, StateTransitionError, XrpaError,
    XrpaResult,
};
pub use reconciler::{
    CollectionHandler, DataStoreReconciler, FullUpdateState, ObjectCollection, ObjectUpdate,
    ReconciledObject,
};
pub use shm::{MemoryAccessor, MemoryOffset};
pub use stats::ReconcilerStats;
pub use transport::{MemoryTransportStream, TransportStream, TransportStreamAccessor};
pub use types::{HashValue, ObjectUuid, StreamName, TransportConfig};
