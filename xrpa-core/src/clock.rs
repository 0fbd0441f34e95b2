// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Time source injected into transports and reconcilers.
//!
//! Transports stamp the shared header in microseconds since the UNIX epoch,
//! so every process attached to a segment must agree on the epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in microseconds.
pub trait Clock: Send + Sync {
    /// Current time in microseconds since the UNIX epoch. Never 0.
    fn now_us(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(1)
            .max(1)
    }
}

/// Manually advanced clock for deterministic tests and benches.
#[derive(Debug)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us.max(1)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_us
            .fetch_add(by.as_micros() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, now_us: u64) {
        self.now_us.store(now_us.max(1), Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // an arbitrary, clearly non-zero epoch offset
        Self::new(1_700_000_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }
}
