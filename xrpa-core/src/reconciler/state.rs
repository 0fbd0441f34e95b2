// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Inbound full-update state machine with typed state transitions.
//!
//! Implements the resync lifecycle: NotRequested → Requested → Awaiting →
//! NotRequested. While a full update is Requested or Awaiting, inbound
//! object records are discarded. Invalid transitions result in
//! StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;

/// Where the inbound side stands with respect to a full update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FullUpdateState {
    /// Inbound stream is consistent, records are applied.
    NotRequested,

    /// Entries were missed; a RequestFullUpdate marker must be sent.
    Requested,

    /// The request was sent; waiting for the peer's FullUpdate marker.
    Awaiting,
}

impl FullUpdateState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotRequested => "NotRequested",
            Self::Requested => "Requested",
            Self::Awaiting => "Awaiting",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: FullUpdateState) -> bool {
        matches!(
            (self, target),
            // overflow detected
            (Self::NotRequested, Self::Requested) |
            // request marker written
            (Self::Requested, Self::Awaiting) |
            // overflowed again before the answer arrived
            (Self::Awaiting, Self::Requested) |
            // FullUpdate marker received
            (Self::Requested, Self::NotRequested) |
            (Self::Awaiting, Self::NotRequested)
        )
    }

    /// Inbound object records are being dropped.
    pub fn is_discarding(&self) -> bool {
        !matches!(self, Self::NotRequested)
    }
}

impl std::fmt::Display for FullUpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for the inbound stream's resync lifecycle.
#[derive(Debug)]
pub struct FullUpdateStateMachine {
    current_state: FullUpdateState,
    last_transition: Instant,
    transition_count: u64,
}

impl FullUpdateStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: FullUpdateState::NotRequested,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> FullUpdateState {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    /// Staying in the current state is a no-op.
    pub fn transition_to(&mut self, target: FullUpdateState) -> Result<(), StateTransitionError> {
        if self.current_state == target {
            return Ok(());
        }

        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            from = self.current_state.name(),
            to = target.name(),
            "Full update state transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }
}

impl Default for FullUpdateStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
