// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for xrpa.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`.
//!
//! Protocol conditions (lock timeouts, schema mismatch on attach, changelog
//! overflow, allocation failure) are not errors: they surface as `false`,
//! null accessors and log lines. What remains here are setup failures that
//! leave the caller without a usable object.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ObjectUuid;

/// Top-level error type for xrpa.
#[derive(Debug, Error)]
pub enum XrpaError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Shared Memory Errors
    // =========================================================================
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] SharedMemoryError),

    // =========================================================================
    // Reconciler Errors
    // =========================================================================
    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors reject a configuration before anything is mapped.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Changelog size out of bounds: {bytes} bytes (min: {min}, max: {max})")]
    ChangelogSizeOutOfBounds { bytes: u64, min: u64, max: u64 },

    #[error("Invalid schema hash: {reason}")]
    InvalidSchemaHash { reason: String },

    #[error("Duplicate stream name: {name}")]
    DuplicateStreamName { name: String },
}

/// Shared memory setup errors.
#[derive(Debug, Error)]
pub enum SharedMemoryError {
    #[error("Failed to create shared memory region: {name} - {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to open shared memory region: {name} - {reason}")]
    OpenFailed { name: String, reason: String },

    #[error("Failed to map shared memory: {reason}")]
    MapFailed { reason: String },

    #[error("Failed to open lock file {path}: {reason}")]
    LockFileFailed { path: PathBuf, reason: String },

    #[error("Region size out of bounds: {size} bytes (min: {min}, max: {max})")]
    SizeOutOfBounds { size: usize, min: usize, max: usize },
}

/// Errors raised by collection management calls made by application code.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Collection {collection_id} is mirrored from a remote writer; objects cannot be added locally")]
    NotLocallyOwned { collection_id: i32 },

    #[error("Object {id} already exists in collection {collection_id}")]
    DuplicateObject { collection_id: i32, id: ObjectUuid },

    #[error("Collection {collection_id} is already registered")]
    AlreadyRegistered { collection_id: i32 },
}

/// Full-update state machine violations.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition inbound sync state from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Result type alias using XrpaError.
pub type XrpaResult<T> = Result<T, XrpaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "changelog_byte_count",
            context: "stream 'sensors'".to_string(),
        };
        assert!(err.to_string().contains("changelog_byte_count"));
        assert!(err.to_string().contains("sensors"));
    }

    #[test]
    fn test_error_chain() {
        let collection_err = CollectionError::NotLocallyOwned { collection_id: 3 };
        let err: XrpaError = collection_err.into();
        assert!(matches!(err, XrpaError::Collection(_)));
        assert!(err.to_string().contains("3"));
    }
}
