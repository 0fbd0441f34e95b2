// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for identifiers and validated inputs.
//!
//! Every type validates its invariants at creation time, so the transport
//! and reconciler never have to re-check them.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HardValidationError;
use crate::shm::PlacedRingBuffer;
use crate::transport::TransportHeader;

/// Smallest changelog pool that can hold a handful of change records.
pub const MIN_CHANGELOG_BYTES: u32 = 64;
/// Largest changelog pool (256 MB).
pub const MAX_CHANGELOG_BYTES: u32 = 256 * 1024 * 1024;

/// 128-bit object identifier, ordered by `(id0, id1)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectUuid {
    pub id0: u64,
    pub id1: u64,
}

impl ObjectUuid {
    /// Serialized size in a change record.
    pub const BYTE_COUNT: usize = 16;

    pub const fn new(id0: u64, id1: u64) -> Self {
        Self { id0, id1 }
    }

    /// Generate a random (v4) identifier.
    pub fn new_random() -> Self {
        uuid::Uuid::new_v4().into()
    }
}

impl fmt::Display for ObjectUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.id0, self.id1)
    }
}

impl From<uuid::Uuid> for ObjectUuid {
    fn from(value: uuid::Uuid) -> Self {
        let (id0, id1) = value.as_u64_pair();
        Self { id0, id1 }
    }
}

impl From<ObjectUuid> for uuid::Uuid {
    fn from(id: ObjectUuid) -> Self {
        uuid::Uuid::from_u64_pair(id.id0, id.id1)
    }
}

/// 256-bit schema fingerprint.
///
/// Producers and consumers must agree on it before reconciling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HashValue {
    pub value0: u64,
    pub value1: u64,
    pub value2: u64,
    pub value3: u64,
}

impl HashValue {
    /// Serialized size in the transport header.
    pub const BYTE_COUNT: usize = 32;

    pub const fn new(value0: u64, value1: u64, value2: u64, value3: u64) -> Self {
        Self {
            value0,
            value1,
            value2,
            value3,
        }
    }

    /// Fingerprint a schema description with SHA-256.
    pub fn from_schema(schema: &str) -> Self {
        let digest = Sha256::digest(schema.as_bytes());
        let mut bytes = [0u8; Self::BYTE_COUNT];
        bytes.copy_from_slice(&digest);
        Self::from_le_bytes(bytes)
    }

    /// Parse 64 hex characters (the `Display` form).
    pub fn from_hex(text: &str) -> Result<Self, HardValidationError> {
        let decoded = hex::decode(text.trim()).map_err(|e| {
            HardValidationError::InvalidSchemaHash {
                reason: format!("not hex: {}", e),
            }
        })?;

        let bytes: [u8; Self::BYTE_COUNT] =
            decoded
                .try_into()
                .map_err(|v: Vec<u8>| HardValidationError::InvalidSchemaHash {
                    reason: format!("expected {} bytes, got {}", Self::BYTE_COUNT, v.len()),
                })?;

        Ok(Self::from_le_bytes(bytes))
    }

    pub fn from_le_bytes(bytes: [u8; Self::BYTE_COUNT]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        Self::new(word(0), word(1), word(2), word(3))
    }

    pub fn to_le_bytes(&self) -> [u8; Self::BYTE_COUNT] {
        let mut bytes = [0u8; Self::BYTE_COUNT];
        for (i, word) in [self.value0, self.value1, self.value2, self.value3]
            .iter()
            .enumerate()
        {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Low 32 bits, used to suffix segment names.
    pub fn low32(&self) -> u32 {
        self.value0 as u32
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_le_bytes()))
    }
}

/// Immutable per-schema transport configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    schema_hash: HashValue,
    changelog_byte_count: u32,
}

impl TransportConfig {
    /// Create a transport config with bounds validation.
    pub fn new(schema_hash: HashValue, changelog_byte_count: u32) -> Result<Self, HardValidationError> {
        if !(MIN_CHANGELOG_BYTES..=MAX_CHANGELOG_BYTES).contains(&changelog_byte_count) {
            return Err(HardValidationError::ChangelogSizeOutOfBounds {
                bytes: changelog_byte_count as u64,
                min: MIN_CHANGELOG_BYTES as u64,
                max: MAX_CHANGELOG_BYTES as u64,
            });
        }

        Ok(Self {
            schema_hash,
            // the pool is walked in 4-byte steps
            changelog_byte_count: (changelog_byte_count + 3) & !3,
        })
    }

    pub fn schema_hash(&self) -> HashValue {
        self.schema_hash
    }

    pub fn changelog_byte_count(&self) -> u32 {
        self.changelog_byte_count
    }

    /// Total bytes of a transport region: header plus placed changelog.
    pub fn total_bytes(&self) -> usize {
        TransportHeader::BYTE_COUNT
            + PlacedRingBuffer::get_mem_size(self.changelog_byte_count as usize)
    }
}

/// Validated stream (segment) name.
/// Must be non-empty, alphanumeric with hyphens/underscores/dots, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "name",
                value: name,
                reason: "Stream name cannot be empty".to_string(),
            });
        }

        if name.len() > 64 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "name",
                value: name.clone(),
                reason: format!("Stream name too long: {} chars (max 64)", name.len()),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "name",
                value: name,
                reason: "Stream name must contain only ASCII alphanumerics, hyphens, underscores and dots"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for StreamName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(name: StreamName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_uuid_ordering() {
        let a = ObjectUuid::new(1, 100);
        let b = ObjectUuid::new(1, 101);
        let c = ObjectUuid::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, ObjectUuid::new(1, 100));
    }

    #[test]
    fn test_object_uuid_from_uuid() {
        let raw = uuid::Uuid::from_u64_pair(7, 9);
        let id: ObjectUuid = raw.into();
        assert_eq!(id, ObjectUuid::new(7, 9));
        assert_eq!(uuid::Uuid::from(id), raw);
        assert_ne!(ObjectUuid::new_random(), ObjectUuid::new_random());
    }

    #[test]
    fn test_hash_value_hex_round_trip() {
        let hash = HashValue::new(1, 2, 3, u64::MAX);
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(HashValue::from_hex(&text).unwrap(), hash);
    }

    #[test]
    fn test_hash_value_invalid_hex() {
        assert!(HashValue::from_hex("zz").is_err());
        assert!(HashValue::from_hex("abcd").is_err());
    }

    #[test]
    fn test_hash_value_from_schema() {
        let a = HashValue::from_schema("struct A { x: i32 }");
        let b = HashValue::from_schema("struct A { x: f32 }");
        assert_ne!(a, b);
        assert_eq!(a, HashValue::from_schema("struct A { x: i32 }"));
        assert_eq!(a.low32(), a.value0 as u32);
    }

    #[test]
    fn test_transport_config_bounds() {
        let hash = HashValue::default();
        assert!(TransportConfig::new(hash, 0).is_err());
        assert!(TransportConfig::new(hash, MAX_CHANGELOG_BYTES + 1).is_err());

        let config = TransportConfig::new(hash, 1021).unwrap();
        assert_eq!(config.changelog_byte_count(), 1024);
        assert_eq!(config.total_bytes(), 56 + 24 + 1024);
    }

    #[test]
    fn test_stream_name_valid() {
        assert!(StreamName::new("sensors").is_ok());
        assert!(StreamName::new("hand.tracking_v2-out").is_ok());
    }

    #[test]
    fn test_stream_name_invalid() {
        assert!(StreamName::new("").is_err());
        assert!(StreamName::new("a".repeat(65)).is_err());
        assert!(StreamName::new("a/b").is_err());
        assert!(StreamName::new("a b").is_err());
    }
}
