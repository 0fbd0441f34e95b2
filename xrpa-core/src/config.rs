// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Describes where segments live, the timeouts used when talking to them,
//! reconciler limits, and the streams a process opens. Any invalid field
//! results in a HardValidationError before a segment is mapped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, XrpaError, XrpaResult};
use crate::types::{HashValue, StreamName, TransportConfig};

/// Raw transport settings as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawTransportSettings {
    #[serde(default = "default_shm_dir")]
    shm_dir: String,
    #[serde(default = "default_lock_timeout_ms")]
    lock_timeout_ms: u64,
    #[serde(default = "default_attach_timeout_ms")]
    attach_timeout_ms: u64,
}

fn default_shm_dir() -> String {
    "/tmp/xrpa".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    1 // steady-state ticks poll
}

fn default_attach_timeout_ms() -> u64 {
    5000
}

impl Default for RawTransportSettings {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
            attach_timeout_ms: default_attach_timeout_ms(),
        }
    }
}

/// Raw reconciler settings.
#[derive(Debug, Deserialize)]
struct RawReconcilerSettings {
    #[serde(default = "default_message_lifetime_ms")]
    message_lifetime_ms: u64,
    #[serde(default = "default_outbound_message_pool_bytes")]
    outbound_message_pool_bytes: usize,
}

fn default_message_lifetime_ms() -> u64 {
    5000
}

fn default_outbound_message_pool_bytes() -> usize {
    16 * 1024
}

impl Default for RawReconcilerSettings {
    fn default() -> Self {
        Self {
            message_lifetime_ms: default_message_lifetime_ms(),
            outbound_message_pool_bytes: default_outbound_message_pool_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStreamConfig {
    name: String,
    #[serde(default)]
    schema_hash: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    changelog_byte_count: Option<u32>,
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    transport: RawTransportSettings,
    #[serde(default)]
    reconciler: RawReconcilerSettings,
    #[serde(default)]
    streams: Vec<RawStreamConfig>,
}

/// How a process reaches its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Directory holding segment and lock files.
    pub shm_dir: PathBuf,
    /// Lock wait for steady-state ticks.
    pub lock_timeout: Duration,
    /// Lock wait while attaching to a segment.
    pub attach_timeout: Duration,
}

impl TransportSettings {
    pub fn with_shm_dir(shm_dir: impl Into<PathBuf>) -> Self {
        Self {
            shm_dir: shm_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from(default_shm_dir()),
            lock_timeout: Duration::from_millis(default_lock_timeout_ms()),
            attach_timeout: Duration::from_millis(default_attach_timeout_ms()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Inbound messages older than this are dropped.
    pub message_lifetime: Duration,
    /// Size of the arena holding messages between outbound ticks.
    pub outbound_message_pool_bytes: usize,
    /// Lock wait for inbound and outbound transactions.
    pub lock_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            message_lifetime: Duration::from_millis(default_message_lifetime_ms()),
            outbound_message_pool_bytes: default_outbound_message_pool_bytes(),
            lock_timeout: Duration::from_millis(default_lock_timeout_ms()),
        }
    }
}

/// A named stream and the transport layout both ends agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: StreamName,
    pub transport: TransportConfig,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportSettings,
    pub reconciler: ReconcilerSettings,
    pub streams: Vec<StreamConfig>,
}

impl Config {
    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name.as_str() == name)
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> XrpaResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(XrpaError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| XrpaError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> XrpaResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| XrpaError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> XrpaResult<Config> {
        let transport = Self::validate_transport(raw.transport)?;
        let reconciler = Self::validate_reconciler(raw.reconciler, &transport)?;

        let mut streams = Vec::with_capacity(raw.streams.len());
        let mut seen_names = HashSet::new();

        for (index, raw_stream) in raw.streams.into_iter().enumerate() {
            let stream = Self::validate_stream(raw_stream, index)?;

            if !seen_names.insert(stream.name.clone()) {
                return Err(HardValidationError::DuplicateStreamName {
                    name: stream.name.to_string(),
                }
                .into());
            }

            streams.push(stream);
        }

        Ok(Config {
            transport,
            reconciler,
            streams,
        })
    }

    fn validate_transport(raw: RawTransportSettings) -> XrpaResult<TransportSettings> {
        const MAX_ATTACH_TIMEOUT_MS: u64 = 60_000;

        if raw.shm_dir.trim().is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "shm_dir",
                value: raw.shm_dir,
                reason: "Segment directory cannot be empty".to_string(),
            }
            .into());
        }

        if raw.lock_timeout_ms > raw.attach_timeout_ms {
            return Err(HardValidationError::InvalidFieldValue {
                field: "lock_timeout_ms",
                value: raw.lock_timeout_ms.to_string(),
                reason: format!(
                    "Must not exceed attach_timeout_ms ({})",
                    raw.attach_timeout_ms
                ),
            }
            .into());
        }

        if raw.attach_timeout_ms == 0 || raw.attach_timeout_ms > MAX_ATTACH_TIMEOUT_MS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "attach_timeout_ms",
                value: raw.attach_timeout_ms.to_string(),
                reason: format!("Must be between 1 and {}", MAX_ATTACH_TIMEOUT_MS),
            }
            .into());
        }

        Ok(TransportSettings {
            shm_dir: PathBuf::from(raw.shm_dir),
            lock_timeout: Duration::from_millis(raw.lock_timeout_ms),
            attach_timeout: Duration::from_millis(raw.attach_timeout_ms),
        })
    }

    fn validate_reconciler(
        raw: RawReconcilerSettings,
        transport: &TransportSettings,
    ) -> XrpaResult<ReconcilerSettings> {
        const MIN_MESSAGE_POOL_BYTES: usize = 256;

        if raw.outbound_message_pool_bytes < MIN_MESSAGE_POOL_BYTES {
            return Err(HardValidationError::InvalidFieldValue {
                field: "outbound_message_pool_bytes",
                value: raw.outbound_message_pool_bytes.to_string(),
                reason: format!("Must be at least {} bytes", MIN_MESSAGE_POOL_BYTES),
            }
            .into());
        }

        if raw.message_lifetime_ms == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "message_lifetime_ms",
                value: "0".to_string(),
                reason: "Message lifetime must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(ReconcilerSettings {
            message_lifetime: Duration::from_millis(raw.message_lifetime_ms),
            outbound_message_pool_bytes: raw.outbound_message_pool_bytes,
            lock_timeout: transport.lock_timeout,
        })
    }

    fn validate_stream(raw: RawStreamConfig, index: usize) -> XrpaResult<StreamConfig> {
        let context = format!("stream at index {}", index);

        let name = StreamName::new(&raw.name)?;

        let schema_hash = match (raw.schema_hash, raw.schema) {
            (Some(hash), None) => HashValue::from_hex(&hash)?,
            (None, Some(schema)) => HashValue::from_schema(&schema),
            (Some(_), Some(_)) => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "schema_hash",
                    value: name.to_string(),
                    reason: "Specify either schema_hash or schema, not both".to_string(),
                }
                .into())
            }
            (None, None) => {
                return Err(HardValidationError::MissingRequiredField {
                    field: "schema_hash",
                    context,
                }
                .into())
            }
        };

        let changelog_byte_count =
            raw.changelog_byte_count
                .ok_or(HardValidationError::MissingRequiredField {
                    field: "changelog_byte_count",
                    context,
                })?;

        let transport = TransportConfig::new(schema_hash, changelog_byte_count)?;

        Ok(StreamConfig { name, transport })
    }
}
