//! Configuration types for the syncstore server.
//!
//! Settings are loaded from a TOML file and validated before the server
//! starts. Sections:
//!
//! - [`ServerSettings`] - bind address and backoff advertisement
//! - [`StorageSettings`] - shard databases and SQLite tuning
//! - [`LimitSettings`] - request and record size limits
//! - [`QuotaSettings`] - per-user quota and daily write cap
//! - [`CacheSettings`] - collection cache sizing and ephemeral collections
//!
//! All types support serde deserialization and default to values
//! suitable for a single-node development deployment.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::bso::valid_collection_name;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Root configuration structure (`syncstore.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub limits: LimitSettings,
    pub quota: QuotaSettings,
    pub cache: CacheSettings,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to bind.
    pub bind: SocketAddr,
    /// Seconds advertised in `X-Weave-Backoff`; 0 disables the header.
    pub backoff_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".parse().expect("static socket address"),
            backoff_seconds: 0,
        }
    }
}

/// Storage backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// One database path per shard; a user lives on shard
    /// `user_id % shards.len()`. `":memory:"` is accepted for tests.
    pub shards: Vec<String>,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Use the fixed id table for well-known collection names.
    pub standard_collections: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            shards: vec!["syncstore0.db".to_string()],
            busy_timeout_ms: 5_000,
            standard_collections: true,
        }
    }
}

/// Request and record size limits, surfaced via `info/configuration`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Maximum payload bytes for a single record.
    pub max_record_payload_bytes: usize,
    /// Maximum records in one POST.
    pub max_post_records: usize,
    /// Maximum summed payload bytes in one POST.
    pub max_post_bytes: usize,
    /// Maximum raw request body size.
    pub max_request_bytes: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_record_payload_bytes: 262_144,
            max_post_records: 100,
            max_post_bytes: 1_048_576,
            max_request_bytes: 2_097_152,
        }
    }
}

/// Quota and write-rate settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Per-user quota in kilobytes; 0 means unlimited.
    pub quota_kb: u64,
    /// Rolling daily cap on written payload bytes per user; 0 disables.
    pub daily_write_cap_bytes: u64,
}

impl QuotaSettings {
    /// Quota in bytes, `None` when unlimited.
    #[must_use]
    pub fn quota_bytes(&self) -> Option<u64> {
        (self.quota_kb > 0).then(|| self.quota_kb * 1024)
    }
}

/// Collection cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of per-user cache entries held at once.
    pub max_users: u64,
    /// Entries idle longer than this are eligible for eviction.
    pub idle_seconds: u64,
    /// Collections held only in memory (canonically `["tabs"]`).
    pub ephemeral_collections: Vec<String>,
    /// Per-user item bound for each ephemeral collection.
    pub ephemeral_max_items: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_users: 10_000,
            idle_seconds: 3_600,
            ephemeral_collections: Vec::new(),
            ephemeral_max_items: 1_000,
        }
    }
}

impl Settings {
    /// Loads settings from the given TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid
    /// TOML.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(settings)
    }

    /// Loads settings from the file if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error only when a present file fails to parse.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails with one or more errors:
    /// - No shard databases configured
    /// - Zero-valued size limits, or limits that contradict each other
    /// - Malformed ephemeral collection names
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.storage.shards.is_empty() {
            errors.push("storage.shards must list at least one database".to_string());
        }
        for (index, shard) in self.storage.shards.iter().enumerate() {
            if shard.is_empty() {
                errors.push(format!("storage.shards[{index}] is empty"));
            }
        }
        if self.storage.busy_timeout_ms == 0 {
            warnings.push(
                "storage.busy_timeout_ms is 0; concurrent writers will fail immediately"
                    .to_string(),
            );
        }

        if self.limits.max_record_payload_bytes == 0 {
            errors.push("limits.max_record_payload_bytes cannot be 0".to_string());
        }
        if self.limits.max_post_records == 0 {
            errors.push("limits.max_post_records cannot be 0".to_string());
        }
        if self.limits.max_post_bytes < self.limits.max_record_payload_bytes {
            errors.push(format!(
                "limits.max_post_bytes ({}) is smaller than max_record_payload_bytes ({})",
                self.limits.max_post_bytes, self.limits.max_record_payload_bytes
            ));
        }
        if self.limits.max_request_bytes < self.limits.max_post_bytes {
            warnings.push(format!(
                "limits.max_request_bytes ({}) is smaller than max_post_bytes ({}); \
                 large batches will be rejected at the transport layer",
                self.limits.max_request_bytes, self.limits.max_post_bytes
            ));
        }

        if self.quota.quota_kb > 0 && self.quota.quota_kb < 1024 {
            warnings.push(format!(
                "quota.quota_kb {} is under 1 MB; clients will hit it almost immediately",
                self.quota.quota_kb
            ));
        }

        if self.cache.max_users == 0 {
            errors.push("cache.max_users cannot be 0".to_string());
        }
        if self.cache.ephemeral_max_items == 0 {
            errors.push("cache.ephemeral_max_items cannot be 0".to_string());
        }
        for name in &self.cache.ephemeral_collections {
            if !valid_collection_name(name) {
                errors.push(format!(
                    "cache.ephemeral_collections contains an invalid name: {name:?}"
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}
