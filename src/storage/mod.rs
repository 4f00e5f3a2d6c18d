//! Per-user BSO storage service.
//!
//! The service is a thin wrapper over a [`StorageBackend`] trait
//! object. The reference backend is relational
//! ([`sqlite::SqliteBackend`]); the collection cache
//! ([`cache::CachedStorage`]) decorates any backend with the hot-path
//! `info/*` cache, ephemeral collections and the daily write cap.

pub mod backend;
pub mod cache;
pub mod sqlite;
pub mod types;

use std::sync::Arc;

use anyhow::Result;

use crate::config::Settings;

pub use backend::{StorageBackend, StorageError, StorageResult};
pub use cache::CachedStorage;
pub use sqlite::SqliteBackend;
pub use types::{GetFilters, IncomingBso, Page, Sort, WriteResult};

/// High-level storage service handle.
///
/// Wraps a `StorageBackend` implementation and provides a consistent
/// API regardless of the underlying storage mechanism.
///
/// # Thread Safety
///
/// `SyncStorage` is `Clone` and can be shared across tasks. The
/// underlying backend handles concurrent access safely.
#[derive(Clone)]
pub struct SyncStorage {
    backend: Arc<dyn StorageBackend>,
}

impl SyncStorage {
    /// Opens the configured shard databases and layers the collection
    /// cache on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a shard database cannot be opened.
    pub fn open(settings: &Settings) -> Result<Self> {
        let sqlite = Arc::new(SqliteBackend::open(&settings.storage)?);
        let cached = CachedStorage::new(
            sqlite,
            settings.cache.clone(),
            settings.quota.daily_write_cap_bytes,
        );
        Ok(Self {
            backend: Arc::new(cached),
        })
    }

    /// Creates a storage service over in-memory shards.
    ///
    /// Ideal for testing and development; all data is lost when the
    /// process exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory databases cannot be created.
    pub fn memory() -> Result<Self> {
        Self::open(&Settings {
            storage: crate::config::StorageSettings {
                shards: vec![":memory:".to_string()],
                ..crate::config::StorageSettings::default()
            },
            ..Settings::default()
        })
    }

    /// Creates a storage service with a custom backend.
    ///
    /// Use this to layer decorators differently or to plug an
    /// alternative backend behind the same service surface.
    pub fn custom<B: StorageBackend>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Returns the underlying backend handle.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
}

impl std::ops::Deref for SyncStorage {
    type Target = dyn StorageBackend;

    fn deref(&self) -> &Self::Target {
        &*self.backend
    }
}
