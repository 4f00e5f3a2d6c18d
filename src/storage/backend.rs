//! Backend trait for the sync storage service.
//!
//! Defines the interface every storage backend must implement. The
//! reference implementation is relational ([`super::sqlite`]); the
//! collection cache ([`super::cache`]) is a decorator over the same
//! trait, not a sibling backend.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::bso::Bso;
use crate::timestamp::Timestamp;

use super::types::{GetFilters, IncomingBso, Page, WriteResult};

/// Storage errors the pipeline reacts to individually.
///
/// `Conflict` is retried with backoff before surfacing as 503;
/// `InvalidOffset` is a client fault; everything else is an opaque
/// backend failure reported as service-unavailable.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Lock contention or a busy database; safe to retry.
    #[error("storage conflict: {0}")]
    Conflict(String),
    /// Continuation token the backend cannot decode.
    #[error("invalid offset token")]
    InvalidOffset,
    /// The user's daily write allowance is exhausted.
    #[error("daily write cap exceeded")]
    WriteCapExceeded,
    /// Any other backend failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Backend trait for per-user BSO storage.
///
/// All operations are scoped to a single `user_id`; there are no
/// cross-user queries. Backends must be thread-safe (`Send + Sync`) for
/// use with tokio, and must guarantee that a batch write is applied
/// atomically: concurrent readers observe either the pre- or
/// post-commit state, never a mix.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Returns `{collection name -> last-modified}` for the user,
    /// including tombstone stamps of emptied collections.
    async fn get_collection_timestamps(
        &self,
        user_id: u64,
    ) -> StorageResult<HashMap<String, Timestamp>>;

    /// Returns `{collection name -> live item count}`; emptied
    /// collections are omitted.
    async fn get_collection_counts(&self, user_id: u64) -> StorageResult<HashMap<String, u64>>;

    /// Returns `{collection name -> stored payload bytes}` for live
    /// items.
    async fn get_collection_usage(&self, user_id: u64) -> StorageResult<HashMap<String, u64>>;

    /// Returns the last-modified of one collection, `None` if it has
    /// never been written.
    async fn get_collection_timestamp(
        &self,
        user_id: u64,
        collection: &str,
    ) -> StorageResult<Option<Timestamp>>;

    /// Returns the user's total live payload bytes.
    async fn get_total_bytes(&self, user_id: u64) -> StorageResult<u64>;

    /// Returns one page of full items matching the filters.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidOffset`] for an undecodable
    /// continuation token.
    async fn get_items(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
    ) -> StorageResult<Page<Bso>>;

    /// Returns one page of item ids matching the filters.
    async fn get_item_ids(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
    ) -> StorageResult<Page<String>>;

    /// Returns a single live item.
    async fn get_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Bso>>;

    /// Applies a batch of upserts in input order, all stamped with
    /// `timestamp`, inside one transaction. Advances the collection
    /// last-modified iff at least one row changed.
    async fn set_items(
        &self,
        user_id: u64,
        collection: &str,
        items: Vec<IncomingBso>,
        timestamp: Timestamp,
    ) -> StorageResult<WriteResult>;

    /// Deletes one item; `None` when it did not exist. A successful
    /// delete stamps the collection with `timestamp`.
    async fn delete_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
        timestamp: Timestamp,
    ) -> StorageResult<Option<WriteResult>>;

    /// Deletes the items selected by `filters` (the whole collection
    /// when the filter set is empty); `None` when the collection has
    /// never existed. The collection's tombstone stamp is set to
    /// `timestamp` so clients can observe the deletion.
    async fn delete_collection(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
        timestamp: Timestamp,
    ) -> StorageResult<Option<WriteResult>>;

    /// Removes every trace of the user in a single transaction.
    async fn delete_storage(&self, user_id: u64) -> StorageResult<()>;

    /// Lazily removes expired rows; returns how many were purged.
    /// Correctness never depends on this running.
    async fn purge_expired(&self) -> StorageResult<u64>;
}
