//! Collection cache decorator.
//!
//! `CachedStorage` wraps any [`StorageBackend`] and keeps a small
//! per-user cache object holding `{collection -> (last_modified,
//! count)}`. The hot `info/collections` and precondition paths are
//! served from it; everything else forwards to the inner backend.
//!
//! The same layer hosts the two features that never touch the
//! database: ephemeral collections (held only in memory, bounded per
//! user) and the rolling daily write cap.
//!
//! The cache is advisory; the database stays the source of truth. An
//! entry may be evicted at any time and will be re-loaded on the next
//! read. Ephemeral collection contents share that fate by design.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};

use crate::bso::Bso;
use crate::config::CacheSettings;
use crate::timestamp::Timestamp;

use super::backend::{StorageBackend, StorageError, StorageResult};
use super::types::{
    GetFilters, IncomingBso, OffsetToken, Page, WriteResult, after_token, compare_for_sort,
};

/// Per-collection cached state: last-modified stamp and live count.
type StampMap = HashMap<String, (Timestamp, u64)>;

/// One user's cache object.
#[derive(Default)]
struct UserEntry {
    /// `None` until first loaded from the inner backend.
    stamps: RwLock<Option<StampMap>>,
    /// Ephemeral collections, by name.
    ephemeral: RwLock<HashMap<String, EphemeralCollection>>,
    /// Rolling daily write counter.
    write_window: Mutex<WriteWindow>,
}

/// An in-memory collection: items plus the stamp of the last mutation
/// (so deletes remain observable, same as the tombstone row in SQL).
#[derive(Default)]
struct EphemeralCollection {
    items: HashMap<String, EphemeralItem>,
    last_modified: Timestamp,
}

struct EphemeralItem {
    bso: Bso,
    expires_at: Option<u64>,
}

impl EphemeralItem {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct WriteWindow {
    day: Option<NaiveDate>,
    bytes: u64,
}

/// Caching decorator over a storage backend.
///
/// # Thread Safety
///
/// `CachedStorage` is `Clone`-free but always used behind an `Arc`.
/// Per-user locks are held only to read or update the entry; all inner
/// backend I/O happens outside them.
pub struct CachedStorage {
    inner: Arc<dyn StorageBackend>,
    entries: moka::sync::Cache<u64, Arc<UserEntry>>,
    settings: CacheSettings,
    daily_write_cap_bytes: u64,
}

impl CachedStorage {
    /// Wraps `inner` with the collection cache.
    pub fn new(
        inner: Arc<dyn StorageBackend>,
        settings: CacheSettings,
        daily_write_cap_bytes: u64,
    ) -> Self {
        let mut builder = moka::sync::Cache::builder().max_capacity(settings.max_users);
        if settings.idle_seconds > 0 {
            builder = builder.time_to_idle(Duration::from_secs(settings.idle_seconds));
        }
        Self {
            inner,
            entries: builder.build(),
            settings,
            daily_write_cap_bytes,
        }
    }

    fn entry(&self, user_id: u64) -> Arc<UserEntry> {
        self.entries
            .get_with(user_id, || Arc::new(UserEntry::default()))
    }

    fn is_ephemeral(&self, collection: &str) -> bool {
        self.settings
            .ephemeral_collections
            .iter()
            .any(|name| name == collection)
    }

    /// Returns the user's stamp map, loading it from the inner backend
    /// on a miss.
    async fn stamps(&self, user_id: u64) -> StorageResult<StampMap> {
        let entry = self.entry(user_id);
        if let Some(stamps) = entry.stamps.read().as_ref() {
            return Ok(stamps.clone());
        }
        // Load outside the lock; last concurrent loader wins, and both
        // wrote a snapshot at least as fresh as the miss.
        let timestamps = self.inner.get_collection_timestamps(user_id).await?;
        let counts = self.inner.get_collection_counts(user_id).await?;
        let mut stamps = StampMap::with_capacity(timestamps.len());
        for (name, ts) in timestamps {
            let count = counts.get(&name).copied().unwrap_or(0);
            stamps.insert(name, (ts, count));
        }
        *entry.stamps.write() = Some(stamps.clone());
        Ok(stamps)
    }

    /// Applies a committed write to the cached entry.
    ///
    /// Only a loaded snapshot is patched; a missing one will be
    /// re-read from the database, which is just as correct.
    fn apply_write(&self, user_id: u64, collection: &str, ts: Timestamp, count: u64) {
        let entry = self.entry(user_id);
        let mut stamps = entry.stamps.write();
        if let Some(map) = stamps.as_mut() {
            map.insert(collection.to_string(), (ts, count));
        }
    }

    /// Checks the rolling daily write cap before a write.
    fn check_write_cap(&self, user_id: u64, incoming_bytes: u64) -> StorageResult<()> {
        if self.daily_write_cap_bytes == 0 {
            return Ok(());
        }
        let entry = self.entry(user_id);
        let mut window = entry.write_window.lock();
        let today = Utc::now().date_naive();
        if window.day != Some(today) {
            window.day = Some(today);
            window.bytes = 0;
        }
        if window.bytes.saturating_add(incoming_bytes) > self.daily_write_cap_bytes {
            return Err(StorageError::WriteCapExceeded);
        }
        Ok(())
    }

    fn record_write(&self, user_id: u64, bytes: u64) {
        if self.daily_write_cap_bytes == 0 {
            return;
        }
        let entry = self.entry(user_id);
        let mut window = entry.write_window.lock();
        window.bytes = window.bytes.saturating_add(bytes);
    }

    /// Snapshot of one ephemeral collection's live items.
    fn ephemeral_items(&self, user_id: u64, collection: &str) -> (Vec<Bso>, Option<Timestamp>) {
        let entry = self.entry(user_id);
        let ephemeral = entry.ephemeral.read();
        let Some(coll) = ephemeral.get(collection) else {
            return (Vec::new(), None);
        };
        let now = Timestamp::now().as_centis();
        let items = coll
            .items
            .values()
            .filter(|item| !item.is_expired(now))
            .map(|item| item.bso.clone())
            .collect();
        (items, Some(coll.last_modified))
    }

    fn ephemeral_set_items(
        &self,
        user_id: u64,
        collection: &str,
        items: Vec<IncomingBso>,
        ts: Timestamp,
    ) -> WriteResult {
        let entry = self.entry(user_id);
        let mut ephemeral = entry.ephemeral.write();
        let coll = ephemeral.entry(collection.to_string()).or_default();
        let mut changed: u64 = 0;
        for incoming in items {
            changed += u64::from(upsert_ephemeral(coll, incoming, ts));
        }
        if changed > 0 {
            coll.last_modified = ts;
        }
        // Keep the per-user footprint bounded; oldest rows go first.
        while coll.items.len() > self.settings.ephemeral_max_items {
            let victim = coll
                .items
                .iter()
                .min_by_key(|(id, item)| (item.bso.modified, (*id).clone()))
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    coll.items.remove(&id);
                }
                None => break,
            }
        }
        let now = Timestamp::now().as_centis();
        let count = coll.items.values().filter(|i| !i.is_expired(now)).count() as u64;
        WriteResult { changed, count }
    }

    fn ephemeral_delete_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
        ts: Timestamp,
    ) -> Option<WriteResult> {
        let entry = self.entry(user_id);
        let mut ephemeral = entry.ephemeral.write();
        let coll = ephemeral.get_mut(collection)?;
        let now = Timestamp::now().as_centis();
        let removed = coll
            .items
            .remove(item_id)
            .is_some_and(|item| !item.is_expired(now));
        if !removed {
            return None;
        }
        coll.last_modified = ts;
        let count = coll.items.values().filter(|i| !i.is_expired(now)).count() as u64;
        Some(WriteResult { changed: 1, count })
    }

    fn ephemeral_delete_collection(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
        ts: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        let entry = self.entry(user_id);
        let mut ephemeral = entry.ephemeral.write();
        let Some(coll) = ephemeral.get_mut(collection) else {
            return Ok(None);
        };
        let now = Timestamp::now().as_centis();
        let live: Vec<Bso> = coll
            .items
            .values()
            .filter(|item| !item.is_expired(now))
            .map(|item| item.bso.clone())
            .collect();
        let victims = paginate(live, filters)?.items;
        let changed = victims.len() as u64;
        for bso in victims {
            coll.items.remove(&bso.id);
        }
        coll.last_modified = ts;
        let count = coll.items.values().filter(|i| !i.is_expired(now)).count() as u64;
        Ok(Some(WriteResult { changed, count }))
    }
}

/// Upserts one record into an ephemeral collection, mirroring the
/// column-subset semantics of the relational backend.
fn upsert_ephemeral(coll: &mut EphemeralCollection, incoming: IncomingBso, ts: Timestamp) -> bool {
    let expires_at = incoming
        .ttl
        .map(|ttl| ts.as_centis() + (ttl as u64) * 100);
    match coll.items.get_mut(&incoming.id) {
        None => {
            let bso = Bso {
                id: incoming.id.clone(),
                modified: ts,
                sortindex: incoming.sortindex,
                ttl: incoming.ttl,
                payload: incoming.payload.unwrap_or_default(),
            };
            coll.items
                .insert(incoming.id, EphemeralItem { bso, expires_at });
            true
        }
        Some(existing) => {
            let sortindex_changed =
                incoming.sortindex.is_some() && incoming.sortindex != existing.bso.sortindex;
            let ttl_changed = incoming.ttl.is_some()
                && (incoming.ttl != existing.bso.ttl || expires_at != existing.expires_at);
            if incoming.payload.is_none() && !sortindex_changed && !ttl_changed {
                return false;
            }
            if let Some(payload) = incoming.payload {
                existing.bso.payload = payload;
            }
            if let Some(sortindex) = incoming.sortindex {
                existing.bso.sortindex = Some(sortindex);
            }
            if let Some(ttl) = incoming.ttl {
                existing.bso.ttl = Some(ttl);
                existing.expires_at = expires_at;
            }
            existing.bso.modified = ts;
            true
        }
    }
}

/// In-memory scan: filter, sort, resume, paginate. Produces the same
/// pages (and tokens) as the relational scan so ephemeral collections
/// honour the full query contract.
fn paginate(mut items: Vec<Bso>, filters: &GetFilters) -> StorageResult<Page<Bso>> {
    if let Some(ids) = &filters.ids {
        items.retain(|bso| ids.contains(&bso.id));
    }
    if let Some(newer) = filters.newer {
        items.retain(|bso| bso.modified > newer);
    }
    if let Some(older) = filters.older {
        items.retain(|bso| bso.modified < older);
    }
    if let Some(offset) = &filters.offset {
        let token = OffsetToken::decode(filters.sort, offset).ok_or(StorageError::InvalidOffset)?;
        items.retain(|bso| after_token(filters.sort, &token, bso));
    }
    items.sort_by(|a, b| compare_for_sort(filters.sort, a, b));
    let next_offset = match filters.limit {
        Some(limit) if items.len() > limit => {
            items.truncate(limit);
            items
                .last()
                .map(|last| OffsetToken::for_row(filters.sort, last).encode())
        }
        _ => None,
    };
    Ok(Page { items, next_offset })
}

#[async_trait]
impl StorageBackend for CachedStorage {
    async fn get_collection_timestamps(
        &self,
        user_id: u64,
    ) -> StorageResult<HashMap<String, Timestamp>> {
        let stamps = self.stamps(user_id).await?;
        let mut result: HashMap<String, Timestamp> = stamps
            .into_iter()
            .map(|(name, (ts, _))| (name, ts))
            .collect();
        let entry = self.entry(user_id);
        for (name, coll) in entry.ephemeral.read().iter() {
            if coll.last_modified > Timestamp::default() {
                result.insert(name.clone(), coll.last_modified);
            }
        }
        Ok(result)
    }

    async fn get_collection_counts(&self, user_id: u64) -> StorageResult<HashMap<String, u64>> {
        let stamps = self.stamps(user_id).await?;
        let mut result: HashMap<String, u64> = stamps
            .into_iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(name, (_, count))| (name, count))
            .collect();
        let entry = self.entry(user_id);
        let now = Timestamp::now().as_centis();
        for (name, coll) in entry.ephemeral.read().iter() {
            let count = coll.items.values().filter(|i| !i.is_expired(now)).count() as u64;
            if count > 0 {
                result.insert(name.clone(), count);
            }
        }
        Ok(result)
    }

    async fn get_collection_usage(&self, user_id: u64) -> StorageResult<HashMap<String, u64>> {
        let mut usage = self.inner.get_collection_usage(user_id).await?;
        let entry = self.entry(user_id);
        let now = Timestamp::now().as_centis();
        for (name, coll) in entry.ephemeral.read().iter() {
            let bytes: u64 = coll
                .items
                .values()
                .filter(|i| !i.is_expired(now))
                .map(|i| i.bso.payload.len() as u64)
                .sum();
            if bytes > 0 {
                usage.insert(name.clone(), bytes);
            }
        }
        Ok(usage)
    }

    async fn get_collection_timestamp(
        &self,
        user_id: u64,
        collection: &str,
    ) -> StorageResult<Option<Timestamp>> {
        if self.is_ephemeral(collection) {
            let (_, stamp) = self.ephemeral_items(user_id, collection);
            return Ok(stamp.filter(|ts| *ts > Timestamp::default()));
        }
        Ok(self
            .stamps(user_id)
            .await?
            .get(collection)
            .map(|(ts, _)| *ts))
    }

    async fn get_total_bytes(&self, user_id: u64) -> StorageResult<u64> {
        // Ephemeral data never counts against quota.
        self.inner.get_total_bytes(user_id).await
    }

    async fn get_items(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
    ) -> StorageResult<Page<Bso>> {
        if self.is_ephemeral(collection) {
            let (items, _) = self.ephemeral_items(user_id, collection);
            return paginate(items, filters);
        }
        self.inner.get_items(user_id, collection, filters).await
    }

    async fn get_item_ids(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
    ) -> StorageResult<Page<String>> {
        if self.is_ephemeral(collection) {
            let (items, _) = self.ephemeral_items(user_id, collection);
            let page = paginate(items, filters)?;
            return Ok(Page {
                items: page.items.into_iter().map(|bso| bso.id).collect(),
                next_offset: page.next_offset,
            });
        }
        self.inner.get_item_ids(user_id, collection, filters).await
    }

    async fn get_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Bso>> {
        if self.is_ephemeral(collection) {
            let entry = self.entry(user_id);
            let ephemeral = entry.ephemeral.read();
            let now = Timestamp::now().as_centis();
            return Ok(ephemeral.get(collection).and_then(|coll| {
                coll.items
                    .get(item_id)
                    .filter(|item| !item.is_expired(now))
                    .map(|item| item.bso.clone())
            }));
        }
        self.inner.get_item(user_id, collection, item_id).await
    }

    async fn set_items(
        &self,
        user_id: u64,
        collection: &str,
        items: Vec<IncomingBso>,
        timestamp: Timestamp,
    ) -> StorageResult<WriteResult> {
        let incoming_bytes: u64 = items.iter().map(|i| i.payload_bytes() as u64).sum();
        self.check_write_cap(user_id, incoming_bytes)?;
        let result = if self.is_ephemeral(collection) {
            self.ephemeral_set_items(user_id, collection, items, timestamp)
        } else {
            let result = self
                .inner
                .set_items(user_id, collection, items, timestamp)
                .await?;
            if result.changed > 0 {
                self.apply_write(user_id, collection, timestamp, result.count);
            }
            result
        };
        self.record_write(user_id, incoming_bytes);
        Ok(result)
    }

    async fn delete_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
        timestamp: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        if self.is_ephemeral(collection) {
            return Ok(self.ephemeral_delete_item(user_id, collection, item_id, timestamp));
        }
        let result = self
            .inner
            .delete_item(user_id, collection, item_id, timestamp)
            .await?;
        if let Some(result) = result {
            self.apply_write(user_id, collection, timestamp, result.count);
        }
        Ok(result)
    }

    async fn delete_collection(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
        timestamp: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        if self.is_ephemeral(collection) {
            return self.ephemeral_delete_collection(user_id, collection, filters, timestamp);
        }
        let result = self
            .inner
            .delete_collection(user_id, collection, filters, timestamp)
            .await?;
        if let Some(result) = result {
            self.apply_write(user_id, collection, timestamp, result.count);
        }
        Ok(result)
    }

    async fn delete_storage(&self, user_id: u64) -> StorageResult<()> {
        let result = self.inner.delete_storage(user_id).await;
        // Evict even on failure; a stale entry is worse than a miss.
        self.entries.invalidate(&user_id);
        result
    }

    async fn purge_expired(&self) -> StorageResult<u64> {
        self.inner.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteBackend;

    fn cached(ephemeral: &[&str], cap: u64) -> CachedStorage {
        let inner = Arc::new(SqliteBackend::memory(1).unwrap());
        let settings = CacheSettings {
            ephemeral_collections: ephemeral.iter().map(|s| s.to_string()).collect(),
            ephemeral_max_items: 3,
            ..CacheSettings::default()
        };
        CachedStorage::new(inner, settings, cap)
    }

    fn incoming(id: &str, payload: &str) -> IncomingBso {
        IncomingBso {
            id: id.to_string(),
            sortindex: None,
            payload: Some(payload.to_string()),
            ttl: None,
        }
    }

    fn ts(centis: u64) -> Timestamp {
        Timestamp::from_centis(centis)
    }

    #[tokio::test]
    async fn test_write_updates_cached_stamp() {
        let storage = cached(&[], 0);
        // Prime the cache, then write and read the stamp back without
        // touching the database again.
        assert!(storage.get_collection_timestamps(1).await.unwrap().is_empty());
        storage
            .set_items(1, "bookmarks", vec![incoming("a", "x")], ts(100))
            .await
            .unwrap();
        let stamps = storage.get_collection_timestamps(1).await.unwrap();
        assert_eq!(stamps["bookmarks"], ts(100));
        let counts = storage.get_collection_counts(1).await.unwrap();
        assert_eq!(counts["bookmarks"], 1);
    }

    #[tokio::test]
    async fn test_counts_omit_emptied_collections() {
        let storage = cached(&[], 0);
        storage
            .set_items(1, "bookmarks", vec![incoming("a", "x")], ts(100))
            .await
            .unwrap();
        storage
            .delete_item(1, "bookmarks", "a", ts(200))
            .await
            .unwrap();
        let counts = storage.get_collection_counts(1).await.unwrap();
        assert!(!counts.contains_key("bookmarks"));
        // The delete stamp stays observable.
        let stamps = storage.get_collection_timestamps(1).await.unwrap();
        assert_eq!(stamps["bookmarks"], ts(200));
    }

    #[tokio::test]
    async fn test_ephemeral_collection_never_hits_db() {
        let storage = cached(&["tabs"], 0);
        storage
            .set_items(1, "tabs", vec![incoming("t1", "tab one")], ts(100))
            .await
            .unwrap();
        let bso = storage.get_item(1, "tabs", "t1").await.unwrap().unwrap();
        assert_eq!(bso.payload, "tab one");
        // Nothing reached the database, and quota ignores it.
        assert_eq!(storage.inner.get_total_bytes(1).await.unwrap(), 0);
        assert_eq!(storage.get_total_bytes(1).await.unwrap(), 0);
        // Usage still reports the in-memory bytes.
        let usage = storage.get_collection_usage(1).await.unwrap();
        assert_eq!(usage["tabs"], 7);
    }

    #[tokio::test]
    async fn test_ephemeral_bounded_per_user() {
        let storage = cached(&["tabs"], 0);
        for (i, id) in ["t1", "t2", "t3", "t4"].iter().enumerate() {
            storage
                .set_items(1, "tabs", vec![incoming(id, "x")], ts(100 + i as u64))
                .await
                .unwrap();
        }
        // Bound is 3; the oldest entry was evicted.
        assert!(storage.get_item(1, "tabs", "t1").await.unwrap().is_none());
        assert!(storage.get_item(1, "tabs", "t4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ephemeral_filters_and_delete() {
        let storage = cached(&["tabs"], 0);
        storage
            .set_items(
                1,
                "tabs",
                vec![incoming("t1", "a"), incoming("t2", "b")],
                ts(100),
            )
            .await
            .unwrap();
        let page = storage
            .get_item_ids(1, "tabs", &GetFilters::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);

        let result = storage
            .delete_collection(1, "tabs", &GetFilters::default(), ts(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.changed, 2);
        let stamp = storage.get_collection_timestamp(1, "tabs").await.unwrap();
        assert_eq!(stamp, Some(ts(200)));
    }

    #[tokio::test]
    async fn test_daily_write_cap() {
        let storage = cached(&[], 10);
        storage
            .set_items(1, "bookmarks", vec![incoming("a", "12345678")], ts(100))
            .await
            .unwrap();
        let err = storage
            .set_items(1, "bookmarks", vec![incoming("b", "12345678")], ts(200))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteCapExceeded));
        // Another user is unaffected.
        storage
            .set_items(2, "bookmarks", vec![incoming("a", "12345678")], ts(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_storage_evicts_entry() {
        let storage = cached(&["tabs"], 0);
        storage
            .set_items(1, "bookmarks", vec![incoming("a", "x")], ts(100))
            .await
            .unwrap();
        storage
            .set_items(1, "tabs", vec![incoming("t", "x")], ts(100))
            .await
            .unwrap();
        storage.delete_storage(1).await.unwrap();
        assert!(storage.get_collection_timestamps(1).await.unwrap().is_empty());
        assert!(storage.get_item(1, "tabs", "t").await.unwrap().is_none());
    }
}
