//! SQLite-backed storage reference implementation.
//!
//! One database per shard; a user's rows all live on shard
//! `user_id % N`. Three tables:
//!
//!   collections:       per-user interning of custom collection names
//!   user_collections:  materialised per-collection last-modified,
//!                      retained as a tombstone when a collection empties
//!   bso:               the items themselves
//!
//! Well-known collection names map to fixed small ids and are never
//! persisted in the interning table.
//!
//! # Async Usage
//!
//! All database operations are blocking. The [`StorageBackend`] impl
//! wraps each one in `spawn_blocking`, which also means a transaction
//! started on behalf of a request runs to completion even if the
//! request future is dropped mid-flight.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::bso::Bso;
use crate::config::StorageSettings;
use crate::timestamp::Timestamp;

use super::backend::{StorageBackend, StorageError, StorageResult};
use super::types::{
    GetFilters, IncomingBso, NULL_SORTINDEX, OffsetToken, Page, Sort, WriteResult,
};

/// Fixed ids for well-known collection names; kept out of the
/// interning table so the hot paths never look them up.
const STANDARD_COLLECTIONS: &[(i64, &str)] = &[
    (1, "clients"),
    (2, "crypto"),
    (3, "forms"),
    (4, "history"),
    (5, "keys"),
    (6, "meta"),
    (7, "bookmarks"),
    (8, "prefs"),
    (9, "tabs"),
    (10, "passwords"),
    (11, "addons"),
];

/// First id handed out to custom collections.
const FIRST_CUSTOM_COLLECTION_ID: i64 = 100;

/// Upsert chunk size inside a write transaction.
const UPSERT_CHUNK: usize = 100;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    user_id        INTEGER NOT NULL,
    collection_id  INTEGER NOT NULL,
    name           TEXT NOT NULL,
    PRIMARY KEY (user_id, collection_id),
    UNIQUE (user_id, name)
);
CREATE TABLE IF NOT EXISTS user_collections (
    user_id        INTEGER NOT NULL,
    collection_id  INTEGER NOT NULL,
    last_modified  INTEGER NOT NULL,
    PRIMARY KEY (user_id, collection_id)
);
CREATE TABLE IF NOT EXISTS bso (
    user_id        INTEGER NOT NULL,
    collection_id  INTEGER NOT NULL,
    id             TEXT NOT NULL,
    modified       INTEGER NOT NULL,
    sortindex      INTEGER,
    ttl            INTEGER,
    ttl_expire_at  INTEGER,
    payload        TEXT NOT NULL DEFAULT '',
    payload_size   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, collection_id, id)
);
CREATE INDEX IF NOT EXISTS idx_bso_modified
    ON bso (user_id, collection_id, modified);
CREATE INDEX IF NOT EXISTS idx_bso_sortindex
    ON bso (user_id, collection_id, sortindex);
";

/// SQLite-backed storage with per-user sharding.
///
/// # Thread Safety
///
/// `SqliteBackend` is `Clone`; each shard connection is guarded by a
/// mutex, which also provides the per-shard write serialisation the
/// concurrency contract requires.
#[derive(Clone)]
pub struct SqliteBackend {
    shards: Vec<Arc<Mutex<Connection>>>,
    standard_collections: bool,
}

impl SqliteBackend {
    /// Opens the configured shard databases, creating files and schema
    /// as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if any shard cannot be opened or initialized.
    pub fn open(settings: &StorageSettings) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !settings.shards.is_empty(),
            "at least one shard database is required"
        );
        let mut shards = Vec::with_capacity(settings.shards.len());
        for path in &settings.shards {
            let connection = open_connection(path, settings.busy_timeout_ms)
                .with_context(|| format!("Failed to open shard database: {path}"))?;
            shards.push(Arc::new(Mutex::new(connection)));
        }
        Ok(Self {
            shards,
            standard_collections: settings.standard_collections,
        })
    }

    /// Opens `shard_count` in-memory shards.
    ///
    /// Ideal for testing and development; all data is lost when the
    /// process exits.
    ///
    /// # Errors
    ///
    /// Returns an error if a database cannot be initialized.
    pub fn memory(shard_count: usize) -> anyhow::Result<Self> {
        let settings = StorageSettings {
            shards: vec![":memory:".to_string(); shard_count.max(1)],
            ..StorageSettings::default()
        };
        Self::open(&settings)
    }

    /// Number of configured shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, user_id: u64) -> Arc<Mutex<Connection>> {
        self.shards[(user_id % self.shards.len() as u64) as usize].clone()
    }
}

/// Opens one shard connection with the pragmas the service relies on.
fn open_connection(path: &str, busy_timeout_ms: u64) -> anyhow::Result<Connection> {
    let connection = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create shard directory for {path}"))?;
        }
        let connection = Connection::open(path)?;
        connection.execute_batch("PRAGMA journal_mode = wal;")?;
        connection
    };
    connection.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    connection.execute_batch(SCHEMA)?;
    Ok(connection)
}

/// Maps a rusqlite error, surfacing contention as a retryable conflict.
fn db_err(err: rusqlite::Error) -> StorageError {
    use rusqlite::ErrorCode;
    if let rusqlite::Error::SqliteFailure(failure, _) = &err
        && matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        )
    {
        return StorageError::Conflict(err.to_string());
    }
    StorageError::Backend(anyhow!(err))
}

fn standard_collection_id(name: &str) -> Option<i64> {
    STANDARD_COLLECTIONS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

fn standard_collection_name(id: i64) -> Option<&'static str> {
    STANDARD_COLLECTIONS
        .iter()
        .find(|(i, _)| *i == id)
        .map(|(_, n)| *n)
}

/// Absolute expiry in centiseconds for a ttl written at `ts`.
fn expiry_at(ts: Timestamp, ttl_seconds: i64) -> i64 {
    ts.as_centis() as i64 + ttl_seconds * 100
}

impl SqliteBackend {
    /// Resolves a collection name to its id for this user, optionally
    /// interning a new one.
    fn collection_id(
        &self,
        conn: &Connection,
        user_id: u64,
        name: &str,
        create: bool,
    ) -> StorageResult<Option<i64>> {
        if self.standard_collections
            && let Some(id) = standard_collection_id(name)
        {
            return Ok(Some(id));
        }
        let existing: Option<i64> = conn
            .query_row(
                "SELECT collection_id FROM collections WHERE user_id = ?1 AND name = ?2",
                params![user_id as i64, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if existing.is_some() || !create {
            return Ok(existing);
        }
        let next: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(collection_id) + 1, ?2) FROM collections WHERE user_id = ?1",
                params![user_id as i64, FIRST_CUSTOM_COLLECTION_ID],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let next = next.max(FIRST_CUSTOM_COLLECTION_ID);
        conn.execute(
            "INSERT INTO collections (user_id, collection_id, name) VALUES (?1, ?2, ?3)",
            params![user_id as i64, next, name],
        )
        .map_err(db_err)?;
        Ok(Some(next))
    }

    /// Resolves collection ids back to names in one query.
    fn collection_names(
        &self,
        conn: &Connection,
        user_id: u64,
        ids: &[i64],
    ) -> StorageResult<HashMap<i64, String>> {
        let mut names = HashMap::with_capacity(ids.len());
        let mut custom = Vec::new();
        for &id in ids {
            if self.standard_collections
                && let Some(name) = standard_collection_name(id)
            {
                names.insert(id, name.to_string());
            } else {
                custom.push(id);
            }
        }
        if !custom.is_empty() {
            let placeholders = vec!["?"; custom.len()].join(",");
            let sql = format!(
                "SELECT collection_id, name FROM collections \
                 WHERE user_id = {} AND collection_id IN ({placeholders})",
                user_id as i64
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params_from_iter(custom.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(db_err)?;
            for row in rows {
                let (id, name) = row.map_err(db_err)?;
                names.insert(id, name);
            }
        }
        Ok(names)
    }

    fn timestamps_sync(&self, user_id: u64) -> StorageResult<HashMap<String, Timestamp>> {
        let shard = self.shard(user_id);
        let conn = shard.lock();
        let mut stmt = conn
            .prepare("SELECT collection_id, last_modified FROM user_collections WHERE user_id = ?1")
            .map_err(db_err)?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map(params![user_id as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(db_err)?
            .collect::<Result<_, _>>()
            .map_err(db_err)?;
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let names = self.collection_names(&conn, user_id, &ids)?;
        let mut stamps = HashMap::with_capacity(rows.len());
        for (id, modified) in rows {
            if let Some(name) = names.get(&id) {
                stamps.insert(name.clone(), Timestamp::from_centis(modified as u64));
            }
        }
        Ok(stamps)
    }

    /// Shared shape of the grouped count/usage queries.
    fn grouped_sync(&self, user_id: u64, aggregate: &str) -> StorageResult<HashMap<String, u64>> {
        let shard = self.shard(user_id);
        let conn = shard.lock();
        let sql = format!(
            "SELECT collection_id, {aggregate} FROM bso \
             WHERE user_id = ?1 AND (ttl_expire_at IS NULL OR ttl_expire_at > ?2) \
             GROUP BY collection_id"
        );
        let now = Timestamp::now().as_centis() as i64;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map(params![user_id as i64, now], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(db_err)?
            .collect::<Result<_, _>>()
            .map_err(db_err)?;
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let names = self.collection_names(&conn, user_id, &ids)?;
        let mut result = HashMap::with_capacity(rows.len());
        for (id, value) in rows {
            if let Some(name) = names.get(&id) {
                result.insert(name.clone(), value.max(0) as u64);
            }
        }
        Ok(result)
    }

    fn collection_timestamp_sync(
        &self,
        user_id: u64,
        collection: &str,
    ) -> StorageResult<Option<Timestamp>> {
        let shard = self.shard(user_id);
        let conn = shard.lock();
        let Some(cid) = self.collection_id(&conn, user_id, collection, false)? else {
            return Ok(None);
        };
        let modified: Option<i64> = conn
            .query_row(
                "SELECT last_modified FROM user_collections \
                 WHERE user_id = ?1 AND collection_id = ?2",
                params![user_id as i64, cid],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(modified.map(|m| Timestamp::from_centis(m as u64)))
    }

    fn total_bytes_sync(&self, user_id: u64) -> StorageResult<u64> {
        let shard = self.shard(user_id);
        let conn = shard.lock();
        let now = Timestamp::now().as_centis() as i64;
        let total: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(payload_size), 0) FROM bso \
                 WHERE user_id = ?1 AND (ttl_expire_at IS NULL OR ttl_expire_at > ?2)",
                params![user_id as i64, now],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(total.max(0) as u64)
    }

    fn page_sync(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
        with_payload: bool,
    ) -> StorageResult<Page<Bso>> {
        let shard = self.shard(user_id);
        let conn = shard.lock();
        let Some(cid) = self.collection_id(&conn, user_id, collection, false)? else {
            return Ok(Page::empty());
        };
        let (sql, values) = build_scan_query(user_id, cid, filters, with_payload)?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let mut items: Vec<Bso> = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(Bso {
                    id: row.get(0)?,
                    modified: Timestamp::from_centis(row.get::<_, i64>(1)? as u64),
                    sortindex: row.get(2)?,
                    ttl: row.get(3)?,
                    payload: if with_payload { row.get(4)? } else { String::new() },
                })
            })
            .map_err(db_err)?
            .collect::<Result<_, _>>()
            .map_err(db_err)?;
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

    fn get_item_sync(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Bso>> {
        let shard = self.shard(user_id);
        let conn = shard.lock();
        let Some(cid) = self.collection_id(&conn, user_id, collection, false)? else {
            return Ok(None);
        };
        let now = Timestamp::now().as_centis() as i64;
        conn.query_row(
            "SELECT id, modified, sortindex, ttl, payload FROM bso \
             WHERE user_id = ?1 AND collection_id = ?2 AND id = ?3 \
             AND (ttl_expire_at IS NULL OR ttl_expire_at > ?4)",
            params![user_id as i64, cid, item_id, now],
            |row| {
                Ok(Bso {
                    id: row.get(0)?,
                    modified: Timestamp::from_centis(row.get::<_, i64>(1)? as u64),
                    sortindex: row.get(2)?,
                    ttl: row.get(3)?,
                    payload: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn set_items_sync(
        &self,
        user_id: u64,
        collection: &str,
        items: Vec<IncomingBso>,
        ts: Timestamp,
    ) -> StorageResult<WriteResult> {
        let shard = self.shard(user_id);
        let mut guard = shard.lock();
        let tx = guard.transaction().map_err(db_err)?;
        let cid = self
            .collection_id(&tx, user_id, collection, true)?
            .ok_or_else(|| StorageError::Backend(anyhow!("failed to intern collection")))?;

        let mut changed: u64 = 0;
        for chunk in items.chunks(UPSERT_CHUNK) {
            for item in chunk {
                changed += u64::from(upsert_item(&tx, user_id, cid, item, ts)?);
            }
        }
        if changed > 0 {
            stamp_collection(&tx, user_id, cid, ts)?;
        }
        let count = live_count(&tx, user_id, cid)?;
        tx.commit().map_err(db_err)?;
        Ok(WriteResult { changed, count })
    }

    fn delete_item_sync(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
        ts: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        let shard = self.shard(user_id);
        let mut guard = shard.lock();
        let tx = guard.transaction().map_err(db_err)?;
        let Some(cid) = self.collection_id(&tx, user_id, collection, false)? else {
            return Ok(None);
        };
        let now = Timestamp::now().as_centis() as i64;
        let removed = tx
            .execute(
                "DELETE FROM bso WHERE user_id = ?1 AND collection_id = ?2 AND id = ?3 \
                 AND (ttl_expire_at IS NULL OR ttl_expire_at > ?4)",
                params![user_id as i64, cid, item_id, now],
            )
            .map_err(db_err)?;
        if removed == 0 {
            return Ok(None);
        }
        stamp_collection(&tx, user_id, cid, ts)?;
        let count = live_count(&tx, user_id, cid)?;
        tx.commit().map_err(db_err)?;
        Ok(Some(WriteResult { changed: 1, count }))
    }

    fn delete_collection_sync(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
        ts: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        let shard = self.shard(user_id);
        let mut guard = shard.lock();
        let tx = guard.transaction().map_err(db_err)?;
        let Some(cid) = self.collection_id(&tx, user_id, collection, false)? else {
            return Ok(None);
        };
        let unfiltered = filters.ids.is_none()
            && filters.newer.is_none()
            && filters.older.is_none()
            && filters.limit.is_none()
            && filters.offset.is_none();
        let changed = if unfiltered {
            tx.execute(
                "DELETE FROM bso WHERE user_id = ?1 AND collection_id = ?2",
                params![user_id as i64, cid],
            )
            .map_err(db_err)?
        } else {
            let (select, values) = build_scan_query(user_id, cid, filters, false)?;
            let sql = format!(
                "DELETE FROM bso WHERE user_id = {} AND collection_id = {cid} \
                 AND id IN (SELECT id FROM ({select}))",
                user_id as i64
            );
            tx.execute(&sql, params_from_iter(values.iter()))
                .map_err(db_err)?
        };
        // The tombstone stamp is what lets clients observe the delete
        // even after the collection empties.
        stamp_collection(&tx, user_id, cid, ts)?;
        let count = live_count(&tx, user_id, cid)?;
        tx.commit().map_err(db_err)?;
        Ok(Some(WriteResult {
            changed: changed as u64,
            count,
        }))
    }

    fn delete_storage_sync(&self, user_id: u64) -> StorageResult<()> {
        let shard = self.shard(user_id);
        let mut guard = shard.lock();
        let tx = guard.transaction().map_err(db_err)?;
        for table in ["bso", "user_collections", "collections"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE user_id = ?1"),
                params![user_id as i64],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn purge_expired_sync(&self) -> StorageResult<u64> {
        let now = Timestamp::now().as_centis() as i64;
        let mut purged: u64 = 0;
        for shard in &self.shards {
            let conn = shard.lock();
            purged += conn
                .execute(
                    "DELETE FROM bso WHERE ttl_expire_at IS NOT NULL AND ttl_expire_at <= ?1",
                    params![now],
                )
                .map_err(db_err)? as u64;
        }
        Ok(purged)
    }
}

/// Inserts or updates one row; returns whether anything changed.
///
/// Updates touch only the columns the client supplied. `modified`
/// refreshes when payload is present, or when sortindex/ttl is present
/// and actually differs from the stored value.
fn upsert_item(
    conn: &Connection,
    user_id: u64,
    cid: i64,
    item: &IncomingBso,
    ts: Timestamp,
) -> StorageResult<bool> {
    let existing: Option<(Option<i32>, Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT sortindex, ttl, ttl_expire_at FROM bso \
             WHERE user_id = ?1 AND collection_id = ?2 AND id = ?3",
            params![user_id as i64, cid, item.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;

    let new_expiry = item.ttl.map(|ttl| expiry_at(ts, ttl));
    let Some((old_sortindex, old_ttl, old_expiry)) = existing else {
        let payload = item.payload.as_deref().unwrap_or("");
        conn.execute(
            "INSERT INTO bso (user_id, collection_id, id, modified, sortindex, ttl, \
             ttl_expire_at, payload, payload_size) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user_id as i64,
                cid,
                item.id,
                ts.as_centis() as i64,
                item.sortindex,
                item.ttl,
                new_expiry,
                payload,
                payload.len() as i64,
            ],
        )
        .map_err(db_err)?;
        return Ok(true);
    };

    let sortindex_changed = item.sortindex.is_some() && item.sortindex != old_sortindex;
    let ttl_changed = item.ttl.is_some() && (item.ttl != old_ttl || new_expiry != old_expiry);
    if item.payload.is_none() && !sortindex_changed && !ttl_changed {
        return Ok(false);
    }

    let mut assignments = vec!["modified = ?".to_string()];
    let mut values: Vec<SqlValue> = vec![SqlValue::Integer(ts.as_centis() as i64)];
    if let Some(payload) = &item.payload {
        assignments.push("payload = ?".to_string());
        values.push(SqlValue::Text(payload.clone()));
        assignments.push("payload_size = ?".to_string());
        values.push(SqlValue::Integer(payload.len() as i64));
    }
    if let Some(sortindex) = item.sortindex {
        assignments.push("sortindex = ?".to_string());
        values.push(SqlValue::Integer(i64::from(sortindex)));
    }
    if let Some(ttl) = item.ttl {
        assignments.push("ttl = ?".to_string());
        values.push(SqlValue::Integer(ttl));
        assignments.push("ttl_expire_at = ?".to_string());
        values.push(SqlValue::Integer(new_expiry.unwrap_or_default()));
    }
    values.push(SqlValue::Integer(user_id as i64));
    values.push(SqlValue::Integer(cid));
    values.push(SqlValue::Text(item.id.clone()));
    let sql = format!(
        "UPDATE bso SET {} WHERE user_id = ? AND collection_id = ? AND id = ?",
        assignments.join(", ")
    );
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(db_err)?;
    Ok(true)
}

fn stamp_collection(
    conn: &Connection,
    user_id: u64,
    cid: i64,
    ts: Timestamp,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO user_collections (user_id, collection_id, last_modified) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT (user_id, collection_id) \
         DO UPDATE SET last_modified = excluded.last_modified",
        params![user_id as i64, cid, ts.as_centis() as i64],
    )
    .map_err(db_err)?;
    Ok(())
}

fn live_count(conn: &Connection, user_id: u64, cid: i64) -> StorageResult<u64> {
    let now = Timestamp::now().as_centis() as i64;
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM bso WHERE user_id = ?1 AND collection_id = ?2 \
             AND (ttl_expire_at IS NULL OR ttl_expire_at > ?3)",
            params![user_id as i64, cid, now],
            |row| row.get(0),
        )
        .map_err(db_err)?;
    Ok(count.max(0) as u64)
}

/// Builds the filtered, ordered scan for a collection.
///
/// Fetches `limit + 1` rows when a limit is set so the caller can tell
/// a full final page from a truncated one.
fn build_scan_query(
    user_id: u64,
    cid: i64,
    filters: &GetFilters,
    with_payload: bool,
) -> StorageResult<(String, Vec<SqlValue>)> {
    let columns = if with_payload {
        "id, modified, sortindex, ttl, payload"
    } else {
        "id, modified, sortindex, ttl"
    };
    let mut sql = format!(
        "SELECT {columns} FROM bso WHERE user_id = ? AND collection_id = ? \
         AND (ttl_expire_at IS NULL OR ttl_expire_at > ?)"
    );
    let mut values: Vec<SqlValue> = vec![
        SqlValue::Integer(user_id as i64),
        SqlValue::Integer(cid),
        SqlValue::Integer(Timestamp::now().as_centis() as i64),
    ];

    if let Some(ids) = &filters.ids {
        let placeholders = vec!["?"; ids.len()].join(",");
        sql.push_str(&format!(" AND id IN ({placeholders})"));
        values.extend(ids.iter().map(|id| SqlValue::Text(id.clone())));
    }
    if let Some(newer) = filters.newer {
        sql.push_str(" AND modified > ?");
        values.push(SqlValue::Integer(newer.as_centis() as i64));
    }
    if let Some(older) = filters.older {
        sql.push_str(" AND modified < ?");
        values.push(SqlValue::Integer(older.as_centis() as i64));
    }

    if let Some(offset) = &filters.offset {
        let token = OffsetToken::decode(filters.sort, offset).ok_or(StorageError::InvalidOffset)?;
        let modified = token.modified as i64;
        match filters.sort {
            Sort::Newest => {
                sql.push_str(" AND (modified < ? OR (modified = ? AND id > ?))");
                values.push(SqlValue::Integer(modified));
                values.push(SqlValue::Integer(modified));
                values.push(SqlValue::Text(token.id));
            }
            Sort::Oldest => {
                sql.push_str(" AND (modified > ? OR (modified = ? AND id > ?))");
                values.push(SqlValue::Integer(modified));
                values.push(SqlValue::Integer(modified));
                values.push(SqlValue::Text(token.id));
            }
            Sort::Index => {
                sql.push_str(&format!(
                    " AND (COALESCE(sortindex, {NULL_SORTINDEX}) < ? \
                     OR (COALESCE(sortindex, {NULL_SORTINDEX}) = ? \
                     AND (modified < ? OR (modified = ? AND id > ?))))"
                ));
                let anchor = token.sortindex.unwrap_or(NULL_SORTINDEX);
                values.push(SqlValue::Integer(anchor));
                values.push(SqlValue::Integer(anchor));
                values.push(SqlValue::Integer(modified));
                values.push(SqlValue::Integer(modified));
                values.push(SqlValue::Text(token.id));
            }
        }
    }

    match filters.sort {
        Sort::Newest => sql.push_str(" ORDER BY modified DESC, id ASC"),
        Sort::Oldest => sql.push_str(" ORDER BY modified ASC, id ASC"),
        Sort::Index => sql.push_str(&format!(
            " ORDER BY COALESCE(sortindex, {NULL_SORTINDEX}) DESC, modified DESC, id ASC"
        )),
    }
    if let Some(limit) = filters.limit {
        sql.push_str(" LIMIT ?");
        values.push(SqlValue::Integer(limit as i64 + 1));
    }
    Ok((sql, values))
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get_collection_timestamps(
        &self,
        user_id: u64,
    ) -> StorageResult<HashMap<String, Timestamp>> {
        let backend = self.clone();
        run_blocking(move || backend.timestamps_sync(user_id)).await
    }

    async fn get_collection_counts(&self, user_id: u64) -> StorageResult<HashMap<String, u64>> {
        let backend = self.clone();
        run_blocking(move || backend.grouped_sync(user_id, "COUNT(*)")).await
    }

    async fn get_collection_usage(&self, user_id: u64) -> StorageResult<HashMap<String, u64>> {
        let backend = self.clone();
        run_blocking(move || backend.grouped_sync(user_id, "COALESCE(SUM(payload_size), 0)")).await
    }

    async fn get_collection_timestamp(
        &self,
        user_id: u64,
        collection: &str,
    ) -> StorageResult<Option<Timestamp>> {
        let backend = self.clone();
        let collection = collection.to_string();
        run_blocking(move || backend.collection_timestamp_sync(user_id, &collection)).await
    }

    async fn get_total_bytes(&self, user_id: u64) -> StorageResult<u64> {
        let backend = self.clone();
        run_blocking(move || backend.total_bytes_sync(user_id)).await
    }

    async fn get_items(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
    ) -> StorageResult<Page<Bso>> {
        let backend = self.clone();
        let collection = collection.to_string();
        let filters = filters.clone();
        run_blocking(move || backend.page_sync(user_id, &collection, &filters, true)).await
    }

    async fn get_item_ids(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
    ) -> StorageResult<Page<String>> {
        let backend = self.clone();
        let collection = collection.to_string();
        let filters = filters.clone();
        let page =
            run_blocking(move || backend.page_sync(user_id, &collection, &filters, false)).await?;
        Ok(Page {
            items: page.items.into_iter().map(|bso| bso.id).collect(),
            next_offset: page.next_offset,
        })
    }

    async fn get_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Bso>> {
        let backend = self.clone();
        let collection = collection.to_string();
        let item_id = item_id.to_string();
        run_blocking(move || backend.get_item_sync(user_id, &collection, &item_id)).await
    }

    async fn set_items(
        &self,
        user_id: u64,
        collection: &str,
        items: Vec<IncomingBso>,
        timestamp: Timestamp,
    ) -> StorageResult<WriteResult> {
        let backend = self.clone();
        let collection = collection.to_string();
        run_blocking(move || backend.set_items_sync(user_id, &collection, items, timestamp)).await
    }

    async fn delete_item(
        &self,
        user_id: u64,
        collection: &str,
        item_id: &str,
        timestamp: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        let backend = self.clone();
        let collection = collection.to_string();
        let item_id = item_id.to_string();
        run_blocking(move || backend.delete_item_sync(user_id, &collection, &item_id, timestamp))
            .await
    }

    async fn delete_collection(
        &self,
        user_id: u64,
        collection: &str,
        filters: &GetFilters,
        timestamp: Timestamp,
    ) -> StorageResult<Option<WriteResult>> {
        let backend = self.clone();
        let collection = collection.to_string();
        let filters = filters.clone();
        run_blocking(move || {
            backend.delete_collection_sync(user_id, &collection, &filters, timestamp)
        })
        .await
    }

    async fn delete_storage(&self, user_id: u64) -> StorageResult<()> {
        let backend = self.clone();
        run_blocking(move || backend.delete_storage_sync(user_id)).await
    }

    async fn purge_expired(&self) -> StorageResult<u64> {
        let backend = self.clone();
        run_blocking(move || backend.purge_expired_sync()).await
    }
}

/// Runs a blocking closure on the tokio blocking pool.
async fn run_blocking<T, F>(op: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StorageError::Backend(anyhow!("task join error: {err}")))?
}
