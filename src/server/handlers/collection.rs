//! Collection handlers: range reads, batch writes, deletes, and the
//! whole-user delete.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

use crate::bso::{BsoBody, BsoError};
use crate::server::AppState;
use crate::server::error::AppError;
use crate::server::extract::{Preconditions, parse_filters};
use crate::storage::{IncomingBso, StorageBackend, StorageError};

use super::{
    authenticate, check_collection_name, check_quota, collection_timestamp, insert_header,
    list_response, timestamp_response, with_conflict_retry,
};

/// Body of a batch POST response.
#[derive(Debug, Default, Serialize)]
struct PostResults {
    success: Vec<String>,
    failed: HashMap<String, Vec<String>>,
}

/// GET /1.5/:uid/storage/:collection - ids, or full BSOs with `full`.
pub(crate) async fn get_collection(
    State(state): State<AppState>,
    Path((uid, collection)): Path<(u64, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    check_collection_name(&collection)?;
    let (filters, full) = parse_filters(&query)?;
    let preconditions = Preconditions::from_headers(&headers)?;
    let collection_ts = collection_timestamp(&state, uid, &collection).await?;
    preconditions.check(collection_ts)?;

    // A collection that has never been written yields an empty list,
    // not a 404, and carries no X-Last-Modified.
    if full {
        let page = state.storage.get_items(uid, &collection, &filters).await?;
        list_response(
            &headers,
            &page.items,
            page.next_offset.as_deref(),
            collection_ts,
        )
    } else {
        let page = state
            .storage
            .get_item_ids(uid, &collection, &filters)
            .await?;
        list_response(
            &headers,
            &page.items,
            page.next_offset.as_deref(),
            collection_ts,
        )
    }
}

/// POST /1.5/:uid/storage/:collection - batch upsert with
/// partial-success semantics.
pub(crate) async fn post_collection(
    State(state): State<AppState>,
    Path((uid, collection)): Path<(u64, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    check_collection_name(&collection)?;
    let preconditions = Preconditions::from_headers(&headers)?;

    let records: Vec<Value> = serde_json::from_str(&body)
        .map_err(|err| AppError::MalformedBody(format!("invalid json in request body: {err}")))?;
    let limits = &state.settings.limits;
    if records.len() > limits.max_post_records {
        return Err(AppError::BatchTooLarge(format!(
            "cannot process more than {} records in one request",
            limits.max_post_records
        )));
    }

    let mut results = PostResults::default();
    let mut valid: Vec<IncomingBso> = Vec::with_capacity(records.len());
    let mut total_bytes: usize = 0;
    for record in &records {
        let failed_key = || {
            record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        match BsoBody::from_value(record, limits.max_record_payload_bytes) {
            Err(reason) => {
                results
                    .failed
                    .entry(failed_key())
                    .or_default()
                    .push(reason.to_string());
            }
            Ok(bso) => match bso.id.clone() {
                None => {
                    results
                        .failed
                        .entry(String::new())
                        .or_default()
                        .push(BsoError::InvalidId.to_string());
                }
                Some(id) => {
                    total_bytes += bso.payload_bytes();
                    valid.push(IncomingBso {
                        id,
                        sortindex: bso.sortindex,
                        payload: bso.payload,
                        ttl: bso.ttl,
                    });
                }
            },
        }
    }
    if total_bytes > limits.max_post_bytes {
        return Err(AppError::BatchTooLarge(format!(
            "request exceeds {} bytes of payload",
            limits.max_post_bytes
        )));
    }

    // Hold the collection write lock from the precondition read to the
    // commit, so the frozen timestamp is the one that lands.
    let _guard = state.write_locks.write(uid, &collection).await;
    let collection_ts = collection_timestamp(&state, uid, &collection).await?;
    preconditions.check(collection_ts)?;

    // An empty batch is a successful no-op: no timestamp is frozen and
    // the collection does not advance.
    if valid.is_empty() {
        return Ok(Json(&results).into_response());
    }

    let quota_remaining = check_quota(&state, uid, total_bytes as u64).await?;
    let ts = state.clock.freeze(uid);
    let write = with_conflict_retry(|| {
        state
            .storage
            .set_items(uid, &collection, valid.clone(), ts)
    })
    .await;

    let mut response = match write {
        Ok(_) => {
            results.success.extend(valid.into_iter().map(|bso| bso.id));
            let mut response = Json(&results).into_response();
            insert_header(&mut response, "X-Last-Modified", &ts.to_string());
            response
        }
        Err(err @ (StorageError::Conflict(_) | StorageError::WriteCapExceeded)) => {
            return Err(err.into());
        }
        Err(StorageError::InvalidOffset) => return Err(AppError::from(StorageError::InvalidOffset)),
        Err(StorageError::Backend(err)) => {
            // The transaction rolled back; report every in-flight id so
            // the client can retry them.
            tracing::error!(error = %err, "batch write failed");
            for bso in valid {
                results
                    .failed
                    .entry(bso.id)
                    .or_default()
                    .push("db error".to_string());
            }
            Json(&results).into_response()
        }
    };
    if let Some(remaining) = quota_remaining {
        insert_header(&mut response, "X-Weave-Quota-Remaining", &remaining);
    }
    Ok(response)
}

/// DELETE /1.5/:uid/storage/:collection - delete items selected by the
/// filter set, or the whole collection.
pub(crate) async fn delete_collection(
    State(state): State<AppState>,
    Path((uid, collection)): Path<(u64, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    check_collection_name(&collection)?;
    let (filters, _) = parse_filters(&query)?;
    let preconditions = Preconditions::from_headers(&headers)?;
    let _guard = state.write_locks.write(uid, &collection).await;
    let collection_ts = collection_timestamp(&state, uid, &collection).await?;
    preconditions.check(collection_ts)?;

    let ts = state.clock.freeze(uid);
    // Deleting a collection that has never existed is not an error.
    with_conflict_retry(|| {
        state
            .storage
            .delete_collection(uid, &collection, &filters, ts)
    })
    .await?;
    Ok(timestamp_response(ts))
}

/// DELETE /1.5/:uid/storage - wipe the user, guarded by
/// X-Confirm-Delete.
pub(crate) async fn delete_storage(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    if headers.get("X-Confirm-Delete").is_none() {
        return Err(AppError::InvalidRequest(
            "deleting all storage requires X-Confirm-Delete: 1".to_string(),
        ));
    }
    with_conflict_retry(|| state.storage.delete_storage(uid)).await?;
    Ok(Json(serde_json::json!({})).into_response())
}
