//! Single-item handlers: GET, PUT, DELETE.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::bso::{BsoBody, BsoError};
use crate::server::AppState;
use crate::server::error::AppError;
use crate::server::extract::Preconditions;
use crate::storage::{IncomingBso, StorageBackend};

use super::{
    authenticate, check_collection_name, check_item_id, check_quota, collection_timestamp,
    insert_header, timestamp_response, with_conflict_retry,
};

/// GET /1.5/:uid/storage/:collection/:item - one BSO.
pub(crate) async fn get_item(
    State(state): State<AppState>,
    Path((uid, collection, item)): Path<(u64, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    check_collection_name(&collection)?;
    check_item_id(&item)?;
    let preconditions = Preconditions::from_headers(&headers)?;

    let bso = state
        .storage
        .get_item(uid, &collection, &item)
        .await?
        .ok_or(AppError::NotFound)?;
    preconditions.check(Some(bso.modified))?;

    let modified = bso.modified;
    let mut response = Json(&bso).into_response();
    insert_header(&mut response, "X-Last-Modified", &modified.to_string());
    Ok(response)
}

/// PUT /1.5/:uid/storage/:collection/:item - create or update one BSO.
///
/// Returns the request timestamp as a bare JSON number.
pub(crate) async fn put_item(
    State(state): State<AppState>,
    Path((uid, collection, item)): Path<(u64, String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    check_collection_name(&collection)?;
    check_item_id(&item)?;
    let preconditions = Preconditions::from_headers(&headers)?;

    let record: Value = serde_json::from_str(&body)
        .map_err(|err| AppError::MalformedBody(format!("invalid json in request body: {err}")))?;
    let bso = match BsoBody::from_value(&record, state.settings.limits.max_record_payload_bytes) {
        Ok(bso) => bso,
        // A single oversize record is a 413; everything else is an
        // invalid-BSO 400.
        Err(BsoError::PayloadTooLarge) => return Err(AppError::PayloadTooLarge),
        Err(reason) => return Err(AppError::InvalidBso(reason.to_string())),
    };
    // The body may omit the id; if present it must match the URL.
    if let Some(body_id) = &bso.id
        && body_id != &item
    {
        return Err(AppError::InvalidBso(
            "bso id does not match the url".to_string(),
        ));
    }

    // Hold the collection write lock from the precondition read to the
    // commit, so the frozen timestamp is the one that lands.
    let _guard = state.write_locks.write(uid, &collection).await;
    let collection_ts = collection_timestamp(&state, uid, &collection).await?;
    preconditions.check(collection_ts)?;
    let quota_remaining = check_quota(&state, uid, bso.payload_bytes() as u64).await?;

    let incoming = IncomingBso {
        id: item,
        sortindex: bso.sortindex,
        payload: bso.payload,
        ttl: bso.ttl,
    };
    let ts = state.clock.freeze(uid);
    with_conflict_retry(|| {
        state
            .storage
            .set_items(uid, &collection, vec![incoming.clone()], ts)
    })
    .await?;

    let mut response = timestamp_response(ts);
    if let Some(remaining) = quota_remaining {
        insert_header(&mut response, "X-Weave-Quota-Remaining", &remaining);
    }
    Ok(response)
}

/// DELETE /1.5/:uid/storage/:collection/:item - remove one BSO.
pub(crate) async fn delete_item(
    State(state): State<AppState>,
    Path((uid, collection, item)): Path<(u64, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    check_collection_name(&collection)?;
    check_item_id(&item)?;
    let preconditions = Preconditions::from_headers(&headers)?;
    let _guard = state.write_locks.write(uid, &collection).await;
    let collection_ts = collection_timestamp(&state, uid, &collection).await?;
    preconditions.check(collection_ts)?;

    let ts = state.clock.freeze(uid);
    let removed = with_conflict_retry(|| state.storage.delete_item(uid, &collection, &item, ts))
        .await?;
    if removed.is_none() {
        return Err(AppError::NotFound);
    }
    Ok(timestamp_response(ts))
}
