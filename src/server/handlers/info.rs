//! `info/*` handlers: collection summaries, quota and server limits.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::server::AppState;
use crate::server::error::AppError;
use crate::server::extract::Preconditions;
use crate::storage::StorageBackend;
use crate::timestamp::Timestamp;

use super::{authenticate, insert_header};

const ONE_KB: f64 = 1024.0;

/// GET /1.5/:uid/info/collections - last-modified per collection.
pub(crate) async fn get_collections(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    let preconditions = Preconditions::from_headers(&headers)?;
    let stamps = state.storage.get_collection_timestamps(uid).await?;
    let storage_ts = stamps.values().copied().max();
    preconditions.check(storage_ts)?;

    let mut response = Json(&stamps).into_response();
    insert_header(&mut response, "X-Weave-Records", &stamps.len().to_string());
    if let Some(ts) = storage_ts {
        insert_header(&mut response, "X-Last-Modified", &ts.to_string());
    }
    Ok(response)
}

/// GET /1.5/:uid/info/collection_counts - live item count per collection.
pub(crate) async fn get_collection_counts(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    let preconditions = Preconditions::from_headers(&headers)?;
    preconditions.check(storage_timestamp(&state, uid).await?)?;
    let counts = state.storage.get_collection_counts(uid).await?;
    let mut response = Json(&counts).into_response();
    insert_header(&mut response, "X-Weave-Records", &counts.len().to_string());
    Ok(response)
}

/// GET /1.5/:uid/info/collection_usage - stored kilobytes per collection.
pub(crate) async fn get_collection_usage(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    let preconditions = Preconditions::from_headers(&headers)?;
    preconditions.check(storage_timestamp(&state, uid).await?)?;
    let usage: HashMap<String, f64> = state
        .storage
        .get_collection_usage(uid)
        .await?
        .into_iter()
        .map(|(name, bytes)| (name, bytes as f64 / ONE_KB))
        .collect();
    let mut response = Json(&usage).into_response();
    insert_header(&mut response, "X-Weave-Records", &usage.len().to_string());
    Ok(response)
}

/// GET /1.5/:uid/info/quota - `[used_kb, quota_kb|null]`.
pub(crate) async fn get_quota(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let uid = authenticate(&state, &headers, uid)?;
    let used_kb = state.storage.get_total_bytes(uid).await? as f64 / ONE_KB;
    let quota_kb = state
        .settings
        .quota
        .quota_bytes()
        .map(|bytes| bytes as f64 / ONE_KB);
    Ok(Json(json!([used_kb, quota_kb])).into_response())
}

/// GET /1.5/:uid/info/configuration - limits clients must respect.
pub(crate) async fn get_configuration(
    State(state): State<AppState>,
    Path(uid): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authenticate(&state, &headers, uid)?;
    let limits = &state.settings.limits;
    Ok(Json(json!({
        "max_record_payload_bytes": limits.max_record_payload_bytes,
        "max_post_records": limits.max_post_records,
        "max_post_bytes": limits.max_post_bytes,
        "max_request_bytes": limits.max_request_bytes,
        "max_id_length": crate::bso::MAX_ID_LENGTH,
    }))
    .into_response())
}

/// Storage-level last-modified: the max across all collections.
async fn storage_timestamp(state: &AppState, uid: u64) -> Result<Option<Timestamp>, AppError> {
    Ok(state
        .storage
        .get_collection_timestamps(uid)
        .await?
        .values()
        .copied()
        .max())
}
