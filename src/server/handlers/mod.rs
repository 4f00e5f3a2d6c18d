//! HTTP API handlers, organized by resource.

pub mod collection;
pub mod info;
pub mod item;

use std::time::Duration;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use serde::Serialize;

use crate::storage::{StorageBackend, StorageError};
use crate::timestamp::Timestamp;

use super::AppState;
use super::auth::Authenticator;
use super::error::AppError;

/// Attempts a conflicting write this many times before giving up.
const WRITE_RETRY_ATTEMPTS: u32 = 3;

/// Low-quota threshold below which the remaining space is advertised.
const ONE_MB: u64 = 1024 * 1024;

/// Authenticates the request and enforces that the authenticated uid
/// matches the uid in the URL path.
pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    path_uid: u64,
) -> Result<u64, AppError> {
    let uid = state.authenticator.authenticate(headers, path_uid)?;
    if uid != path_uid {
        return Err(AppError::InvalidUser);
    }
    Ok(uid)
}

/// Validates a collection name from the URL.
pub(crate) fn check_collection_name(name: &str) -> Result<(), AppError> {
    if crate::bso::valid_collection_name(name) {
        Ok(())
    } else {
        Err(AppError::InvalidId(format!("invalid collection: {name:?}")))
    }
}

/// Validates an item id from the URL.
pub(crate) fn check_item_id(id: &str) -> Result<(), AppError> {
    if crate::bso::valid_bso_id(id) {
        Ok(())
    } else {
        Err(AppError::InvalidId(format!("invalid bso id: {id:?}")))
    }
}

/// Reads a collection's last-modified, teaching the clock about it so
/// freshly issued write stamps always land past what storage already
/// holds.
pub(crate) async fn collection_timestamp(
    state: &AppState,
    uid: u64,
    collection: &str,
) -> Result<Option<Timestamp>, AppError> {
    let ts = state
        .storage
        .get_collection_timestamp(uid, collection)
        .await?;
    if let Some(ts) = ts {
        state.clock.observe(uid, ts);
    }
    Ok(ts)
}

/// Runs a storage write, retrying conflicts with jittered exponential
/// backoff. Closely-spaced writers usually succeed on the second try;
/// persistent contention surfaces as 503 with Retry-After.
pub(crate) async fn with_conflict_retry<T, F, Fut>(mut attempt: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay_ms: u64 = 10;
    for _ in 0..WRITE_RETRY_ATTEMPTS {
        match attempt().await {
            Err(StorageError::Conflict(message)) => {
                tracing::debug!(%message, "write conflict, retrying");
                let jitter = rand::thread_rng().gen_range(0..=delay_ms / 2);
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms *= 2;
            }
            other => return other,
        }
    }
    attempt().await
}

/// Enforces the user's quota before a write.
///
/// Returns the `X-Weave-Quota-Remaining` value (kilobytes) when the
/// user is within a megabyte of the limit.
pub(crate) async fn check_quota(
    state: &AppState,
    uid: u64,
    incoming_bytes: u64,
) -> Result<Option<String>, AppError> {
    let Some(quota) = state.settings.quota.quota_bytes() else {
        return Ok(None);
    };
    let used = state.storage.get_total_bytes(uid).await?;
    let left = quota as i64 - used as i64 - incoming_bytes as i64;
    if left <= 0 {
        return Err(AppError::OverQuota);
    }
    if (left as u64) < ONE_MB {
        return Ok(Some(format!("{:.2}", left as f64 / 1024.0)));
    }
    Ok(None)
}

/// 200 response whose body is the timestamp as a bare JSON number,
/// echoed in `X-Last-Modified`.
pub(crate) fn timestamp_response(ts: Timestamp) -> Response {
    let stamp = ts.to_string();
    let mut response = (
        [(header::CONTENT_TYPE.as_str(), "application/json")],
        stamp.clone(),
    )
        .into_response();
    insert_header(&mut response, "X-Last-Modified", &stamp);
    response
}

/// Renders a list endpoint response: JSON array by default, one object
/// per line under `application/newlines`.
pub(crate) fn list_response<T: Serialize>(
    headers: &HeaderMap,
    items: &[T],
    next_offset: Option<&str>,
    last_modified: Option<Timestamp>,
) -> Result<Response, AppError> {
    let wants_newlines = headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("application/newlines"));

    let mut response = if wants_newlines {
        let mut body = String::new();
        for item in items {
            body.push_str(
                &serde_json::to_string(item).map_err(|err| AppError::Internal(err.into()))?,
            );
            body.push('\n');
        }
        (
            [(header::CONTENT_TYPE.as_str(), "application/newlines")],
            body,
        )
            .into_response()
    } else {
        let body =
            serde_json::to_string(items).map_err(|err| AppError::Internal(err.into()))?;
        (
            [(header::CONTENT_TYPE.as_str(), "application/json")],
            body,
        )
            .into_response()
    };

    insert_header(&mut response, "X-Weave-Records", &items.len().to_string());
    if let Some(offset) = next_offset {
        insert_header(&mut response, "X-Weave-Next-Offset", offset);
    }
    if let Some(ts) = last_modified {
        insert_header(&mut response, "X-Last-Modified", &ts.to_string());
    }
    debug_assert_eq!(response.status(), StatusCode::OK);
    Ok(response)
}

/// Inserts a header, skipping values that can't be represented.
pub(crate) fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = axum::http::HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}
