//! Request metadata parsing: precondition headers and query filters.

use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::bso::valid_bso_id;
use crate::storage::{GetFilters, Sort};
use crate::timestamp::Timestamp;

use super::error::AppError;

/// Maximum ids accepted in the `ids` query parameter.
pub const MAX_IDS_PER_REQUEST: usize = 100;

/// Parsed `X-If-Modified-Since` / `X-If-Unmodified-Since` headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preconditions {
    pub if_modified_since: Option<Timestamp>,
    pub if_unmodified_since: Option<Timestamp>,
}

impl Preconditions {
    /// Extracts and validates the precondition headers.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable values or when both headers
    /// appear on one request.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let parse = |name: &str| -> Result<Option<Timestamp>, AppError> {
            match headers.get(name) {
                None => Ok(None),
                Some(value) => {
                    let value = value.to_str().map_err(|_| {
                        AppError::InvalidRequest(format!("bad value for {name}"))
                    })?;
                    Timestamp::parse(value)
                        .map(Some)
                        .map_err(|_| AppError::InvalidRequest(format!("bad value for {name}")))
                }
            }
        };
        let if_modified_since = parse("X-If-Modified-Since")?;
        let if_unmodified_since = parse("X-If-Unmodified-Since")?;
        if if_modified_since.is_some() && if_unmodified_since.is_some() {
            return Err(AppError::InvalidRequest(
                "cannot specify both X-If-Modified-Since and X-If-Unmodified-Since".to_string(),
            ));
        }
        Ok(Self {
            if_modified_since,
            if_unmodified_since,
        })
    }

    /// Checks the preconditions against the addressed resource's
    /// last-modified time (`None` when the resource has never been
    /// written, which always passes).
    ///
    /// # Errors
    ///
    /// [`AppError::NotModified`] when the modified-since check short
    /// circuits the read, [`AppError::PreconditionFailed`] when the
    /// resource moved past the unmodified-since stamp.
    pub fn check(&self, resource_ts: Option<Timestamp>) -> Result<(), AppError> {
        if let Some(since) = self.if_modified_since
            && let Some(ts) = resource_ts
            && ts <= since
        {
            return Err(AppError::NotModified(ts));
        }
        if let Some(since) = self.if_unmodified_since
            && let Some(ts) = resource_ts
            && ts > since
        {
            return Err(AppError::PreconditionFailed(ts));
        }
        Ok(())
    }
}

/// Parses the collection filter set from the raw query parameters.
///
/// Returns the filters plus the `full` flag. Unknown parameters are
/// ignored, matching the original service.
///
/// # Errors
///
/// Returns an error for malformed timestamps, a non-positive or
/// non-numeric limit, an unknown sort, too many ids, or an invalid id.
pub fn parse_filters(query: &HashMap<String, String>) -> Result<(GetFilters, bool), AppError> {
    let mut filters = GetFilters::default();

    if let Some(ids) = query.get("ids") {
        let ids: Vec<String> = ids.split(',').map(|id| id.trim().to_string()).collect();
        if ids.len() > MAX_IDS_PER_REQUEST {
            return Err(AppError::InvalidRequest(format!(
                "cannot process more than {MAX_IDS_PER_REQUEST} ids at a time"
            )));
        }
        for id in &ids {
            if !valid_bso_id(id) {
                return Err(AppError::InvalidId(format!("invalid bso id: {id:?}")));
            }
        }
        filters.ids = Some(ids);
    }
    if let Some(newer) = query.get("newer") {
        filters.newer = Some(
            Timestamp::parse(newer)
                .map_err(|_| AppError::InvalidRequest(format!("invalid value for newer: {newer:?}")))?,
        );
    }
    if let Some(older) = query.get("older") {
        filters.older = Some(
            Timestamp::parse(older)
                .map_err(|_| AppError::InvalidRequest(format!("invalid value for older: {older:?}")))?,
        );
    }
    if let Some(sort) = query.get("sort") {
        filters.sort = Sort::parse(sort)
            .ok_or_else(|| AppError::InvalidRequest(format!("invalid value for sort: {sort:?}")))?;
    }
    if let Some(limit) = query.get("limit") {
        let limit: usize = limit
            .parse()
            .ok()
            .filter(|l| *l > 0)
            .ok_or_else(|| AppError::InvalidRequest(format!("invalid value for limit: {limit:?}")))?;
        filters.limit = Some(limit);
    }
    // Offset is opaque here; the backend rejects tokens it can't decode.
    if let Some(offset) = query.get("offset") {
        filters.offset = Some(offset.clone());
    }

    let full = query.contains_key("full");
    Ok((filters, full))
}
