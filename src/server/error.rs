//! HTTP error taxonomy.
//!
//! Every failure the pipeline can produce maps to a stable
//! `(status, code)` pair; the response body is the bare integer code as
//! JSON. Codes:
//!
//! | code | meaning                  |
//! |------|--------------------------|
//! | 0    | no specific code (404, 412, 503) |
//! | 1    | invalid protocol usage   |
//! | 2    | invalid id               |
//! | 3    | invalid user             |
//! | 4    | over quota               |
//! | 5    | body parse failure       |
//! | 6    | invalid BSO              |
//! | 7    | no write permission      |
//! | 8    | invalid configuration    |

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::storage::StorageError;
use crate::timestamp::Timestamp;

/// Seconds suggested to clients after a conflicting write.
pub const RETRY_AFTER_SECONDS: u64 = 5;

/// Request pipeline errors with their wire mapping.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Protocol misuse: bad query parameter, bad header, bad offset.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed BSO or collection id in the URL or query string.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Authenticated user does not match the URL user.
    #[error("invalid user")]
    InvalidUser,

    /// Credentials missing or rejected by the auth collaborator.
    #[error("authentication failed")]
    Unauthorized,

    /// Write rejected: the user has no permission for this resource.
    #[error("write not permitted")]
    NotPermitted,

    /// Write would exceed the user's quota.
    #[error("over quota")]
    OverQuota,

    /// Request body is not parseable JSON.
    #[error("malformed body: {0}")]
    MalformedBody(String),

    /// Request body parsed but is not a valid BSO (or BSO list).
    #[error("invalid bso: {0}")]
    InvalidBso(String),

    /// Addressed resource does not exist.
    #[error("not found")]
    NotFound,

    /// `X-If-Modified-Since` satisfied; carries the resource stamp.
    #[error("not modified")]
    NotModified(Timestamp),

    /// `X-If-Unmodified-Since` violated; carries the resource stamp.
    #[error("precondition failed")]
    PreconditionFailed(Timestamp),

    /// Single record payload beyond the configured limit.
    #[error("payload too large")]
    PayloadTooLarge,

    /// POST exceeds max_post_records or max_post_bytes.
    #[error("batch too large: {0}")]
    BatchTooLarge(String),

    /// Backend overloaded or unavailable; clients should retry later.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Unexpected internal failure; details are logged, never sent.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidId(_)
            | Self::InvalidUser
            | Self::MalformedBody(_)
            | Self::InvalidBso(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotPermitted | Self::OverQuota => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotModified(_) => StatusCode::NOT_MODIFIED,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::PayloadTooLarge | Self::BatchTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) | Self::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable integer body code.
    pub fn error_code(&self) -> u8 {
        match self {
            Self::InvalidRequest(_) | Self::BatchTooLarge(_) => 1,
            Self::InvalidId(_) => 2,
            Self::InvalidUser | Self::Unauthorized => 3,
            Self::OverQuota => 4,
            Self::MalformedBody(_) => 5,
            Self::InvalidBso(_) | Self::PayloadTooLarge => 6,
            Self::NotPermitted => 7,
            Self::NotFound
            | Self::NotModified(_)
            | Self::PreconditionFailed(_)
            | Self::Unavailable(_)
            | Self::Internal(_) => 0,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            // Backend details stay in the logs, never on the wire.
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "request rejected");
        }

        let mut response = match &self {
            // 304 carries no body at all.
            Self::NotModified(_) => status.into_response(),
            _ => (
                status,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                self.error_code().to_string(),
            )
                .into_response(),
        };

        match &self {
            Self::NotModified(ts) | Self::PreconditionFailed(ts) => {
                if let Ok(value) = HeaderValue::from_str(&ts.to_string()) {
                    response.headers_mut().insert("X-Last-Modified", value);
                }
            }
            Self::Unavailable(_) => {
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(RETRY_AFTER_SECONDS),
                );
            }
            Self::Internal(_) => {
                response
                    .headers_mut()
                    .insert("X-Weave-Backoff", HeaderValue::from(RETRY_AFTER_SECONDS));
            }
            _ => {}
        }
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(message) => Self::Unavailable(message),
            StorageError::InvalidOffset => {
                Self::InvalidRequest("invalid value for offset".to_string())
            }
            StorageError::WriteCapExceeded => {
                Self::Unavailable("daily write cap exceeded".to_string())
            }
            StorageError::Backend(err) => Self::Internal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::InvalidUser.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::OverQuota.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::PreconditionFailed(Timestamp::default()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            AppError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_stable_codes() {
        assert_eq!(AppError::InvalidId("x".into()).error_code(), 2);
        assert_eq!(AppError::OverQuota.error_code(), 4);
        assert_eq!(AppError::MalformedBody("x".into()).error_code(), 5);
        assert_eq!(AppError::InvalidBso("x".into()).error_code(), 6);
        assert_eq!(AppError::NotPermitted.error_code(), 7);
        assert_eq!(AppError::NotFound.error_code(), 0);
    }

    #[test]
    fn test_conflict_maps_to_unavailable() {
        let err: AppError = StorageError::Conflict("busy".into()).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
