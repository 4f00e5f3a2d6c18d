//! Authentication collaborator.
//!
//! Real credential checking lives outside this service; the pipeline
//! only needs a stable integer uid per request. Deployments plug in
//! their token verifier through [`Authenticator`]; the bundled
//! [`InsecureAuthenticator`] trusts the uid in the URL and exists for
//! development and tests.

use axum::http::HeaderMap;

use super::error::AppError;

/// Yields the authenticated uid for a request.
///
/// Implementations must be cheap: this runs on every request before
/// any storage work.
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticates the request and returns the caller's uid.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unauthorized`] when credentials are missing
    /// or invalid. The pipeline separately rejects a uid that does not
    /// match the URL path.
    fn authenticate(&self, headers: &HeaderMap, path_uid: u64) -> Result<u64, AppError>;
}

/// Trusts the uid named in the URL path. Development and tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsecureAuthenticator;

impl Authenticator for InsecureAuthenticator {
    fn authenticate(&self, _headers: &HeaderMap, path_uid: u64) -> Result<u64, AppError> {
        Ok(path_uid)
    }
}

/// Fixed-uid authenticator for exercising the uid/path mismatch path
/// in tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthenticator(pub u64);

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, _headers: &HeaderMap, _path_uid: u64) -> Result<u64, AppError> {
        Ok(self.0)
    }
}
