//! HTTP server: routing, shared state and response middleware.
//!
//! The storage protocol rides entirely on the handlers in
//! [`handlers`]; this module wires them into a router, stamps the
//! `X-Weave-Timestamp` header on every response, and runs the listener
//! with graceful shutdown plus the background TTL sweeper.

pub mod auth;
pub mod error;
pub mod extract;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get};

use crate::config::Settings;
use crate::storage::{StorageBackend, SyncStorage};
use crate::timestamp::{Clock, Timestamp};

pub use auth::{Authenticator, InsecureAuthenticator, StaticAuthenticator};
pub use error::AppError;

/// How often the background sweeper removes expired rows.
const PURGE_INTERVAL: Duration = Duration::from_secs(3_600);

/// Per-(user, collection) write locks.
///
/// A write handler holds the lock from the precondition read through
/// the commit, so the timestamp it froze is the one that lands and
/// concurrent writers to the same collection commit in timestamp
/// order. Readers never take it.
#[derive(Default)]
pub struct CollectionLocks {
    locks: dashmap::DashMap<(u64, String), Arc<tokio::sync::Mutex<()>>>,
}

impl CollectionLocks {
    /// Acquires the write lock for one user's collection.
    pub async fn write(&self, uid: u64, collection: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry((uid, collection.to_string()))
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: SyncStorage,
    pub clock: Arc<Clock>,
    pub settings: Arc<Settings>,
    pub authenticator: Arc<dyn Authenticator>,
    pub write_locks: Arc<CollectionLocks>,
}

impl AppState {
    /// Builds the state for a storage service and auth collaborator.
    pub fn new(
        storage: SyncStorage,
        settings: Settings,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            storage,
            clock: Arc::new(Clock::new()),
            settings: Arc::new(settings),
            authenticator,
            write_locks: Arc::new(CollectionLocks::default()),
        }
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.limits.max_request_bytes;
    Router::new()
        .route("/", get(site_root))
        .route("/__lbheartbeat__", get(lbheartbeat))
        .route("/1.5/{uid}/info/collections", get(handlers::info::get_collections))
        .route(
            "/1.5/{uid}/info/collection_counts",
            get(handlers::info::get_collection_counts),
        )
        .route(
            "/1.5/{uid}/info/collection_usage",
            get(handlers::info::get_collection_usage),
        )
        .route("/1.5/{uid}/info/quota", get(handlers::info::get_quota))
        .route(
            "/1.5/{uid}/info/configuration",
            get(handlers::info::get_configuration),
        )
        .route(
            "/1.5/{uid}/storage",
            delete(handlers::collection::delete_storage),
        )
        .route(
            "/1.5/{uid}/storage/{collection}",
            get(handlers::collection::get_collection)
                .post(handlers::collection::post_collection)
                .delete(handlers::collection::delete_collection),
        )
        .route(
            "/1.5/{uid}/storage/{collection}/{item}",
            get(handlers::item::get_item)
                .put(handlers::item::put_item)
                .delete(handlers::item::delete_item),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            weave_headers,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Runs the server until shutdown, with the TTL sweeper alongside.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(state: AppState) -> Result<()> {
    let bind = state.settings.server.bind;
    let sweeper = tokio::spawn(purge_loop(state.storage.clone()));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!(%bind, "syncstore listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    Ok(())
}

/// Response middleware: every response carries `X-Weave-Timestamp`
/// (the later of "now" and whatever `X-Last-Modified` the handler
/// produced), plus the configured backoff hint.
async fn weave_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let arrived = Timestamp::now();
    let mut response = next.run(request).await;

    let last_modified = response
        .headers()
        .get("X-Last-Modified")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Timestamp::parse(value).ok());
    let stamp = last_modified.map_or(arrived, |ts| ts.max(arrived));
    if let Ok(value) = HeaderValue::from_str(&stamp.to_string()) {
        response.headers_mut().insert("X-Weave-Timestamp", value);
    }

    let backoff = state.settings.server.backoff_seconds;
    if backoff > 0 {
        response
            .headers_mut()
            .insert("X-Weave-Backoff", HeaderValue::from(backoff));
    }
    response
}

/// Lazily removes expired rows. Reads already filter them out, so this
/// only reclaims space.
async fn purge_loop(storage: SyncStorage) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        match storage.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "removed expired rows"),
            Err(err) => tracing::warn!(error = %err, "ttl purge failed"),
        }
    }
}

async fn site_root() -> &'static str {
    "It works! syncstore is running on this host.\n"
}

async fn lbheartbeat() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({}))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
}
