//! Real-time synchronization server for todo items.
//!
//! The core ([`SyncCore`]) keeps every device of a user consistent: item
//! mutations become entries in a per-user event log, live sessions get them
//! pushed immediately, and offline sessions get them replayed on reconnect.
//! HTTP and WebSocket surfaces are thin layers over the core.

pub mod api_items;
pub mod api_ws;
pub mod background;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod middleware;
pub mod presence;
pub mod reconcile;
pub mod sync;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use todosync_db::DbPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use broadcast::{Broadcaster, PublishReport};
pub use connection::{ChannelConnection, DeliveryFailure, Outbound, SessionConnection, SessionNotice};
pub use error::SyncError;
pub use presence::{LiveSession, PresenceTracker};
pub use reconcile::{Reconciler, Replay};
pub use sync::{ConnectOutcome, Connected, FullState, SyncCore};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The synchronization core.
    pub sync: SyncCore,
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Runs `f` on a pooled connection off the async runtime.
pub(crate) async fn blocking<T, F>(pool: &DbPool, f: F) -> Result<T, SyncError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut *conn)
    })
    .await?
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_sessions": state.sync.presence().live_count().await,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/items",
            post(api_items::create_item_handler).get(api_items::list_items_handler),
        )
        .route("/api/items/{itemId}", get(api_items::get_item_handler))
        .route(
            "/api/items/{itemId}/transition",
            post(api_items::transition_item_handler),
        )
        .route("/api/notifications", post(api_items::notify_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
