//! CRUD surface over the synchronization core.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use todosync_items::Item;
use todosync_types::ItemStatus;

use crate::error::sync_err_to_response;
use crate::middleware::UserContext;
use crate::sync::FullState;
use crate::AppState;

/// Longest accepted item id.
const MAX_ITEM_ID_LEN: usize = 128;

/// Largest accepted notification body, serialized (16 KiB).
const MAX_NOTIFICATION_BYTES: usize = 16 * 1024;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message, "code": "bad_request" })),
    )
}

fn validate_item_id(item_id: &str) -> Result<(), ApiError> {
    if item_id.is_empty() || item_id.len() > MAX_ITEM_ID_LEN {
        return Err(bad_request("item_id must be 1-128 bytes"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateItemRequest {
    pub item_id: String,
    /// Client time of creation. Defaults to the server clock.
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionItemRequest {
    pub target: ItemStatus,
    pub expected_version: i64,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub content: Value,
}

/// `POST /api/items`
pub async fn create_item_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user)): Extension<UserContext>,
    Json(payload): Json<CreateItemRequest>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    validate_item_id(&payload.item_id)?;
    let created_at = payload.created_at.unwrap_or_else(Utc::now);

    let item = state
        .sync
        .create_item(&user, &payload.item_id, created_at)
        .await
        .map_err(sync_err_to_response)?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// `GET /api/items`: full state for a resync.
pub async fn list_items_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user)): Extension<UserContext>,
) -> Result<Json<FullState>, ApiError> {
    let full = state
        .sync
        .full_state(&user)
        .await
        .map_err(sync_err_to_response)?;
    Ok(Json(full))
}

/// `GET /api/items/{itemId}`
pub async fn get_item_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user)): Extension<UserContext>,
    Path(item_id): Path<String>,
) -> Result<Json<Item>, ApiError> {
    validate_item_id(&item_id)?;
    let item = state
        .sync
        .get_item(&user, &item_id)
        .await
        .map_err(sync_err_to_response)?;
    Ok(Json(item))
}

/// `POST /api/items/{itemId}/transition`
pub async fn transition_item_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user)): Extension<UserContext>,
    Path(item_id): Path<String>,
    Json(payload): Json<TransitionItemRequest>,
) -> Result<Json<Item>, ApiError> {
    validate_item_id(&item_id)?;
    let item = state
        .sync
        .submit_transition(
            &user,
            &item_id,
            payload.target,
            payload.expected_version,
            payload.requested_at,
        )
        .await
        .map_err(sync_err_to_response)?;
    Ok(Json(item))
}

/// `POST /api/notifications`: queues a notification for the caller's devices.
pub async fn notify_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user)): Extension<UserContext>,
    Json(payload): Json<NotifyRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if payload.content.to_string().len() > MAX_NOTIFICATION_BYTES {
        return Err(bad_request("notification content too large"));
    }

    let event = state
        .sync
        .notify(&user, payload.content)
        .await
        .map_err(sync_err_to_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "event_id": event.event_id })),
    ))
}
