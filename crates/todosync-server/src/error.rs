//! The error type surfaced by the synchronization core.

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};
use todosync_events::EventLogError;
use todosync_items::{ItemError, LifecycleError};
use todosync_types::{EventId, SessionId};

use crate::connection::DeliveryFailure;

/// Errors from [`SyncCore`](crate::SyncCore) operations.
///
/// Lifecycle rejections (`InvalidTransition`, `StaleRequest`,
/// `VersionConflict`) arrive wrapped in [`SyncError::Item`] and are meant to
/// be shown to the client unchanged. Nothing here is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Item(#[from] ItemError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// A session with this id is already live.
    #[error("session {0} is already connected")]
    DuplicateSession(SessionId),

    /// A connection refused a frame. The session has been deregistered.
    #[error(transparent)]
    DeliveryFailure(#[from] DeliveryFailure),

    /// The session cannot be caught up by replay; the client must refetch
    /// full state. `head` is the stream position the session now sits at.
    #[error("full resync required (head {head})")]
    ResyncRequired { head: EventId },

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// The state machine rejection inside this error, if that is what it is.
    pub fn lifecycle(&self) -> Option<&LifecycleError> {
        match self {
            Self::Item(ItemError::Lifecycle(e)) => Some(e),
            _ => None,
        }
    }

    /// Stable machine-readable label for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Item(ItemError::Lifecycle(LifecycleError::InvalidTransition { .. })) => {
                "invalid_transition"
            }
            Self::Item(ItemError::Lifecycle(LifecycleError::StaleRequest { .. })) => {
                "stale_request"
            }
            Self::Item(ItemError::Lifecycle(LifecycleError::VersionConflict { .. })) => {
                "version_conflict"
            }
            Self::Item(ItemError::NotFound(_)) => "not_found",
            Self::Item(ItemError::AlreadyExists(_)) => "already_exists",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::DeliveryFailure(_) => "delivery_failure",
            Self::ResyncRequired { .. } => "resync_required",
            _ => "internal",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Item(ItemError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Item(ItemError::AlreadyExists(_))
            | Self::Item(ItemError::Lifecycle(LifecycleError::VersionConflict { .. }))
            | Self::Item(ItemError::Lifecycle(LifecycleError::StaleRequest { .. }))
            | Self::DuplicateSession(_)
            | Self::ResyncRequired { .. } => StatusCode::CONFLICT,
            Self::Item(ItemError::Lifecycle(LifecycleError::InvalidTransition { .. })) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Converts a [`SyncError`] into an HTTP error response.
///
/// Server-side failures are logged and their details withheld from the body.
pub fn sync_err_to_response(e: SyncError) -> (StatusCode, Json<Value>) {
    let status = e.status();
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "sync operation failed");
        "internal error".to_string()
    } else {
        e.to_string()
    };

    let mut body = json!({ "error": message, "code": e.code() });
    if let Some(LifecycleError::VersionConflict { actual, .. }) = e.lifecycle() {
        body["currentVersion"] = json!(actual);
    }
    (status, Json(body))
}
