//! Error types for item lifecycle operations.

use chrono::{DateTime, Utc};
use todosync_types::ItemStatus;

/// Semantic rejections from the state machine.
///
/// All variants are client-correctable and are surfaced verbatim; none is
/// retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The requested edge is not in the transition table.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: ItemStatus,
        /// Requested status.
        to: ItemStatus,
    },

    /// `requested_at` predates the moment the current status was entered.
    #[error("stale request: {status} was entered at {entered_at}, request is from {requested_at}")]
    StaleRequest {
        /// Current status.
        status: ItemStatus,
        /// When the current status was entered.
        entered_at: DateTime<Utc>,
        /// The rejected request time.
        requested_at: DateTime<Utc>,
    },

    /// The caller's view of the item is out of date.
    #[error("version conflict: expected {expected}, current is {actual}")]
    VersionConflict {
        /// Version the caller based its edit on.
        expected: i64,
        /// Version currently persisted.
        actual: i64,
    },
}

/// Errors from item persistence.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("item already exists: {0}")]
    AlreadyExists(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
