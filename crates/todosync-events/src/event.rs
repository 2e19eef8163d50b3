//! The event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use todosync_types::{EventId, EventKind};

/// One entry in a user's event stream.
///
/// Immutable once appended. Per-session delivery state lives in
/// `event_deliveries`, not on the record itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// User whose stream this event belongs to.
    pub user_id: String,
    /// Gapless, strictly increasing id within the user's stream.
    pub event_id: EventId,
    /// Lifecycle change or notification.
    pub kind: EventKind,
    /// Item snapshot or notification content.
    pub payload: serde_json::Value,
    /// When the event was appended.
    pub created_at: DateTime<Utc>,
}
