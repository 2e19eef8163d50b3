//! Durable, per-user ordered event log for todosync.
//!
//! Every lifecycle change and notification is appended here before anyone
//! is told about it. The log owns three concerns:
//!
//! | Concern | Tables | Entry points |
//! |---------|--------|--------------|
//! | id allocation + storage | `event_streams`, `events` | [`append`], [`head`], [`events_since`] |
//! | per-session bookkeeping | `event_deliveries` | [`mark_delivered`], [`acknowledge`], [`delivery_status`] |
//! | durable sessions | `sessions` | [`open_session`], [`get_session`], [`replay_start`] |
//!
//! Retention is handled by [`expire`]: fully acknowledged events are
//! compacted, and events older than the retention ceiling are dropped even
//! if unacknowledged, flagging the affected sessions for a full resync.
//!
//! # Usage
//!
//! ```rust,ignore
//! let tx = conn.unchecked_transaction()?;
//! let event = todosync_events::append(&tx, "alice", EventKind::Notification, &payload, now)?;
//! tx.commit()?;
//! ```

mod error;
mod event;
mod session;
mod store;

pub use error::EventLogError;
pub use event::Event;
pub use session::{
    acknowledged_after, advance_watermark, first_unacknowledged, get_session, open_session,
    prune_sessions, record_disconnect, replay_start, reset_to_head, resume_session, SessionRecord,
};
pub use store::{
    acknowledge, append, count_since, delivery_status, events_since, expire, head,
    mark_delivered, EventsSince, ExpiryReport,
};
