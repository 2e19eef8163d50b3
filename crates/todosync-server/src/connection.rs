//! The seam between the synchronization core and a transport.
//!
//! The core never touches sockets. It pushes events and notices into a
//! [`SessionConnection`], and the transport turns them into frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use todosync_events::Event;
use todosync_types::{EventId, SessionId};
use tokio::sync::{mpsc, Notify};

/// A connection refused a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed: {reason}")]
pub struct DeliveryFailure {
    pub reason: String,
}

impl DeliveryFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Out-of-band messages the core sends to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The session is established under `session_id`.
    Hello { session_id: SessionId, resumed: bool },
    /// Replay is impossible; refetch full state. Events after `head` follow.
    ResyncRequired { head: EventId },
}

/// One live connection, as seen by the core.
///
/// Implementations must not block: `send` either queues the frame or fails
/// immediately. A failure makes the core drop the session.
pub trait SessionConnection: Send + Sync {
    /// Queues an event for delivery.
    fn send(&self, event: &Event) -> Result<(), DeliveryFailure>;

    /// Queues a notice for delivery.
    fn notify(&self, notice: SessionNotice) -> Result<(), DeliveryFailure>;

    /// Tears the connection down. Idempotent.
    fn close(&self);
}

/// What a [`ChannelConnection`] hands to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Event),
    Notice(SessionNotice),
}

/// A [`SessionConnection`] backed by a bounded channel.
///
/// The transport owns the receiver and forwards frames to the socket. When
/// the buffer is full the consumer is too slow and the send fails.
#[derive(Clone)]
pub struct ChannelConnection {
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

impl ChannelConnection {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let conn = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(Notify::new()),
        };
        (conn, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`SessionConnection::close`] has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn push(&self, frame: Outbound) -> Result<(), DeliveryFailure> {
        if self.is_closed() {
            return Err(DeliveryFailure::new("connection closed"));
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::new("outbound buffer full"),
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::new("transport gone"),
        })
    }
}

impl SessionConnection for ChannelConnection {
    fn send(&self, event: &Event) -> Result<(), DeliveryFailure> {
        self.push(Outbound::Event(event.clone()))
    }

    fn notify(&self, notice: SessionNotice) -> Result<(), DeliveryFailure> {
        self.push(Outbound::Notice(notice))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
        }
    }
}
