//! WebSocket transport for the synchronization core.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use todosync_types::{EventId, EventKind, SessionId};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::{ChannelConnection, Outbound, SessionConnection, SessionNotice};
use crate::error::SyncError;
use crate::middleware::{user_from_headers, validate_user_id};
use crate::AppState;

/// Capacity of the per-socket channel for transport-level error frames.
const CONTROL_BUFFER: usize = 16;

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// User id, for clients that cannot set headers on the upgrade.
    pub user: Option<String>,
    /// Session to resume.
    pub resume: Option<String>,
}

/// Frames sent by the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    /// The client applied `event_id`.
    Ack {
        #[serde(rename = "eventId")]
        event_id: EventId,
    },
    /// Liveness signal.
    Heartbeat,
}

/// Frames sent by the server.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Hello {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        resumed: bool,
    },
    ResyncRequired {
        head: EventId,
    },
    Event(WsEventPayload),
    Error {
        message: String,
    },
}

/// Event body of an `event` frame.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEventPayload {
    pub event_id: EventId,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: String,
}

impl From<Outbound> for OutgoingMessage {
    fn from(out: Outbound) -> Self {
        match out {
            Outbound::Event(event) => OutgoingMessage::Event(WsEventPayload {
                event_id: event.event_id,
                kind: event.kind,
                payload: event.payload,
                created_at: event.created_at.to_rfc3339(),
            }),
            Outbound::Notice(SessionNotice::Hello {
                session_id,
                resumed,
            }) => OutgoingMessage::Hello {
                session_id,
                resumed,
            },
            Outbound::Notice(SessionNotice::ResyncRequired { head }) => {
                OutgoingMessage::ResyncRequired { head }
            }
        }
    }
}

/// Upgrade handler for `/ws`.
///
/// The user comes from the `user` query parameter or the usual auth headers.
/// A `resume` value that is not a UUID is rejected before the upgrade.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let user = match params.user {
        Some(user) => validate_user_id(user),
        None => user_from_headers(&headers),
    };
    let user = match user {
        Ok(user) => user,
        Err(code) => {
            tracing::warn!("websocket connect without a valid user");
            return code.into_response();
        }
    };

    let resume = match params.resume.as_deref().map(Uuid::parse_str).transpose() {
        Ok(resume) => resume,
        Err(_) => {
            tracing::warn!(user_id = %user, "websocket resume id is not a uuid");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user, resume))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user: String,
    resume: Option<SessionId>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Replay is pushed in one burst before anything drains, so the buffer
    // holds a full backlog plus the hello and resync notices on top of the
    // live allowance.
    let policy = state.sync.policy();
    let capacity = policy
        .outbound_buffer
        .saturating_add(usize::try_from(policy.max_replay_events).unwrap_or(usize::MAX))
        .saturating_add(2)
        .min(tokio::sync::Semaphore::MAX_PERMITS);
    let (connection, mut rx) = ChannelConnection::new(capacity);
    let handle: Arc<dyn SessionConnection> = Arc::new(connection.clone());
    let (ctl_tx, mut ctl_rx) = mpsc::channel::<OutgoingMessage>(CONTROL_BUFFER);

    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(out) = rx.recv() => OutgoingMessage::from(out),
                Some(ctl) = ctl_rx.recv() => ctl,
                else => break,
            };
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("failed to serialize websocket frame: {}", e);
                    continue;
                }
            };
            if sender.send(AxumMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let connected = match state
        .sync
        .on_connect(&user, resume, handle.clone())
        .await
    {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!(user_id = %user, error = %e, "websocket connect rejected");
            let message = match &e {
                SyncError::DuplicateSession(_) => e.to_string(),
                SyncError::DeliveryFailure(_) => "delivery failed during setup".to_string(),
                _ => "internal error".to_string(),
            };
            send_ws_error(&ctl_tx, message);
            drop(ctl_tx);
            connection.close();
            drop(handle);
            drop(connection);
            // Both senders are gone; the forwarder flushes and exits.
            let _ = send_task.await;
            return;
        }
    };
    let session_id = connected.session_id;

    loop {
        tokio::select! {
            _ = connection.closed() => {
                tracing::debug!(session_id = %session_id, "connection closed by core");
                break;
            }
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(AxumMessage::Text(text))) => text,
                    Some(Ok(AxumMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let incoming = match serde_json::from_str::<IncomingMessage>(text.as_str()) {
                    Ok(incoming) => incoming,
                    Err(_) => {
                        send_ws_error(&ctl_tx, "invalid message format".to_string());
                        continue;
                    }
                };
                match incoming {
                    IncomingMessage::Ack { event_id } => {
                        if let Err(e) = state.sync.on_ack(session_id, event_id).await {
                            tracing::error!(session_id = %session_id, event_id, "ack failed: {}", e);
                            send_ws_error(&ctl_tx, "failed to record ack".to_string());
                        }
                    }
                    IncomingMessage::Heartbeat => {
                        if !state.sync.on_heartbeat(session_id).await {
                            tracing::debug!(session_id = %session_id, "heartbeat from evicted session");
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = state.sync.on_disconnect(session_id, &handle).await {
        tracing::error!(session_id = %session_id, "disconnect bookkeeping failed: {}", e);
    }
    send_task.abort();
}

fn send_ws_error(tx: &mpsc::Sender<OutgoingMessage>, message: String) {
    if tx.try_send(OutgoingMessage::Error { message }).is_err() {
        tracing::warn!("dropped websocket error frame, control buffer full");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use todosync_events::Event;

    #[test]
    fn event_frame_uses_wire_names() {
        let event = Event {
            user_id: "alice".into(),
            event_id: 7,
            kind: EventKind::LifecycleChange,
            payload: json!({ "itemId": "i1" }),
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        };
        let frame = serde_json::to_value(OutgoingMessage::from(Outbound::Event(event))).unwrap();
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["eventId"], 7);
        assert_eq!(frame["payload"]["itemId"], "i1");
        assert!(frame["createdAt"].as_str().unwrap().starts_with("2026-01-02T03:04:05"));
        assert!(frame.get("user_id").is_none());
    }

    #[test]
    fn notice_frames_are_tagged() {
        let id = Uuid::new_v4();
        let hello = serde_json::to_value(OutgoingMessage::from(Outbound::Notice(
            SessionNotice::Hello {
                session_id: id,
                resumed: true,
            },
        )))
        .unwrap();
        assert_eq!(hello, json!({ "type": "hello", "sessionId": id, "resumed": true }));

        let resync = serde_json::to_value(OutgoingMessage::from(Outbound::Notice(
            SessionNotice::ResyncRequired { head: 9 },
        )))
        .unwrap();
        assert_eq!(resync, json!({ "type": "resync_required", "head": 9 }));
    }

    #[test]
    fn client_frames_parse() {
        let ack: IncomingMessage = serde_json::from_str(r#"{"type":"ack","eventId":3}"#).unwrap();
        assert!(matches!(ack, IncomingMessage::Ack { event_id: 3 }));

        let hb: IncomingMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(hb, IncomingMessage::Heartbeat));

        assert!(serde_json::from_str::<IncomingMessage>(r#"{"type":"subscribe"}"#).is_err());
    }
}
