//! `WebSocket` endpoint for chat, presence and domain event delivery.
//!
//! Clients connect to `GET /ws`. The upstream auth layer supplies the
//! principal in the `x-player-id` and `x-username` headers. Once upgraded,
//! the connection is registered with the [`MessagingHub`], which joins it
//! to the player's private `player:<id>` channel.
//!
//! # Client frames
//!
//! ```json
//! {"type": "join", "channel": "alliance:7"}
//! {"type": "leave", "channel": "alliance:7"}
//! {"type": "send", "channel": "alliance:7", "text": "attack at dawn"}
//! {"type": "history", "channel": "alliance:7", "limit": 20}
//! {"type": "online", "channel": "alliance:7"}
//! ```
//!
//! Each frame gets exactly one [`Reply`]. Pushed deliveries
//! (`message`, `presence`, `event`) are interleaved as they happen.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use realm_core::ErrorKind;
use realm_hub::{HubError, MessagingHub};
use realm_types::{ChatMessage, PlayerId, Principal};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::state::AppState;

/// Header carrying the authenticated player id.
pub const PLAYER_ID_HEADER: &str = "x-player-id";

/// Header carrying the authenticated username.
pub const USERNAME_HEADER: &str = "x-username";

/// A request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join a channel.
    Join {
        /// Channel name.
        channel: String,
    },
    /// Leave a channel.
    Leave {
        /// Channel name.
        channel: String,
    },
    /// Post a message.
    Send {
        /// Channel name.
        channel: String,
        /// Message body.
        text: String,
    },
    /// Fetch recent messages.
    History {
        /// Channel name.
        channel: String,
        /// How many; defaults to the configured history size.
        #[serde(default)]
        limit: Option<usize>,
    },
    /// List channel members.
    Online {
        /// Channel name.
        channel: String,
    },
}

/// The answer to one [`ClientFrame`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// A join or leave was processed.
    Ack {
        /// `"join"` or `"leave"`.
        request: &'static str,
        /// Channel name.
        channel: String,
        /// Whether membership changed.
        changed: bool,
    },
    /// A message was accepted.
    Sent {
        /// The stored message.
        message: ChatMessage,
    },
    /// Recent messages, oldest first.
    History {
        /// Channel name.
        channel: String,
        /// The messages.
        messages: Vec<ChatMessage>,
    },
    /// Channel members.
    Online {
        /// Channel name.
        channel: String,
        /// Usernames, sorted.
        users: Vec<String>,
    },
    /// The request failed.
    Error {
        /// Human-readable reason.
        error: String,
        /// `validation`, `transient` or `invariant`.
        kind: &'static str,
    },
}

const fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Transient => "transient",
        ErrorKind::Invariant => "invariant",
    }
}

impl From<HubError> for Reply {
    fn from(err: HubError) -> Self {
        Self::Error {
            kind: kind_name(err.kind()),
            error: err.to_string(),
        }
    }
}

/// Read the principal from the auth headers.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, ServerError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServerError::Unauthorized(format!("missing {name} header")))
    };

    let player_id = header(PLAYER_ID_HEADER)?
        .parse::<PlayerId>()
        .map_err(|e| ServerError::Unauthorized(format!("invalid {PLAYER_ID_HEADER}: {e}")))?;
    let username = header(USERNAME_HEADER)?;
    Ok(Principal::new(player_id, username))
}

/// Apply one client frame to the hub.
pub fn handle_frame(
    hub: &MessagingHub,
    principal: &Principal,
    frame: ClientFrame,
    now: DateTime<Utc>,
) -> Reply {
    let result = match frame {
        ClientFrame::Join { channel } => hub
            .join_channel(principal, &channel, now)
            .map(|changed| Reply::Ack {
                request: "join",
                channel,
                changed,
            }),
        ClientFrame::Leave { channel } => Ok(Reply::Ack {
            request: "leave",
            changed: hub.leave_channel(principal, &channel),
            channel,
        }),
        ClientFrame::Send { channel, text } => hub
            .send_message(principal, &channel, &text, now)
            .map(|message| Reply::Sent { message }),
        ClientFrame::History { channel, limit } => Ok(Reply::History {
            messages: hub.get_recent_messages(
                &channel,
                limit.unwrap_or(hub.config().history_limit),
            ),
            channel,
        }),
        ClientFrame::Online { channel } => Ok(Reply::Online {
            users: hub.get_online_users(&channel),
            channel,
        }),
    };

    result.unwrap_or_else(|err| {
        debug!(username = %principal.username, error = %err, "client request rejected");
        Reply::from(err)
    })
}

/// Upgrade an authenticated request to a `WebSocket` connection.
///
/// # Route
///
/// `GET /ws`
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ServerError> {
    let principal = principal_from_headers(&headers)?;
    let hub = Arc::clone(&state.hub);
    Ok(ws
        .on_upgrade(move |socket| handle_ws(socket, hub, principal))
        .into_response())
}

/// Serialize `value` and send it as a text frame. Returns `false` once
/// the client is gone.
async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    let json = match serde_json::to_string(value) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize WebSocket frame: {e}");
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

/// Handle the `WebSocket` lifecycle: register with the hub, forward
/// deliveries, answer client frames, and unregister on close.
async fn handle_ws(mut socket: WebSocket, hub: Arc<MessagingHub>, principal: Principal) {
    let mut conn = hub.connect(principal.clone(), Utc::now());
    debug!(connection = conn.id, username = %principal.username, "WebSocket client connected");

    loop {
        tokio::select! {
            delivery = conn.deliveries.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                if !send_json(&mut socket, &delivery).await {
                    debug!("WebSocket client disconnected (send failed)");
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => handle_frame(&hub, &principal, frame, Utc::now()),
                            Err(e) => Reply::Error {
                                error: format!("malformed frame: {e}"),
                                kind: kind_name(ErrorKind::Validation),
                            },
                        };
                        if !send_json(&mut socket, &reply).await {
                            debug!("WebSocket client disconnected (send failed)");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            debug!("WebSocket client disconnected (pong failed)");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames carry nothing for us.
                    }
                }
            }
        }
    }

    hub.disconnect(conn.id);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use axum::http::HeaderValue;
    use realm_core::config::ChatConfig;

    use super::*;

    fn headers(player_id: &str, username: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PLAYER_ID_HEADER, HeaderValue::from_str(player_id).unwrap());
        headers.insert(USERNAME_HEADER, HeaderValue::from_str(username).unwrap());
        headers
    }

    #[test]
    fn principal_comes_from_auth_headers() {
        let id = PlayerId::new();
        let principal = principal_from_headers(&headers(&id.to_string(), " alice ")).unwrap();
        assert_eq!(principal, Principal::new(id, "alice"));

        assert!(matches!(
            principal_from_headers(&headers("not-a-uuid", "alice")),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            principal_from_headers(&headers(&id.to_string(), "  ")),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(matches!(
            principal_from_headers(&HeaderMap::new()),
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"send","channel":"global","text":"hi"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Send {
                channel: String::from("global"),
                text: String::from("hi"),
            }
        );
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"history","channel":"global"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::History { limit: None, .. }));
    }

    #[test]
    fn frames_drive_the_hub() {
        let hub = MessagingHub::new(ChatConfig::default());
        let alice = Principal::new(PlayerId::new(), "alice");
        let now = Utc::now();
        let join = ClientFrame::Join {
            channel: String::from("world:1"),
        };

        assert!(matches!(
            handle_frame(&hub, &alice, join.clone(), now),
            Reply::Ack { changed: true, .. }
        ));
        assert!(matches!(
            handle_frame(&hub, &alice, join, now),
            Reply::Ack { changed: false, .. }
        ));

        let send = ClientFrame::Send {
            channel: String::from("world:1"),
            text: String::from("hello"),
        };
        assert!(matches!(handle_frame(&hub, &alice, send, now), Reply::Sent { .. }));

        let history = handle_frame(
            &hub,
            &alice,
            ClientFrame::History {
                channel: String::from("world:1"),
                limit: None,
            },
            now,
        );
        assert!(matches!(history, Reply::History { ref messages, .. } if messages.len() == 1));

        let online = handle_frame(
            &hub,
            &alice,
            ClientFrame::Online {
                channel: String::from("world:1"),
            },
            now,
        );
        assert_eq!(
            online,
            Reply::Online {
                channel: String::from("world:1"),
                users: vec![String::from("alice")],
            }
        );
    }

    #[test]
    fn rejected_frames_report_the_error_kind() {
        let hub = MessagingHub::new(ChatConfig::default());
        let alice = Principal::new(PlayerId::new(), "alice");
        let reply = handle_frame(
            &hub,
            &alice,
            ClientFrame::Send {
                channel: String::from("global"),
                text: String::from("hi"),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "validation");
    }
}
