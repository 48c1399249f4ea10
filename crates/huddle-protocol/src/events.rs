//! Event types for the Huddle protocol.
//!
//! Events are the fundamental unit of communication in Huddle. Each event
//! has a kebab-case name and a payload, serialized as
//! `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// Current protocol version, reported in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;

/// Connect-time credential sent in-band when the transport handshake
/// carried none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatePayload {
    /// Bearer token.
    pub token: String,
}

/// Identity announced by a client when it enters the global room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub user_id: String,
    pub username: String,
}

/// Group typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub username: String,
}

/// Private-room typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateTypingPayload {
    pub room_id: String,
    pub username: String,
}

/// A message relayed into a private room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessagePayload {
    pub room_id: String,
    /// Opaque message body, relayed verbatim.
    pub message: Value,
}

/// Read receipt, both inbound and as the `message-read` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    pub message_id: String,
    pub user_id: String,
}

/// Reaction, both inbound and as the `message-reacted` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactPayload {
    pub message_id: String,
    pub user_id: String,
    pub reaction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSeenPayload {
    pub user_id: String,
}

/// Presence notification carried by `user-joined` and `user-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub username: String,
}

/// Kind of a human-readable group notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Join,
    Leave,
}

/// Human-readable join/leave notice for the global room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub user_id: String,
    pub username: String,
    pub message: String,
}

impl NotificationPayload {
    /// Notice for a user entering the group chat.
    #[must_use]
    pub fn joined(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            kind: NotificationKind::Join,
            user_id: user_id.into(),
            message: format!("{username} joined the group chat."),
            username,
        }
    }

    /// Notice for a user leaving the group chat.
    #[must_use]
    pub fn left(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            kind: NotificationKind::Leave,
            user_id: user_id.into(),
            message: format!("{username} left the group chat."),
            username,
        }
    }
}

/// Sent once after the connection is authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
    pub version: u8,
}

/// Error notice sent to a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

/// Events sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// In-band credential for transports that cannot carry a header.
    Authenticate(AuthenticatePayload),
    /// Enter the global room and go online.
    Join(JoinPayload),
    TypingGroup(TypingPayload),
    StopTypingGroup(TypingPayload),
    TypingPrivate(PrivateTypingPayload),
    StopTypingPrivate(PrivateTypingPayload),
    /// Arbitrary payload relayed to the global room.
    SendGroupMessage(Value),
    SendPrivateMessage(PrivateMessagePayload),
    /// Join a private room by key.
    JoinPrivate(String),
    ReadMessage(ReadPayload),
    ReactMessage(ReactPayload),
    UpdateLastSeen(LastSeenPayload),
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate(_) => "authenticate",
            ClientEvent::Join(_) => "join",
            ClientEvent::TypingGroup(_) => "typing-group",
            ClientEvent::StopTypingGroup(_) => "stop-typing-group",
            ClientEvent::TypingPrivate(_) => "typing-private",
            ClientEvent::StopTypingPrivate(_) => "stop-typing-private",
            ClientEvent::SendGroupMessage(_) => "send-group-message",
            ClientEvent::SendPrivateMessage(_) => "send-private-message",
            ClientEvent::JoinPrivate(_) => "join-private",
            ClientEvent::ReadMessage(_) => "read-message",
            ClientEvent::ReactMessage(_) => "react-message",
            ClientEvent::UpdateLastSeen(_) => "update-last-seen",
        }
    }

    /// Check that every required field is present and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientEvent::Authenticate(p) => require("token", &p.token),
            ClientEvent::Join(p) => {
                require("userId", &p.user_id)?;
                require("username", &p.username)
            }
            ClientEvent::TypingGroup(p) | ClientEvent::StopTypingGroup(p) => {
                require("username", &p.username)
            }
            ClientEvent::TypingPrivate(p) | ClientEvent::StopTypingPrivate(p) => {
                require("roomId", &p.room_id)?;
                require("username", &p.username)
            }
            ClientEvent::SendGroupMessage(payload) => {
                if payload.is_null() {
                    Err(ProtocolError::Invalid("message payload is required".into()))
                } else {
                    Ok(())
                }
            }
            ClientEvent::SendPrivateMessage(p) => {
                require("roomId", &p.room_id)?;
                if p.message.is_null() {
                    return Err(ProtocolError::Invalid("message is required".into()));
                }
                Ok(())
            }
            ClientEvent::JoinPrivate(room_id) => require("roomId", room_id),
            ClientEvent::ReadMessage(p) => {
                require("messageId", &p.message_id)?;
                require("userId", &p.user_id)
            }
            ClientEvent::ReactMessage(p) => {
                require("messageId", &p.message_id)?;
                require("userId", &p.user_id)?;
                require("reaction", &p.reaction)
            }
            ClientEvent::UpdateLastSeen(p) => require("userId", &p.user_id),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        Err(ProtocolError::Invalid(format!("{field} is required")))
    } else {
        Ok(())
    }
}

/// Events sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected(ConnectedPayload),
    UserJoined(PresencePayload),
    UserLeft(PresencePayload),
    GroupNotification(NotificationPayload),
    TypingGroup(TypingPayload),
    StopTypingGroup(TypingPayload),
    TypingPrivate(TypingPayload),
    StopTypingPrivate(TypingPayload),
    ReceiveGroupMessage(Value),
    ReceivePrivateMessage(Value),
    MessageRead(ReadPayload),
    MessageReacted(ReactPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::UserJoined(_) => "user-joined",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::GroupNotification(_) => "group-notification",
            ServerEvent::TypingGroup(_) => "typing-group",
            ServerEvent::StopTypingGroup(_) => "stop-typing-group",
            ServerEvent::TypingPrivate(_) => "typing-private",
            ServerEvent::StopTypingPrivate(_) => "stop-typing-private",
            ServerEvent::ReceiveGroupMessage(_) => "receive-group-message",
            ServerEvent::ReceivePrivateMessage(_) => "receive-private-message",
            ServerEvent::MessageRead(_) => "message-read",
            ServerEvent::MessageReacted(_) => "message-reacted",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Create a new error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}
