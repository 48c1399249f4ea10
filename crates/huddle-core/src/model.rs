//! Durable records: chat messages and user identities.

use crate::error::{Error, Result};
use crate::ids::{MessageId, UserId};
use crate::room::RoomKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Content type of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => Err(Error::Validation(format!("unknown message type: {other}"))),
        }
    }
}

/// One reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user: UserId,
    pub reaction: String,
}

impl Reaction {
    #[must_use]
    pub fn new(user: UserId, reaction: impl Into<String>) -> Self {
        Self {
            user,
            reaction: reaction.into(),
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: UserId,
    /// Set only for private-room messages.
    pub receiver: Option<UserId>,
    pub content: String,
    pub room: RoomKey,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Flips false to true once and never back.
    pub read: bool,
    /// Insertion-ordered and append-only.
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Materialize a validated new message.
    #[must_use]
    pub fn from_new(new: ValidMessage, id: MessageId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            sender: new.sender,
            receiver: new.receiver,
            content: new.content,
            room: new.room,
            kind: new.kind,
            read: false,
            reactions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A send request as it arrives from the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub sender: Option<UserId>,
    #[serde(default)]
    pub receiver: Option<UserId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub room: Option<RoomKey>,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageKind>,
}

/// A send request that passed validation, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidMessage {
    pub sender: UserId,
    pub receiver: Option<UserId>,
    pub content: String,
    pub room: RoomKey,
    pub kind: MessageKind,
}

impl NewMessage {
    /// Text message from `sender` to the global room.
    #[must_use]
    pub fn text(sender: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_room(mut self, room: RoomKey) -> Self {
        self.room = Some(room);
        self
    }

    #[must_use]
    pub fn to(mut self, receiver: impl Into<UserId>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    #[must_use]
    pub fn of_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Check required fields and apply defaults.
    ///
    /// A message with a receiver and no room lands in the pair's private
    /// room; one without either lands in the global room.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when sender or content is missing, a
    /// user ID is malformed, or a receiver is named for the global room.
    pub fn validate(self) -> Result<ValidMessage> {
        let sender = self
            .sender
            .filter(|sender| !sender.is_empty())
            .ok_or_else(|| Error::Validation("Sender and content required".into()))?;
        let content = self
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Validation("Sender and content required".into()))?;
        let receiver = self.receiver.filter(|receiver| !receiver.is_empty());

        let sender = UserId::parse(sender.as_str())
            .map_err(|reason| Error::Validation(format!("sender: {reason}")))?;
        let receiver = receiver
            .map(|receiver| UserId::parse(receiver.as_str()))
            .transpose()
            .map_err(|reason| Error::Validation(format!("receiver: {reason}")))?;

        let room = match (self.room, &receiver) {
            (Some(room), _) => room,
            (None, Some(receiver)) => RoomKey::private(&sender, receiver),
            (None, None) => RoomKey::global(),
        };
        if receiver.is_some() && room.is_global() {
            return Err(Error::Validation(
                "receiver is only allowed on private messages".into(),
            ));
        }

        Ok(ValidMessage {
            sender,
            receiver,
            content,
            room,
            kind: self.kind.unwrap_or_default(),
        })
    }
}

/// A durable user identity with presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub credential_hash: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserIdentity {
    #[must_use]
    pub fn new(username: impl Into<String>, credential_hash: impl Into<String>) -> Self {
        Self {
            id: UserId::generate(),
            username: username.into(),
            credential_hash: credential_hash.into(),
            online: false,
            last_seen: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_defaults() {
        let valid = NewMessage::text("u1", "hello").validate().unwrap();
        assert_eq!(valid.room, RoomKey::global());
        assert_eq!(valid.kind, MessageKind::Text);
        assert!(valid.receiver.is_none());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(matches!(
            NewMessage::text("u1", "   ").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            NewMessage::text("", "hi").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            NewMessage::default().validate(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_separator_in_user_ids() {
        // ("a:b", "c") and ("a", "b:c") would share a private room key.
        assert!(matches!(
            NewMessage::text("a:b", "hi").to("c").validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            NewMessage::text("a", "hi").to("b:c").validate(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_blank_room_is_rejected_on_deserialize() {
        let body = r#"{"sender":"u1","content":"x","room":"  "}"#;
        assert!(serde_json::from_str::<NewMessage>(body).is_err());

        let ok: NewMessage =
            serde_json::from_str(r#"{"sender":"u1","content":"x","room":"u1:u2"}"#).unwrap();
        assert_eq!(ok.room.unwrap().as_str(), "u1:u2");
    }

    #[test]
    fn test_receiver_implies_private_room() {
        let valid = NewMessage::text("u2", "psst").to("u1").validate().unwrap();
        assert_eq!(
            valid.room,
            RoomKey::private(&UserId::from("u1"), &UserId::from("u2"))
        );

        let global_with_receiver = NewMessage::text("u2", "psst")
            .to("u1")
            .in_room(RoomKey::global())
            .validate();
        assert!(matches!(global_with_receiver, Err(Error::Validation(_))));
    }

    #[test]
    fn test_message_kind_parse() {
        assert_eq!("image".parse::<MessageKind>().unwrap(), MessageKind::Image);
        assert!("video".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_chat_message_json_shape() {
        let valid = NewMessage::text("u1", "hi")
            .of_kind(MessageKind::File)
            .validate()
            .unwrap();
        let message = ChatMessage::from_new(valid, MessageId::generate(), Utc::now());
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["room"], "global");
        assert_eq!(value["read"], false);
        assert!(value["receiver"].is_null());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn test_identity_hides_credential() {
        let identity = UserIdentity::new("alice", "$argon2id$secret");
        let value = serde_json::to_value(&identity).unwrap();
        assert!(value.get("credentialHash").is_none());
        assert_eq!(value["online"], false);
    }
}
