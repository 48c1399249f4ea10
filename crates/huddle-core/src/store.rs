//! Durable store boundaries.
//!
//! Both stores are external collaborators: the core only relies on each
//! single-record mutation being atomic. Implementations live in
//! [`crate::memory`] and in the `huddle-db` crate.

use crate::error::Result;
use crate::ids::{MessageId, UserId};
use crate::model::{ChatMessage, NewMessage, Reaction, UserIdentity};
use crate::room::RoomKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable record of chat messages.
///
/// Messages are append-only apart from two in-place mutations: marking
/// read and appending a reaction.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Validate and persist a new message.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`](crate::Error::Validation) if content or sender
    /// is missing; [`Error::Server`](crate::Error::Server) on backend failure.
    async fn append(&self, message: NewMessage) -> Result<ChatMessage>;

    /// Fetch a single message.
    async fn get(&self, id: MessageId) -> Result<Option<ChatMessage>>;

    /// Set `read = true`. Marking an already-read message succeeds.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`](crate::Error::NotFound) if the message is absent.
    async fn mark_read(&self, id: MessageId) -> Result<()>;

    /// Append a reaction. Duplicates are kept.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`](crate::Error::NotFound) if the message is absent.
    async fn add_reaction(&self, id: MessageId, reaction: Reaction) -> Result<()>;

    /// Messages of one room, newest first, skipping `offset` and returning
    /// at most `limit`.
    async fn recent_in_room(
        &self,
        room: &RoomKey,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatMessage>>;
}

/// Durable user identities and presence.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Create an identity with a unique username.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`](crate::Error::Conflict) if the username is taken.
    async fn create_user(&self, username: &str, credential_hash: &str) -> Result<UserIdentity>;

    async fn find_user(&self, id: &UserId) -> Result<Option<UserIdentity>>;

    async fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>>;

    async fn list_users(&self) -> Result<Vec<UserIdentity>>;

    /// Set `online = true`.
    async fn set_online(&self, id: &UserId) -> Result<()>;

    /// Set `online = false` and `last_seen = at`.
    async fn set_offline(&self, id: &UserId, at: DateTime<Utc>) -> Result<()>;

    /// Set `last_seen = at` without touching `online`.
    async fn touch_last_seen(&self, id: &UserId, at: DateTime<Utc>) -> Result<()>;
}
