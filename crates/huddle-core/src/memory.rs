//! In-memory stores.
//!
//! Used by tests and by servers configured without a database. Data lives
//! for the lifetime of the process.

use crate::error::{Error, Result};
use crate::ids::{MessageId, UserId};
use crate::model::{ChatMessage, NewMessage, Reaction, UserIdentity};
use crate::room::RoomKey;
use crate::store::{IdentityStore, MessageStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct StoredMessage {
    /// Insertion order, breaks `created_at` ties.
    seq: u64,
    message: ChatMessage,
}

/// Message store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: DashMap<MessageId, StoredMessage>,
    seq: AtomicU64,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed message, e.g. when seeding history.
    pub fn insert(&self, message: ChatMessage) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.messages
            .insert(message.id, StoredMessage { seq, message });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<ChatMessage> {
        let valid = message.validate()?;
        let message = ChatMessage::from_new(valid, MessageId::generate(), Utc::now());
        debug!(message = %message.id, room = %message.room, "Appended message");
        self.insert(message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<ChatMessage>> {
        Ok(self.messages.get(&id).map(|stored| stored.message.clone()))
    }

    async fn mark_read(&self, id: MessageId) -> Result<()> {
        let mut stored = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        if !stored.message.read {
            stored.message.read = true;
            stored.message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn add_reaction(&self, id: MessageId, reaction: Reaction) -> Result<()> {
        let mut stored = self
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        stored.message.reactions.push(reaction);
        stored.message.updated_at = Utc::now();
        Ok(())
    }

    async fn recent_in_room(
        &self,
        room: &RoomKey,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let mut matching: Vec<(DateTime<Utc>, u64, ChatMessage)> = self
            .messages
            .iter()
            .filter(|stored| &stored.message.room == room)
            .map(|stored| (stored.message.created_at, stored.seq, stored.message.clone()))
            .collect();

        matching.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, _, message)| message)
            .collect())
    }
}

/// Identity store backed by concurrent maps.
#[derive(Default)]
pub struct MemoryIdentityStore {
    users: DashMap<UserId, UserIdentity>,
    /// Unique username index.
    usernames: DashMap<String, UserId>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: &UserId, f: F) -> Result<()>
    where
        F: FnOnce(&mut UserIdentity),
    {
        let mut user = self
            .users
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        f(user.value_mut());
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn create_user(&self, username: &str, credential_hash: &str) -> Result<UserIdentity> {
        if username.trim().is_empty() {
            return Err(Error::Validation("Username required".into()));
        }

        let identity = UserIdentity::new(username, credential_hash);
        match self.usernames.entry(username.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::Conflict(format!("Username already taken: {username}")))
            }
            Entry::Vacant(slot) => {
                slot.insert(identity.id.clone());
            }
        }
        self.users.insert(identity.id.clone(), identity.clone());

        debug!(user = %identity.id, username, "Created user");
        Ok(identity)
    }

    async fn find_user(&self, id: &UserId) -> Result<Option<UserIdentity>> {
        Ok(self.users.get(id).map(|user| user.clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>> {
        let Some(id) = self.usernames.get(username).map(|id| id.clone()) else {
            return Ok(None);
        };
        self.find_user(&id).await
    }

    async fn list_users(&self) -> Result<Vec<UserIdentity>> {
        let mut users: Vec<UserIdentity> = self.users.iter().map(|u| u.clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn set_online(&self, id: &UserId) -> Result<()> {
        self.update(id, |user| user.online = true)
    }

    async fn set_offline(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |user| {
            user.online = false;
            user.last_seen = Some(at);
        })
    }

    async fn touch_last_seen(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |user| user.last_seen = Some(at))
    }
}
