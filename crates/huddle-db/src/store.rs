//! Async store implementations over [`Database`].

use crate::models::{MessageRow, ReactionRow, UserRow};
use crate::Database;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use huddle_core::{
    ChatMessage, Error, IdentityStore, MessageId, MessageKind, MessageStore, NewMessage, Reaction,
    Result, RoomKey, UserId, UserIdentity,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// SQLite-backed message and identity store.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    /// Run a query on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                Error::Server(e.to_string())
            })?
            .map_err(|e| {
                error!(error = %e, "Database error");
                Error::Server(format!("{e:#}"))
            })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp: {value}"))?
        .with_timezone(&Utc))
}

impl MessageRow {
    fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: message.id.to_string(),
            sender: message.sender.to_string(),
            receiver: message.receiver.as_ref().map(ToString::to_string),
            content: message.content.clone(),
            room: message.room.to_string(),
            kind: message.kind.as_str().to_string(),
            read: message.read,
            created_at: timestamp(message.created_at),
            updated_at: timestamp(message.updated_at),
        }
    }

    fn into_message(self, reactions: Vec<Reaction>) -> anyhow::Result<ChatMessage> {
        Ok(ChatMessage {
            id: self
                .id
                .parse::<MessageId>()
                .with_context(|| format!("invalid message id: {}", self.id))?,
            sender: UserId::new(self.sender),
            receiver: self.receiver.map(UserId::new),
            content: self.content,
            room: RoomKey::parse(self.room).map_err(anyhow::Error::msg)?,
            kind: self.kind.parse::<MessageKind>().map_err(anyhow::Error::new)?,
            read: self.read,
            reactions,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl UserRow {
    fn into_identity(self) -> anyhow::Result<UserIdentity> {
        Ok(UserIdentity {
            id: UserId::new(self.id),
            username: self.username,
            credential_hash: self.password,
            online: self.online,
            last_seen: self
                .last_seen
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Attach reactions to their messages, keeping both orders.
fn assemble(
    rows: Vec<MessageRow>,
    reactions: Vec<ReactionRow>,
) -> anyhow::Result<Vec<ChatMessage>> {
    let mut by_message: HashMap<String, Vec<Reaction>> = HashMap::new();
    for reaction in reactions {
        by_message
            .entry(reaction.message_id)
            .or_default()
            .push(Reaction::new(UserId::new(reaction.user_id), reaction.reaction));
    }

    rows.into_iter()
        .map(|row| {
            let reactions = by_message.remove(&row.id).unwrap_or_default();
            row.into_message(reactions)
        })
        .collect()
}

fn load_messages(db: &Database, rows: Vec<MessageRow>) -> anyhow::Result<Vec<ChatMessage>> {
    let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
    let reactions = db.get_reactions_for_messages(&ids)?;
    assemble(rows, reactions)
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: NewMessage) -> Result<ChatMessage> {
        let valid = message.validate()?;
        // Stored timestamps keep microseconds.
        let now = Utc::now().trunc_subsecs(6);
        let message = ChatMessage::from_new(valid, MessageId::generate(), now);
        let row = MessageRow::from_message(&message);

        self.blocking(move |db| db.insert_message(&row)).await?;
        debug!(message = %message.id, room = %message.room, "Appended message");
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<ChatMessage>> {
        self.blocking(move |db| {
            let Some(row) = db.get_message(&id.to_string())? else {
                return Ok(None);
            };
            Ok(load_messages(db, vec![row])?.pop())
        })
        .await
    }

    async fn mark_read(&self, id: MessageId) -> Result<()> {
        let now = timestamp(Utc::now());
        let matched = self
            .blocking(move |db| db.mark_read(&id.to_string(), &now))
            .await?;
        if matched == 0 {
            return Err(Error::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn add_reaction(&self, id: MessageId, reaction: Reaction) -> Result<()> {
        let now = timestamp(Utc::now());
        let added = self
            .blocking(move |db| {
                db.add_reaction(
                    &id.to_string(),
                    reaction.user.as_str(),
                    &reaction.reaction,
                    &now,
                )
            })
            .await?;
        if !added {
            return Err(Error::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn recent_in_room(
        &self,
        room: &RoomKey,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let room = room.to_string();
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);

        self.blocking(move |db| {
            let rows = db.get_room_messages(&room, offset, limit)?;
            load_messages(db, rows)
        })
        .await
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn create_user(&self, username: &str, credential_hash: &str) -> Result<UserIdentity> {
        if username.trim().is_empty() {
            return Err(Error::Validation("Username required".into()));
        }

        let identity = UserIdentity::new(username, credential_hash);
        let row = (
            identity.id.to_string(),
            identity.username.clone(),
            identity.credential_hash.clone(),
            timestamp(identity.created_at),
        );
        let created = self
            .blocking(move |db| db.create_user(&row.0, &row.1, &row.2, &row.3))
            .await?;
        if !created {
            return Err(Error::Conflict(format!("Username already taken: {username}")));
        }

        debug!(user = %identity.id, username, "Created user");
        Ok(identity)
    }

    async fn find_user(&self, id: &UserId) -> Result<Option<UserIdentity>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_user_by_id(&id)?.map(UserRow::into_identity).transpose())
            .await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>> {
        let username = username.to_string();
        self.blocking(move |db| {
            db.get_user_by_username(&username)?
                .map(UserRow::into_identity)
                .transpose()
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserIdentity>> {
        self.blocking(|db| {
            db.list_users()?
                .into_iter()
                .map(UserRow::into_identity)
                .collect()
        })
        .await
    }

    async fn set_online(&self, id: &UserId) -> Result<()> {
        let key = id.to_string();
        let matched = self.blocking(move |db| db.set_online(&key)).await?;
        expect_user(matched, id)
    }

    async fn set_offline(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let key = id.to_string();
        let at = timestamp(at);
        let matched = self.blocking(move |db| db.set_offline(&key, &at)).await?;
        expect_user(matched, id)
    }

    async fn touch_last_seen(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let key = id.to_string();
        let at = timestamp(at);
        let matched = self.blocking(move |db| db.touch_last_seen(&key, &at)).await?;
        expect_user(matched, id)
    }
}

fn expect_user(matched: usize, id: &UserId) -> Result<()> {
    if matched == 0 {
        return Err(Error::NotFound(format!("user {id}")));
    }
    Ok(())
}
