//! Room keys and per-room fan-out state.
//!
//! Rooms are not stored anywhere. A room exists while at least one live
//! connection has joined it, and its key is either the well-known
//! [`GLOBAL_ROOM`] or a pairwise key derived from two user IDs.

use crate::envelope::Envelope;
use crate::ids::{ConnectionHandle, UserId, USER_ID_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Key of the room every joined connection belongs to.
pub const GLOBAL_ROOM: &str = "global";

/// Maximum room key length.
pub const MAX_ROOM_KEY_LENGTH: usize = 256;

/// Default broadcast capacity of a room.
const DEFAULT_ROOM_CAPACITY: usize = 1024;

/// Validate a room key.
///
/// # Errors
///
/// Returns an error message if the key is invalid.
pub fn validate_room_key(key: &str) -> Result<(), &'static str> {
    if key.trim().is_empty() {
        return Err("Room key cannot be empty");
    }
    if key.len() > MAX_ROOM_KEY_LENGTH {
        return Err("Room key too long");
    }
    if key.chars().any(char::is_control) {
        return Err("Room key contains control characters");
    }
    Ok(())
}

/// A room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RoomKey(String);

impl RoomKey {
    /// Parse and validate a room key.
    ///
    /// # Errors
    ///
    /// Returns an error message if the key is invalid.
    pub fn parse(key: impl Into<String>) -> Result<Self, &'static str> {
        let key = key.into();
        validate_room_key(&key)?;
        Ok(Self(key))
    }

    /// The shared global room.
    #[must_use]
    pub fn global() -> Self {
        Self(GLOBAL_ROOM.to_string())
    }

    /// Deterministic private room key for two participants.
    ///
    /// Argument order does not matter: both participants compute the same key.
    /// The key is unambiguous for IDs accepted by [`UserId::parse`].
    #[must_use]
    pub fn private(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}{USER_ID_SEPARATOR}{high}"))
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_ROOM
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomKey {
    fn default() -> Self {
        Self::global()
    }
}

impl TryFrom<String> for RoomKey {
    type Error = &'static str;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::parse(key)
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live fan-out state of one room.
#[derive(Debug)]
pub struct Room {
    key: RoomKey,
    sender: broadcast::Sender<Arc<Envelope>>,
    members: HashSet<ConnectionHandle>,
}

impl Room {
    /// Create a new room.
    #[must_use]
    pub fn new(key: RoomKey) -> Self {
        Self::with_capacity(key, DEFAULT_ROOM_CAPACITY)
    }

    /// Create a new room with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(key: RoomKey, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            key,
            sender,
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, handle: ConnectionHandle) -> bool {
        self.members.contains(&handle)
    }

    /// Add a member. Returns a receiver only if the handle was not already
    /// a member.
    pub fn join(&mut self, handle: ConnectionHandle) -> Option<broadcast::Receiver<Arc<Envelope>>> {
        if !self.members.insert(handle) {
            return None;
        }
        debug!(room = %self.key, connection = %handle, "Connection joined room");
        Some(self.sender.subscribe())
    }

    /// Remove a member.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, handle: ConnectionHandle) -> bool {
        let removed = self.members.remove(&handle);
        if removed {
            debug!(room = %self.key, connection = %handle, "Connection left room");
        }
        removed
    }

    /// Publish an envelope to every member.
    ///
    /// Returns the number of members that will see it.
    pub fn publish(&self, envelope: Envelope) -> usize {
        let recipients = self
            .members
            .iter()
            .filter(|handle| envelope.is_visible_to(**handle))
            .count();
        trace!(room = %self.key, event = envelope.event_name(), recipients, "Publishing");
        // No receivers only means every member has already gone away.
        let _ = self.sender.send(Arc::new(envelope));
        recipients
    }

    #[must_use]
    pub fn members(&self) -> Vec<ConnectionHandle> {
        self.members.iter().copied().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
