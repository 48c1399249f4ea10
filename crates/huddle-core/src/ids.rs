//! Identifier types shared across Huddle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Process-wide counter for connection handles.
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle of one live transport link.
///
/// Handles are never reused within a process, so a stale handle can not
/// alias a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// Allocate a fresh handle.
    #[must_use]
    pub fn next() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// Reserved in user IDs: it joins the two halves of a private room key.
pub const USER_ID_SEPARATOR: char = ':';

/// Durable user identifier.
///
/// IDs that reach the server from outside go through [`UserId::parse`],
/// which keeps [`USER_ID_SEPARATOR`] out of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an externally supplied user ID.
    ///
    /// # Errors
    ///
    /// Returns an error message if the ID is blank, contains control
    /// characters, or contains [`USER_ID_SEPARATOR`].
    pub fn parse(id: impl Into<String>) -> Result<Self, &'static str> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("User ID cannot be empty");
        }
        if id.contains(USER_ID_SEPARATOR) {
            return Err("User ID cannot contain ':'");
        }
        if id.chars().any(char::is_control) {
            return Err("User ID contains control characters");
        }
        Ok(Self(id))
    }

    /// Generate a random user ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Durable message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = ConnectionHandle::next();
        let b = ConnectionHandle::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn_"));
    }

    #[test]
    fn test_message_id_parse() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_user_id_parse_rejects_separator() {
        assert_eq!(UserId::parse("u-1").unwrap().as_str(), "u-1");
        assert!(UserId::parse("a:b").is_err());
        assert!(UserId::parse(" ").is_err());
        assert!(UserId::parse("a\tb").is_err());
        assert!(UserId::parse(UserId::generate().to_string()).is_ok());
    }

    #[test]
    fn test_blank_user_id_is_empty() {
        assert!(UserId::from("  ").is_empty());
        assert!(!UserId::generate().is_empty());
    }
}
