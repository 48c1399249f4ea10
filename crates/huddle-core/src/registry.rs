//! Connection registry.
//!
//! The registry is the authority on who is connected right now. It knows
//! nothing about durable presence; the session sequences presence writes
//! after registry mutations.

use crate::ids::{ConnectionHandle, UserId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Registry errors. These are contract violations, not user errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The handle is already registered.
    #[error("Connection handle already registered: {0}")]
    DuplicateHandle(ConnectionHandle),
}

/// What the registry knows about one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: ConnectionHandle,
    pub user_id: UserId,
    pub username: String,
    pub connected_at: DateTime<Utc>,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    /// The removed connection.
    pub info: ConnectionInfo,
    /// Live connections the same user still has after the removal.
    pub remaining_connections: usize,
}

impl UserSnapshot {
    /// Whether this was the user's last live connection.
    #[must_use]
    pub fn was_last_connection(&self) -> bool {
        self.remaining_connections == 0
    }
}

/// Process-wide map of live connections.
#[derive(Debug, Default)]
pub struct Registry {
    /// Connections indexed by handle.
    connections: DashMap<ConnectionHandle, ConnectionInfo>,
    /// Live handles per user; a user may be connected from many devices.
    by_user: DashMap<UserId, HashSet<ConnectionHandle>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateHandle`] if the handle is present.
    pub fn register(
        &self,
        handle: ConnectionHandle,
        user_id: UserId,
        username: impl Into<String>,
    ) -> Result<ConnectionInfo, RegistryError> {
        let info = match self.connections.entry(handle) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateHandle(handle)),
            Entry::Vacant(slot) => slot
                .insert(ConnectionInfo {
                    handle,
                    user_id: user_id.clone(),
                    username: username.into(),
                    connected_at: Utc::now(),
                })
                .clone(),
        };

        self.by_user.entry(user_id).or_default().insert(handle);

        debug!(connection = %handle, user = %info.user_id, "Registered connection");
        Ok(info)
    }

    /// Remove a connection. Returns `None` if the handle was not registered.
    pub fn unregister(&self, handle: ConnectionHandle) -> Option<UserSnapshot> {
        let (_, info) = self.connections.remove(&handle)?;

        let remaining_connections = match self.by_user.entry(info.user_id.clone()) {
            Entry::Occupied(mut handles) => {
                handles.get_mut().remove(&handle);
                let remaining = handles.get().len();
                if remaining == 0 {
                    handles.remove();
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        };

        debug!(
            connection = %handle,
            user = %info.user_id,
            remaining = remaining_connections,
            "Unregistered connection"
        );

        Some(UserSnapshot {
            info,
            remaining_connections,
        })
    }

    /// Look up a live connection.
    #[must_use]
    pub fn lookup(&self, handle: ConnectionHandle) -> Option<ConnectionInfo> {
        self.connections.get(&handle).map(|entry| entry.clone())
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live connections of a user.
    #[must_use]
    pub fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionHandle> {
        self.by_user
            .get(user_id)
            .map(|handles| handles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.by_user.contains_key(user_id)
    }

    /// Distinct users with at least one live connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.by_user.iter().map(|entry| entry.key().clone()).collect()
    }
}
