//! Room router for Huddle.
//!
//! The router owns room membership and performs fan-out. Membership lives
//! only here and is rebuilt from live connections; empty rooms are dropped
//! as soon as their last member leaves.

use crate::envelope::Envelope;
use crate::ids::ConnectionHandle;
use crate::room::{Room, RoomKey};
use dashmap::DashMap;
use huddle_protocol::ServerEvent;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Router errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
    /// Broadcast capacity of each room.
    pub room_capacity: usize,
    /// Broadcast capacity of the process-wide channel.
    pub everyone_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
            room_capacity: 1024,
            everyone_capacity: 4096,
        }
    }
}

/// Membership receiver handed out on join.
pub type RoomReceiver = broadcast::Receiver<Arc<Envelope>>;

/// The central room router.
pub struct Router {
    /// Rooms indexed by key.
    rooms: DashMap<RoomKey, Room>,
    /// Rooms joined per connection.
    memberships: DashMap<ConnectionHandle, HashSet<RoomKey>>,
    /// Process-wide channel, reaches every authenticated connection.
    everyone: broadcast::Sender<Arc<Envelope>>,
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        let (everyone, _) = broadcast::channel(config.everyone_capacity.max(1));
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            everyone,
            config,
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            room_count: self.rooms.len(),
            connection_count: self.memberships.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }

    /// Number of non-empty rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Join a room.
    ///
    /// Joining is idempotent: a second join of the same room returns
    /// `Ok(None)` and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection already holds the maximum number
    /// of rooms.
    pub fn join(
        &self,
        handle: ConnectionHandle,
        key: &RoomKey,
    ) -> Result<Option<RoomReceiver>, RouterError> {
        let mut joined = self.memberships.entry(handle).or_default();

        if joined.contains(key) {
            return Ok(None);
        }
        if joined.len() >= self.config.max_rooms_per_connection {
            return Err(RouterError::MaxRoomsReached);
        }

        let mut room = self.rooms.entry(key.clone()).or_insert_with(|| {
            debug!(room = %key, "Creating room");
            Room::with_capacity(key.clone(), self.config.room_capacity)
        });

        let receiver = room.join(handle);
        joined.insert(key.clone());

        debug!(
            room = %key,
            connection = %handle,
            members = room.member_count(),
            "Joined"
        );

        Ok(receiver)
    }

    /// Leave a room. Leaving a room that was not joined is a no-op.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, handle: ConnectionHandle, key: &RoomKey) -> bool {
        let was_member = match self.memberships.get_mut(&handle) {
            Some(mut joined) => joined.remove(key),
            None => false,
        };
        self.memberships.remove_if(&handle, |_, joined| joined.is_empty());

        if was_member {
            self.detach(handle, key);
        }
        was_member
    }

    /// Leave every room. Returns the rooms that were left.
    pub fn leave_all(&self, handle: ConnectionHandle) -> Vec<RoomKey> {
        let rooms: Vec<RoomKey> = self
            .memberships
            .remove(&handle)
            .map(|(_, joined)| joined.into_iter().collect())
            .unwrap_or_default();

        for key in &rooms {
            self.detach(handle, key);
        }

        debug!(connection = %handle, rooms = rooms.len(), "Left all rooms");
        rooms
    }

    fn detach(&self, handle: ConnectionHandle, key: &RoomKey) {
        if let Some(mut room) = self.rooms.get_mut(key) {
            room.leave(handle);
        }
        if self.rooms.remove_if(key, |_, room| room.is_empty()).is_some() {
            debug!(room = %key, "Deleted empty room");
        }
    }

    /// Fan an event out to every member of a room except `exclude`.
    ///
    /// Returns the number of connections that will receive it. Broadcasting
    /// to a room nobody has joined is not an error.
    pub fn broadcast(
        &self,
        key: &RoomKey,
        event: ServerEvent,
        exclude: Option<ConnectionHandle>,
    ) -> usize {
        let envelope = Envelope::new(event).in_room(key.clone()).excluding(exclude);

        match self.rooms.get(key) {
            Some(room) => room.publish(envelope),
            None => {
                trace!(room = %key, event = envelope.event_name(), "Broadcast to empty room");
                0
            }
        }
    }

    /// Subscribe to the process-wide channel.
    #[must_use]
    pub fn subscribe_everyone(&self) -> RoomReceiver {
        self.everyone.subscribe()
    }

    /// Send an event to every subscriber of the process-wide channel.
    pub fn broadcast_everyone(&self, event: ServerEvent) -> usize {
        let envelope = Envelope::new(event);
        trace!(event = envelope.event_name(), "Broadcast to everyone");
        self.everyone.send(Arc::new(envelope)).unwrap_or_default()
    }

    /// Check if a room currently exists.
    #[must_use]
    pub fn room_exists(&self, key: &RoomKey) -> bool {
        self.rooms.contains_key(key)
    }

    /// Whether a connection has joined a room.
    #[must_use]
    pub fn is_member(&self, handle: ConnectionHandle, key: &RoomKey) -> bool {
        self.rooms
            .get(key)
            .map(|room| room.is_member(handle))
            .unwrap_or(false)
    }

    /// Current members of a room.
    #[must_use]
    pub fn members(&self, key: &RoomKey) -> Vec<ConnectionHandle> {
        self.rooms
            .get(key)
            .map(|room| room.members())
            .unwrap_or_default()
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, handle: ConnectionHandle) -> Vec<RoomKey> {
        self.memberships
            .get(&handle)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of connections with at least one room.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use huddle_protocol::{ReadPayload, TypingPayload};
    use tokio::sync::broadcast::error::TryRecvError;

    fn typing(username: &str) -> ServerEvent {
        ServerEvent::TypingGroup(TypingPayload {
            username: username.into(),
        })
    }

    #[test]
    fn test_join_leave_sequences_end_in_last_state() {
        let router = Router::new();
        let handle = ConnectionHandle::next();
        let room = RoomKey::global();

        assert!(router.join(handle, &room).unwrap().is_some());
        assert!(router.join(handle, &room).unwrap().is_none());
        assert_eq!(router.members(&room), vec![handle]);

        assert!(router.leave(handle, &room));
        assert!(!router.leave(handle, &room));
        assert!(!router.is_member(handle, &room));
        assert!(!router.room_exists(&room));

        assert!(router.join(handle, &room).unwrap().is_some());
        assert!(router.is_member(handle, &room));
        assert_eq!(router.stats().total_memberships, 1);
    }

    #[test]
    fn test_broadcast_reaches_members_once() {
        let router = Router::new();
        let room = RoomKey::global();
        let a = ConnectionHandle::next();
        let b = ConnectionHandle::next();
        let outsider = ConnectionHandle::next();

        let mut rx_a = router.join(a, &room).unwrap().unwrap();
        let mut rx_b = router.join(b, &room).unwrap().unwrap();
        let mut rx_out = router
            .join(outsider, &RoomKey::parse("elsewhere").unwrap())
            .unwrap()
            .unwrap();

        assert_eq!(router.broadcast(&room, typing("alice"), None), 2);

        assert_eq!(rx_a.try_recv().unwrap().event, typing("alice"));
        assert_eq!(rx_b.try_recv().unwrap().event, typing("alice"));
        assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(rx_out.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_broadcast_exclusion() {
        let router = Router::new();
        let room = RoomKey::global();
        let sender = ConnectionHandle::next();
        let other = ConnectionHandle::next();
        let mut rx_sender = router.join(sender, &room).unwrap().unwrap();
        let _rx_other = router.join(other, &room).unwrap().unwrap();

        assert_eq!(router.broadcast(&room, typing("alice"), Some(sender)), 1);

        // The sender's receiver still sees the envelope but must filter it.
        let envelope = rx_sender.try_recv().unwrap();
        assert!(!envelope.is_visible_to(sender));
    }

    #[test]
    fn test_broadcast_to_empty_room() {
        let router = Router::new();
        assert_eq!(
            router.broadcast(&RoomKey::parse("nobody").unwrap(), typing("x"), None),
            0
        );
    }

    #[test]
    fn test_leave_all_removes_every_membership() {
        let router = Router::new();
        let handle = ConnectionHandle::next();
        let other = ConnectionHandle::next();
        let private = RoomKey::private(&UserId::from("u1"), &UserId::from("u2"));

        let _g = router.join(handle, &RoomKey::global()).unwrap();
        let _p = router.join(handle, &private).unwrap();
        let _o = router.join(other, &RoomKey::global()).unwrap();

        let mut left = router.leave_all(handle);
        left.sort();
        assert_eq!(left, vec![RoomKey::global(), private.clone()]);

        assert!(router.rooms_of(handle).is_empty());
        assert!(!router.room_exists(&private));
        assert_eq!(router.members(&RoomKey::global()), vec![other]);
    }

    #[test]
    fn test_max_rooms_per_connection() {
        let router = Router::with_config(RouterConfig {
            max_rooms_per_connection: 1,
            ..RouterConfig::default()
        });
        let handle = ConnectionHandle::next();

        let _g = router.join(handle, &RoomKey::global()).unwrap();
        assert_eq!(
            router
                .join(handle, &RoomKey::parse("second").unwrap())
                .err(),
            Some(RouterError::MaxRoomsReached)
        );
        // Re-joining an existing room is still allowed.
        assert!(router.join(handle, &RoomKey::global()).unwrap().is_none());
    }

    #[test]
    fn test_broadcast_everyone() {
        let router = Router::new();
        let mut rx1 = router.subscribe_everyone();
        let mut rx2 = router.subscribe_everyone();

        let event = ServerEvent::MessageRead(ReadPayload {
            message_id: "m1".into(),
            user_id: "u1".into(),
        });
        assert_eq!(router.broadcast_everyone(event.clone()), 2);
        assert_eq!(rx1.try_recv().unwrap().event, event);
        assert_eq!(rx2.try_recv().unwrap().event, event);
    }

    #[test]
    fn test_stats() {
        let router = Router::new();
        let a = ConnectionHandle::next();
        let b = ConnectionHandle::next();

        let _r1 = router.join(a, &RoomKey::global()).unwrap();
        let _r2 = router.join(a, &RoomKey::parse("room-2").unwrap()).unwrap();
        let _r3 = router.join(b, &RoomKey::global()).unwrap();

        let stats = router.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_memberships, 3);
        assert_eq!(router.room_count(), 2);

        router.leave_all(a);
        assert_eq!(router.room_count(), 1);
    }
}
