//! Per-connection lifecycle.
//!
//! The lifecycle is a pure function from the current state and one input
//! to the next state and a list of effects. It performs no I/O; the
//! [`Session`](crate::Session) executes the effects in order.
//!
//! ```text
//! Connecting --credential ok--> Authenticated --join--> Active --closed--> Disconnected
//!     |                              |
//!     +--credential rejected---------+--closed-----------------------------> Disconnected
//! ```

use crate::error::Error;
use crate::ids::{MessageId, UserId};
use crate::model::Reaction;
use crate::room::RoomKey;
use huddle_protocol::{
    ClientEvent, NotificationPayload, PresencePayload, ReactPayload, ReadPayload, ServerEvent,
    TypingPayload,
};

/// Who a connection speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    pub(crate) fn presence(&self) -> PresencePayload {
        PresencePayload {
            user_id: self.user_id.to_string(),
            username: self.username.clone(),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Transport open, no credential accepted yet.
    #[default]
    Connecting,
    /// Credential accepted, waiting for `join`.
    Authenticated(Identity),
    /// Registered and in the global room.
    Active(Identity),
    /// Terminal.
    Disconnected,
}

impl SessionState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Active(_) => "active",
            SessionState::Disconnected => "disconnected",
        }
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Authenticated(identity) | SessionState::Active(identity) => {
                Some(identity)
            }
            SessionState::Connecting | SessionState::Disconnected => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected)
    }
}

/// One input to the lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Outcome of verifying a bearer credential.
    Credential(Result<Identity, Error>),
    /// A decoded inbound event.
    Event(ClientEvent),
    /// The transport closed or failed.
    Closed,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Verify an in-band credential and feed the outcome back in.
    Verify(String),
    /// Send `connected` and start receiving process-wide events.
    Acknowledge(Identity),
    /// Add the connection to the registry.
    Register(Identity),
    /// Join a room and start forwarding its events.
    JoinRoom(RoomKey),
    /// Persist `online = true`.
    MarkOnline(UserId),
    /// Fan an event out to a room.
    Broadcast {
        room: RoomKey,
        event: ServerEvent,
        exclude_self: bool,
    },
    /// Persist `read = true`, then broadcast `message-read` to everyone.
    MarkRead {
        message_id: MessageId,
        receipt: ReadPayload,
    },
    /// Persist a reaction, then broadcast `message-reacted` to everyone.
    AddReaction {
        message_id: MessageId,
        reaction: Reaction,
        notice: ReactPayload,
    },
    /// Persist `last_seen = now`.
    TouchLastSeen(UserId),
    /// Unregister, leave every room, persist presence and announce the leave.
    Disconnect(Identity),
    /// Tell this connection an event was refused. The connection stays open.
    Refuse(Error),
    /// Drop an event with a diagnostic only.
    Ignore {
        event: &'static str,
        reason: &'static str,
    },
    /// Fatal: send the error and close the transport.
    Reject(Error),
}

/// Advance the lifecycle by one input.
#[must_use]
pub fn transition(state: SessionState, input: Input) -> (SessionState, Vec<Effect>) {
    match (state, input) {
        (SessionState::Disconnected, _) => (SessionState::Disconnected, Vec::new()),

        (SessionState::Connecting, Input::Credential(Err(err))) => {
            (SessionState::Disconnected, vec![Effect::Reject(err)])
        }
        (SessionState::Connecting, Input::Credential(Ok(identity))) => (
            SessionState::Authenticated(identity.clone()),
            vec![Effect::Acknowledge(identity)],
        ),
        (SessionState::Connecting, Input::Event(ClientEvent::Authenticate(payload)))
            if !payload.token.trim().is_empty() =>
        {
            (SessionState::Connecting, vec![Effect::Verify(payload.token)])
        }
        (SessionState::Connecting, Input::Event(_)) => (
            SessionState::Disconnected,
            vec![Effect::Reject(Error::Auth("no token provided".into()))],
        ),
        (SessionState::Connecting, Input::Closed) => (SessionState::Disconnected, Vec::new()),

        (state, Input::Credential(_)) => {
            (state, vec![ignore("authenticate", "already authenticated")])
        }

        (SessionState::Authenticated(identity), Input::Event(event)) => {
            authenticated(identity, event)
        }
        (SessionState::Authenticated(_), Input::Closed) => (SessionState::Disconnected, Vec::new()),

        (SessionState::Active(identity), Input::Event(event)) => {
            let effects = active(&identity, event);
            (SessionState::Active(identity), effects)
        }
        (SessionState::Active(identity), Input::Closed) => (
            SessionState::Disconnected,
            vec![Effect::Disconnect(identity)],
        ),
    }
}

fn ignore(event: &'static str, reason: &'static str) -> Effect {
    Effect::Ignore { event, reason }
}

fn authenticated(identity: Identity, event: ClientEvent) -> (SessionState, Vec<Effect>) {
    let name = event.name();
    if !matches!(event, ClientEvent::Join(_)) {
        return (
            SessionState::Authenticated(identity),
            vec![ignore(name, "not joined yet")],
        );
    }
    if let Err(err) = event.validate() {
        return (
            SessionState::Authenticated(identity),
            vec![Effect::Refuse(err.into())],
        );
    }
    let ClientEvent::Join(join) = event else {
        return (
            SessionState::Authenticated(identity),
            vec![ignore(name, "not joined yet")],
        );
    };

    if join.user_id != identity.user_id.as_str() {
        return (
            SessionState::Authenticated(identity),
            vec![Effect::Refuse(Error::Validation(
                "userId does not match the authenticated user".into(),
            ))],
        );
    }

    let identity = Identity::new(identity.user_id, join.username);
    let global = RoomKey::global();
    let effects = vec![
        Effect::Register(identity.clone()),
        Effect::JoinRoom(global.clone()),
        Effect::MarkOnline(identity.user_id.clone()),
        Effect::Broadcast {
            room: global.clone(),
            event: ServerEvent::UserJoined(identity.presence()),
            exclude_self: false,
        },
        Effect::Broadcast {
            room: global,
            event: ServerEvent::GroupNotification(NotificationPayload::joined(
                identity.user_id.as_str(),
                identity.username.as_str(),
            )),
            exclude_self: true,
        },
    ];

    (SessionState::Active(identity), effects)
}

fn active(identity: &Identity, event: ClientEvent) -> Vec<Effect> {
    if let Err(err) = event.validate() {
        return vec![Effect::Refuse(err.into())];
    }

    match event {
        ClientEvent::Authenticate(_) => vec![ignore("authenticate", "already authenticated")],
        ClientEvent::Join(_) => vec![ignore("join", "already joined")],

        ClientEvent::TypingGroup(payload) => vec![Effect::Broadcast {
            room: RoomKey::global(),
            event: ServerEvent::TypingGroup(payload),
            exclude_self: true,
        }],
        ClientEvent::StopTypingGroup(payload) => vec![Effect::Broadcast {
            room: RoomKey::global(),
            event: ServerEvent::StopTypingGroup(payload),
            exclude_self: true,
        }],

        ClientEvent::TypingPrivate(payload) => match parse_room(&payload.room_id) {
            Ok(room) => vec![Effect::Broadcast {
                room,
                event: ServerEvent::TypingPrivate(TypingPayload {
                    username: payload.username,
                }),
                exclude_self: true,
            }],
            Err(err) => vec![Effect::Refuse(err)],
        },
        ClientEvent::StopTypingPrivate(payload) => match parse_room(&payload.room_id) {
            Ok(room) => vec![Effect::Broadcast {
                room,
                event: ServerEvent::StopTypingPrivate(TypingPayload {
                    username: payload.username,
                }),
                exclude_self: true,
            }],
            Err(err) => vec![Effect::Refuse(err)],
        },

        ClientEvent::SendGroupMessage(message) => vec![Effect::Broadcast {
            room: RoomKey::global(),
            event: ServerEvent::ReceiveGroupMessage(message),
            exclude_self: false,
        }],
        ClientEvent::SendPrivateMessage(payload) => match parse_room(&payload.room_id) {
            Ok(room) => vec![Effect::Broadcast {
                room,
                event: ServerEvent::ReceivePrivateMessage(payload.message),
                exclude_self: false,
            }],
            Err(err) => vec![Effect::Refuse(err)],
        },

        ClientEvent::JoinPrivate(room_id) => match parse_room(&room_id) {
            Ok(room) => vec![Effect::JoinRoom(room)],
            Err(err) => vec![Effect::Refuse(err)],
        },

        ClientEvent::ReadMessage(receipt) => match parse_message_id(&receipt.message_id) {
            Ok(message_id) => vec![Effect::MarkRead {
                message_id,
                receipt,
            }],
            Err(err) => vec![Effect::Refuse(err)],
        },
        ClientEvent::ReactMessage(notice) => match parse_message_id(&notice.message_id) {
            Ok(message_id) => vec![Effect::AddReaction {
                message_id,
                reaction: Reaction::new(
                    UserId::from(notice.user_id.as_str()),
                    notice.reaction.as_str(),
                ),
                notice,
            }],
            Err(err) => vec![Effect::Refuse(err)],
        },

        ClientEvent::UpdateLastSeen(payload) => {
            if payload.user_id != identity.user_id.as_str() {
                return vec![Effect::Refuse(Error::Validation(
                    "userId does not match the authenticated user".into(),
                ))];
            }
            vec![Effect::TouchLastSeen(identity.user_id.clone())]
        }
    }
}

fn parse_room(room_id: &str) -> Result<RoomKey, Error> {
    RoomKey::parse(room_id).map_err(|reason| Error::Validation(format!("roomId: {reason}")))
}

fn parse_message_id(message_id: &str) -> Result<MessageId, Error> {
    message_id
        .parse()
        .map_err(|_| Error::Validation(format!("messageId is not a valid id: {message_id}")))
}
