//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle realtime chat engine.
//!
//! Every message on the wire is a named event with a structured payload.
//! Text WebSocket messages carry JSON, binary messages carry a
//! length-prefixed MessagePack encoding of the same event.
//!
//! ## Event families
//!
//! - `join` / `user-joined` / `user-left` - Presence
//! - `typing-*` / `stop-typing-*` - Ephemeral signals
//! - `send-*-message` / `receive-*-message` - Room fan-out
//! - `read-message` / `react-message` - Durable mutations
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent};
//!
//! let event: ClientEvent =
//!     codec::decode_json(r#"{"event":"join-private","data":"alice:bob"}"#).unwrap();
//! assert_eq!(event, ClientEvent::JoinPrivate("alice:bob".into()));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError};
pub use events::{
    AuthenticatePayload, ClientEvent, ConnectedPayload, ErrorPayload, JoinPayload,
    LastSeenPayload, NotificationKind, NotificationPayload, PresencePayload,
    PrivateMessagePayload, PrivateTypingPayload, ReactPayload, ReadPayload, ServerEvent,
    TypingPayload, PROTOCOL_VERSION,
};
