//! # huddle-core
//!
//! Presence, room routing, and durable message state for the Huddle chat
//! server.
//!
//! This crate provides the building blocks behind every connection:
//!
//! - **Registry** - Which connections are live, and for which user
//! - **Router** - Room membership and fan-out
//! - **Lifecycle** - The per-connection state machine, as a pure function
//! - **Session** - Executes lifecycle effects against the shared [`Hub`]
//! - **Stores** - Message and identity persistence boundaries
//! - **Pagination** - Day-grouped room history
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │
//!        ├──────────▶ Registry
//!        ▼
//! ┌─────────────┐
//! │   Stores    │  (durable worker, one per session)
//! └─────────────┘
//! ```

pub mod envelope;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod pagination;
pub mod registry;
pub mod room;
pub mod router;
pub mod session;
pub mod store;
pub mod telemetry;

pub use envelope::Envelope;
pub use error::{Error, Result};
pub use ids::{ConnectionHandle, MessageId, UserId};
pub use lifecycle::{Effect, Identity, Input, SessionState};
pub use memory::{MemoryIdentityStore, MemoryMessageStore};
pub use model::{ChatMessage, MessageKind, NewMessage, Reaction, UserIdentity, ValidMessage};
pub use pagination::{group_by_day, list_by_room, DayGroup, PageRequest, DEFAULT_PAGE_LIMIT};
pub use registry::{ConnectionInfo, Registry, RegistryError, UserSnapshot};
pub use room::{RoomKey, GLOBAL_ROOM};
pub use router::{Router, RouterConfig, RouterError, RouterStats};
pub use session::{CredentialVerifier, Hub, Outbox, Session};
pub use store::{IdentityStore, MessageStore};
