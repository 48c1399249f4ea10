//! Error taxonomy shared by the stores, the session, and the HTTP surface.

use huddle_protocol::ProtocolError;
use thiserror::Error;

/// Result alias for Huddle operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors visible to callers of the durable API and the connection
/// lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Credential missing or rejected. Fatal to the connection attempt.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Malformed or incomplete input. The connection stays open.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A mutation referenced a message or user that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Durable store failure.
    #[error("Server error: {0}")]
    Server(String),
}

impl Error {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Auth(_) => "auth",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Server(_) => "server",
        }
    }

    /// Code carried by the `error` event sent back to a connection.
    #[must_use]
    pub fn wire_code(&self) -> u16 {
        match self {
            Error::Auth(_) => 4001,
            Error::Validation(_) => 4000,
            Error::NotFound(_) => 4004,
            Error::Conflict(_) => 4009,
            Error::Server(_) => 5000,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Validation(err.to_string())
    }
}
