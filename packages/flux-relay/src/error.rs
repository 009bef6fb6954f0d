//! Error taxonomy for the broker.
//!
//! Every variant that is ever sent to a client carries a fixed wire code
//! (§4.3); internal failures do not.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("room is full")]
    RoomFull,

    #[error("invalid or expired code")]
    InvalidCode,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("connection lock expired")]
    LockExpired,

    #[error("connection lock not found")]
    LockNotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("code space exhausted")]
    CapacityExhausted,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The external wire value sent in `ServerMessage::Error { code, .. }`.
    /// Internal-only errors (`CapacityExhausted`, `Serde`, `Io`) have no
    /// wire representation — callers must not surface them to a client.
    pub fn wire_code(&self) -> Option<&'static str> {
        match self {
            Error::RoomFull => Some("ROOM_FULL"),
            Error::InvalidCode => Some("INVALID_CODE"),
            Error::PeerDisconnected => Some("PEER_DISCONNECTED"),
            Error::LockExpired => Some("LOCK_EXPIRED"),
            Error::LockNotFound => Some("LOCK_NOT_FOUND"),
            Error::RateLimited => Some("RATE_LIMITED"),
            Error::CapacityExhausted | Error::Serde(_) | Error::Io(_) => None,
        }
    }

    /// Whether this error closes the connection outright (vs. being
    /// reported while the session continues).
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Error::RoomFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_spec_strings() {
        assert_eq!(Error::RoomFull.wire_code(), Some("ROOM_FULL"));
        assert_eq!(Error::InvalidCode.wire_code(), Some("INVALID_CODE"));
        assert_eq!(Error::PeerDisconnected.wire_code(), Some("PEER_DISCONNECTED"));
        assert_eq!(Error::LockExpired.wire_code(), Some("LOCK_EXPIRED"));
        assert_eq!(Error::LockNotFound.wire_code(), Some("LOCK_NOT_FOUND"));
        assert_eq!(Error::RateLimited.wire_code(), Some("RATE_LIMITED"));
    }

    #[test]
    fn internal_errors_have_no_wire_code() {
        assert_eq!(Error::CapacityExhausted.wire_code(), None);
    }

    #[test]
    fn only_room_full_is_fatal_to_the_connection() {
        assert!(Error::RoomFull.is_fatal_to_connection());
        assert!(!Error::RateLimited.is_fatal_to_connection());
        assert!(!Error::PeerDisconnected.is_fatal_to_connection());
    }
}
