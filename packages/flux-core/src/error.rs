//! # Error Handling
//!
//! Error taxonomy for the transfer engine, organized by which component
//! raises it. Every variant maps to a stable numeric code for the FFI/WASM
//! boundary, mirroring how [`crate::signaling::ServerMessage::Error`]'s wire
//! `code` string serves the same purpose one layer down at the broker.
//!
//! ## Error codes
//!
//! - 100-199: Chunk Framing (C5)
//! - 200-299: Compression (C6)
//! - 300-399: Transfer State Machine (C7)
//! - 400-499: Reliable Datagram Adapter (C8)
//! - 900-999: Internal

use thiserror::Error;

/// Result type alias for flux-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // ── Chunk Framing (100-199) ─────────────────────────────────────────
    /// A chunk frame is shorter than the 8-byte header, or its declared
    /// `size` overruns the bytes actually present.
    #[error("malformed chunk frame: {0}")]
    Malformed(String),

    /// `merge()` was called while at least one chunk index is still missing.
    #[error("transfer incomplete: {0} chunk(s) missing")]
    Incomplete(usize),

    // ── Compression (200-299) ───────────────────────────────────────────
    /// The compressed stream could not be inflated.
    #[error("decompression failed: {0}")]
    Decompress(String),

    // ── Transfer State Machine (300-399) ────────────────────────────────
    /// An operation was attempted that is illegal for the session's current
    /// `TransferState` (e.g. sending a chunk before the channel opens).
    #[error("invalid transfer state: {0}")]
    InvalidState(String),

    /// A control or chunk message arrived that could not be parsed as
    /// either known JSON control type or a framed chunk.
    #[error("unrecognized datagram payload")]
    UnrecognizedPayload,

    // ── Reliable Datagram Adapter (400-499) ─────────────────────────────
    /// `send()` was called before the channel reached the open state.
    #[error("datagram channel is not connected")]
    NotConnected,

    /// A single outbound message exceeded the 16 MiB datagram limit.
    #[error("message of {0} bytes exceeds the 16 MiB datagram limit")]
    TooLarge(usize),

    /// The channel failed at the transport or ICE layer.
    #[error("datagram channel error: {0}")]
    ChannelError(String),

    // ── Internal (900-999) ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::Malformed(_) => 100,
            Error::Incomplete(_) => 101,

            Error::Decompress(_) => 200,

            Error::InvalidState(_) => 300,
            Error::UnrecognizedPayload => 301,

            Error::NotConnected => 400,
            Error::TooLarge(_) => 401,
            Error::ChannelError(_) => 402,

            Error::Serde(_) => 900,
            Error::Io(_) => 901,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped_by_component() {
        assert_eq!(Error::Malformed("x".into()).code(), 100);
        assert_eq!(Error::Incomplete(3).code(), 101);
        assert_eq!(Error::Decompress("x".into()).code(), 200);
        assert_eq!(Error::InvalidState("x".into()).code(), 300);
        assert_eq!(Error::NotConnected.code(), 400);
        assert_eq!(Error::TooLarge(17_000_000).code(), 401);
    }

    #[test]
    fn incomplete_message_reports_missing_count() {
        let err = Error::Incomplete(4);
        assert!(err.to_string().contains('4'));
    }
}
