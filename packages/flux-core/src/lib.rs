//! # Flux Core
//!
//! The peer-to-peer file-transfer engine: chunking and optional
//! compression (C5/C6) layered on a reliable ordered datagram channel
//! (C8), driven by a sender/receiver state machine (C7) that negotiates
//! the channel through the [`flux-relay`](https://github.com/user/flux)
//! signaling broker.
//!
//! ## Module map
//!
//! - [`signaling`] — client-side mirror of the broker's wire protocol (C4)
//! - [`storage`] — chunk framing: split, serialize, reassemble (C5)
//! - [`compression`] — per-chunk compression policy and codec (C6)
//! - [`transfer`] — the sender/receiver state machine (C7)
//! - [`datagram`] — the reliable datagram channel contract and its
//!   browser-backed implementation (C8)
//! - [`error`] — the crate's error taxonomy
//!
//! This crate never touches file bytes on disk or draws any UI — it is
//! linked into a native app or compiled to WASM by a host that owns the
//! file picker, the signaling socket, and the progress display.

pub mod compression;
pub mod datagram;
pub mod error;
pub mod signaling;
pub mod storage;
pub mod transfer;

pub use error::{Error, Result};
pub use transfer::{OutboundFile, TransferConfig, TransferEvent, TransferSession, TransferState};

/// Returns the version of flux-core.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
