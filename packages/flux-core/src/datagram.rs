//! # Reliable Datagram Adapter (C8)
//!
//! A thin, platform-agnostic contract around the browser's
//! `RTCPeerConnection`/`RTCDataChannel` pair — the only ordered, reliable,
//! message-oriented channel available once signaling (C4) has exchanged
//! offer/answer/candidates. C7 is the only consumer; it never touches
//! `web_sys` directly.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum size of a single outbound datagram.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The data channel label used for every `flux-transfer` session (§4.7).
pub const CHANNEL_LABEL: &str = "flux-transfer";

/// Tuning knobs for a new peer connection.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// STUN/TURN server URLs handed to the ICE agent.
    pub ice_servers: Vec<String>,
    /// Emit each local ICE candidate as it's discovered (default) instead
    /// of waiting for gathering to complete before emitting a signal.
    pub trickle_ice: bool,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            trickle_ice: true,
        }
    }
}

/// An outbound signaling payload produced by the adapter, relayed to the
/// peer through C4 unmodified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
}

/// Channel lifecycle events the adapter surfaces to C7.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A signaling payload ready to relay through C4.
    Signal(SignalPayload),
    /// The data channel is open — ready for `send`/`recv`. This fires only
    /// once the channel itself opens, never merely on ICE connectivity.
    Connected,
    Disconnected,
    Error(String),
    /// A datagram arrived from the peer.
    Message(Vec<u8>),
}

/// Builds a platform's [`DatagramChannel`] implementation. The Transfer
/// State Machine (C7) depends only on this trait, never on a concrete
/// channel type — tests wire in a mock/loopback channel, the wasm binary
/// wires in [`wasm::WebRtcChannel`].
pub trait DatagramChannelFactory {
    type Channel: DatagramChannel;

    /// Builds a peer endpoint. `initiator` controls whether the local
    /// `"flux-transfer"` data channel is opened eagerly or awaited via
    /// the remote offer (see §4.7).
    fn create(&self, initiator: bool, config: &DatagramConfig) -> Result<Self::Channel>;
}

/// Contract consumed by the Transfer State Machine (C7). Implementations
/// own exactly one peer connection and one data channel.
pub trait DatagramChannel {
    /// Feeds a remote signaling payload (offer, answer, or candidate).
    /// Candidates arriving before a remote description is set must be
    /// queued and replayed once the description lands.
    fn signal(&mut self, payload: SignalPayload) -> Result<()>;

    /// Sends a message over the open data channel.
    ///
    /// Fails with [`Error::NotConnected`] if the channel is not open, or
    /// [`Error::TooLarge`] if `bytes.len() > MAX_MESSAGE_SIZE`.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Drains buffered [`ChannelEvent`]s since the last poll.
    fn poll_events(&mut self) -> Vec<ChannelEvent>;

    fn is_connected(&self) -> bool;
}

/// Validates an outbound message against the datagram size limit. Shared
/// by every platform implementation so the check has one home.
pub fn check_message_size(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::TooLarge(bytes.len()));
    }
    Ok(())
}

#[cfg(target_arch = "wasm32")]
pub mod wasm;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockChannel {
        connected: bool,
        events: Vec<ChannelEvent>,
        sent: Vec<Vec<u8>>,
    }

    impl DatagramChannel for MockChannel {
        fn signal(&mut self, _payload: SignalPayload) -> Result<()> {
            Ok(())
        }

        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            check_message_size(bytes)?;
            if !self.connected {
                return Err(Error::NotConnected);
            }
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        fn poll_events(&mut self) -> Vec<ChannelEvent> {
            std::mem::take(&mut self.events)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[test]
    fn send_before_open_is_not_connected() {
        let mut channel = MockChannel::default();
        let err = channel.send(b"hi").unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn send_after_open_succeeds() {
        let mut channel = MockChannel { connected: true, ..Default::default() };
        channel.send(b"hi").unwrap();
        assert_eq!(channel.sent, vec![b"hi".to_vec()]);
    }

    #[test]
    fn oversized_message_is_rejected_even_when_connected() {
        let mut channel = MockChannel { connected: true, ..Default::default() };
        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let err = channel.send(&huge).unwrap_err();
        assert!(matches!(err, Error::TooLarge(_)));
    }

    #[test]
    fn default_config_uses_trickle_ice() {
        let config = DatagramConfig::default();
        assert!(config.trickle_ice);
        assert!(!config.ice_servers.is_empty());
    }

    #[test]
    fn signal_payload_offer_round_trips() {
        let payload = SignalPayload::Offer { sdp: "v=0...".to_string() };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        let parsed: SignalPayload = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalPayload::Offer { sdp } => assert_eq!(sdp, "v=0..."),
            _ => panic!("wrong variant"),
        }
    }
}
