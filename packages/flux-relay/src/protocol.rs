//! Signaling protocol message definitions.
//!
//! The broker speaks a JSON-over-WebSocket protocol. Offer/answer/candidate
//! payloads are opaque to the broker — it only ever rewrites the envelope
//! (`from_peer_id`/`target_peer_id`), never the SDP inside.

use serde::{Deserialize, Serialize};

/// Peer role within a room. Exactly one of each role may be present at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

// ── Client → Broker ─────────────────────────────────────────────────────────

/// Messages sent from a client to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register this connection as the room's receiver and mint a fresh code.
    GenerateCode,

    /// Join a room using a previously generated code.
    JoinRoom { code: String, role: Role },

    /// Opaque SDP offer, relayed unmodified to `target_peer_id`.
    WebrtcOffer {
        target_peer_id: String,
        payload: serde_json::Value,
    },

    /// Opaque SDP answer, relayed unmodified to `target_peer_id`.
    WebrtcAnswer {
        target_peer_id: String,
        payload: serde_json::Value,
    },

    /// Opaque ICE candidate, relayed unmodified to `target_peer_id`.
    IceCandidate {
        target_peer_id: String,
        payload: serde_json::Value,
    },

    /// Mint a reconnection lock bound to `peer_id`.
    LockConnection { peer_id: String },

    /// Redeem a reconnection lock, inheriting its peer's role in the room.
    ReconnectWithLock { lock_id: String },

    /// Broadcast transfer progress to the other peer(s) in the room.
    TransferStatus {
        status: String,
        progress: f64,
        speed: f64,
    },
}

// ── Broker → Client ──────────────────────────────────────────────────────────

/// Messages sent from the broker to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `generate_code`.
    CodeGenerated {
        code: String,
        room_id: String,
        timestamp: i64,
    },

    /// A peer (re)joined the room — sent to every existing peer, including
    /// the echo to a connection that just redeemed a reconnection lock.
    PeerJoined { peer_id: String, role: Role },

    /// A peer left the room (disconnect, or reconnect-with-lock supersession).
    PeerLeft { peer_id: String },

    /// Reply to `lock_connection`.
    ConnectionLocked { lock_id: String, expires_at: i64 },

    /// Relayed offer, annotated with the sender's connection id.
    WebrtcOffer {
        from_peer_id: String,
        payload: serde_json::Value,
    },

    /// Relayed answer, annotated with the sender's connection id.
    WebrtcAnswer {
        from_peer_id: String,
        payload: serde_json::Value,
    },

    /// Relayed ICE candidate, annotated with the sender's connection id.
    IceCandidate {
        from_peer_id: String,
        payload: serde_json::Value,
    },

    /// Relayed transfer progress from a peer.
    PeerStatus {
        from_peer_id: String,
        status: String,
        progress: f64,
        speed: f64,
    },

    /// Wire-level error. `code` is one of the fixed strings in
    /// [`crate::error::Error::wire_code`].
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_code_serialization() {
        let msg = ClientMessage::GenerateCode;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"type\":\"generate_code\"}");
    }

    #[test]
    fn join_room_round_trip() {
        let msg = ClientMessage::JoinRoom {
            code: "000042".to_string(),
            role: Role::Sender,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"join_room\""));
        assert!(json.contains("\"role\":\"sender\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::JoinRoom { code, role } => {
                assert_eq!(code, "000042");
                assert_eq!(role, Role::Sender);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn webrtc_offer_round_trip() {
        let msg = ClientMessage::WebrtcOffer {
            target_peer_id: "peer-b".to_string(),
            payload: serde_json::json!({"sdp": "v=0..."}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"webrtc_offer\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::WebrtcOffer { target_peer_id, payload } => {
                assert_eq!(target_peer_id, "peer-b");
                assert_eq!(payload["sdp"], "v=0...");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn lock_connection_and_reconnect_round_trip() {
        let lock = ClientMessage::LockConnection {
            peer_id: "peer-a".to_string(),
        };
        let json = serde_json::to_string(&lock).unwrap();
        assert!(json.contains("\"type\":\"lock_connection\""));

        let reconnect = ClientMessage::ReconnectWithLock {
            lock_id: "lock-xyz".to_string(),
        };
        let json = serde_json::to_string(&reconnect).unwrap();
        assert!(json.contains("\"type\":\"reconnect_with_lock\""));
    }

    #[test]
    fn transfer_status_round_trip() {
        let msg = ClientMessage::TransferStatus {
            status: "transferring".to_string(),
            progress: 0.5,
            speed: 1024.0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn all_client_message_variants_round_trip() {
        let messages = vec![
            ClientMessage::GenerateCode,
            ClientMessage::JoinRoom { code: "000001".to_string(), role: Role::Receiver },
            ClientMessage::WebrtcOffer {
                target_peer_id: "p1".to_string(),
                payload: serde_json::json!({"sdp": "offer"}),
            },
            ClientMessage::WebrtcAnswer {
                target_peer_id: "p1".to_string(),
                payload: serde_json::json!({"sdp": "answer"}),
            },
            ClientMessage::IceCandidate {
                target_peer_id: "p1".to_string(),
                payload: serde_json::json!({"candidate": "..."}),
            },
            ClientMessage::LockConnection { peer_id: "p1".to_string() },
            ClientMessage::ReconnectWithLock { lock_id: "l1".to_string() },
            ClientMessage::TransferStatus {
                status: "waiting".to_string(),
                progress: 0.0,
                speed: 0.0,
            },
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn server_message_code_generated_serialization() {
        let msg = ServerMessage::CodeGenerated {
            code: "000042".to_string(),
            room_id: "000042".to_string(),
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"code_generated\""));
        assert!(json.contains("000042"));
    }

    #[test]
    fn server_message_error_serialization() {
        let msg = ServerMessage::Error {
            code: "ROOM_FULL".to_string(),
            message: "room already has two peers".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("ROOM_FULL"));
    }

    #[test]
    fn all_server_message_variants_round_trip() {
        let messages = vec![
            ServerMessage::CodeGenerated {
                code: "000042".to_string(),
                room_id: "000042".to_string(),
                timestamp: 0,
            },
            ServerMessage::PeerJoined {
                peer_id: "p1".to_string(),
                role: Role::Sender,
            },
            ServerMessage::PeerLeft { peer_id: "p1".to_string() },
            ServerMessage::ConnectionLocked {
                lock_id: "l1".to_string(),
                expires_at: 0,
            },
            ServerMessage::WebrtcOffer {
                from_peer_id: "p1".to_string(),
                payload: serde_json::json!({"sdp": "x"}),
            },
            ServerMessage::WebrtcAnswer {
                from_peer_id: "p1".to_string(),
                payload: serde_json::json!({"sdp": "x"}),
            },
            ServerMessage::IceCandidate {
                from_peer_id: "p1".to_string(),
                payload: serde_json::json!({"candidate": "x"}),
            },
            ServerMessage::PeerStatus {
                from_peer_id: "p1".to_string(),
                status: "transferring".to_string(),
                progress: 0.1,
                speed: 1.0,
            },
            ServerMessage::Error {
                code: "INVALID_CODE".to_string(),
                message: "no such code".to_string(),
            },
        ];

        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }
}
