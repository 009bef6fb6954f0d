//! Client-side mirror of the broker's C4 signaling protocol.
//!
//! Must match `ClientMessage`/`ServerMessage` in the `flux-relay` crate
//! field-for-field — these two definitions are the two ends of the same
//! wire contract, kept in separate crates because the broker and the
//! transfer engine ship as separate binaries (one native, one to WASM).

use serde::{Deserialize, Serialize};

/// Peer role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

/// Messages sent from this client to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GenerateCode,
    JoinRoom {
        code: String,
        role: Role,
    },
    WebrtcOffer {
        target_peer_id: String,
        payload: serde_json::Value,
    },
    WebrtcAnswer {
        target_peer_id: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        target_peer_id: String,
        payload: serde_json::Value,
    },
    LockConnection {
        peer_id: String,
    },
    ReconnectWithLock {
        lock_id: String,
    },
    TransferStatus {
        status: String,
        progress: f64,
        speed: f64,
    },
}

/// Messages received from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CodeGenerated {
        code: String,
        room_id: String,
        timestamp: i64,
    },
    PeerJoined {
        peer_id: String,
        role: Role,
    },
    PeerLeft {
        peer_id: String,
    },
    ConnectionLocked {
        lock_id: String,
        expires_at: i64,
    },
    WebrtcOffer {
        from_peer_id: String,
        payload: serde_json::Value,
    },
    WebrtcAnswer {
        from_peer_id: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        from_peer_id: String,
        payload: serde_json::Value,
    },
    PeerStatus {
        from_peer_id: String,
        status: String,
        progress: f64,
        speed: f64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Control messages exchanged over the open datagram channel itself
/// (distinct from the signaling messages above, which only ever travel
/// through the broker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataChannelControl {
    FileMetadata {
        metadata: crate::storage::ChunkMetadata,
        compressed: bool,
        encrypted: bool,
    },
    TransferComplete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_code_matches_broker_wire_form() {
        let json = serde_json::to_string(&ClientMessage::GenerateCode).unwrap();
        assert_eq!(json, "{\"type\":\"generate_code\"}");
    }

    #[test]
    fn join_room_round_trips() {
        let msg = ClientMessage::JoinRoom { code: "000042".to_string(), role: Role::Sender };
        let json = serde_json::to_string(&msg).unwrap();
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
    fn data_channel_control_file_metadata_round_trips() {
        let metadata = crate::storage::ChunkMetadata::new(
            "hello.txt".to_string(),
            "text/plain".to_string(),
            13,
            16,
        );
        let msg = DataChannelControl::FileMetadata {
            metadata,
            compressed: false,
            encrypted: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"file_metadata\""));
        let parsed: DataChannelControl = serde_json::from_str(&json).unwrap();
        match parsed {
            DataChannelControl::FileMetadata { metadata, compressed, .. } => {
                assert_eq!(metadata.file_name, "hello.txt");
                assert!(!compressed);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn transfer_complete_serializes_with_no_fields() {
        let json = serde_json::to_string(&DataChannelControl::TransferComplete).unwrap();
        assert_eq!(json, "{\"type\":\"transfer_complete\"}");
    }

    #[test]
    fn server_error_round_trips() {
        let msg = ServerMessage::Error { code: "ROOM_FULL".to_string(), message: "full".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerMessage::Error { code, .. } => assert_eq!(code, "ROOM_FULL"),
            _ => panic!("wrong variant"),
        }
    }
}
