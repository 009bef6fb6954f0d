//! WebSocket connection handler — the Signaling Protocol (C4) dispatch loop.
//!
//! One task per connection. `peer_id` is minted by the broker itself (the
//! transport assigns connection identity, per the data model), so there is
//! no explicit registration handshake the way some relay protocols need one.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientMessage, Role, ServerMessage};
use crate::state::{JoinOutcome, RelayState};

/// Handles a single WebSocket connection for its entire lifetime.
pub async fn handle_websocket(socket: WebSocket, state: RelayState, client_key: String) {
    let peer_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.register_connection(&peer_id, tx);
    tracing::debug!(peer_id = peer_id.as_str(), "connection opened");

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize server message"),
            }
        }
    });

    let mut current_room: Option<String> = None;

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => {
                        let close = handle_client_message(
                            &state,
                            &peer_id,
                            &client_key,
                            &mut current_room,
                            msg,
                        );
                        if close {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer_id = peer_id.as_str(), error = %e, "malformed message");
                        state.send_to_peer(
                            &peer_id,
                            ServerMessage::Error {
                                code: "INVALID_CODE".to_string(),
                                message: "unknown or malformed message".to_string(),
                            },
                        );
                    }
                }
            }
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::warn!(peer_id = peer_id.as_str(), error = %e, "websocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup: drop from room, notify remaining peer, expire the code if
    // the room is now empty.
    if let Some(room_id) = current_room {
        let (remaining, empty) = state.rooms.leave(&room_id, &peer_id);
        for peer in &remaining {
            state.send_to_peer(
                &peer.peer_id,
                ServerMessage::Error {
                    code: "PEER_DISCONNECTED".to_string(),
                    message: "the other peer disconnected".to_string(),
                },
            );
        }
        if empty {
            state.codes.expire(&room_id);
        }
    }
    state.unregister_connection(&peer_id);
    sender_task.abort();
    tracing::debug!(peer_id = peer_id.as_str(), "connection closed");
}

/// Dispatches one parsed client message. Returns true if the connection
/// should be closed (capacity errors only — see §7).
fn handle_client_message(
    state: &RelayState,
    peer_id: &str,
    client_key: &str,
    current_room: &mut Option<String>,
    msg: ClientMessage,
) -> bool {
    match msg {
        ClientMessage::GenerateCode => {
            handle_generate_code(state, peer_id, current_room);
            false
        }
        ClientMessage::JoinRoom { code, role } => {
            handle_join_room(state, peer_id, client_key, current_room, &code, role)
        }
        ClientMessage::WebrtcOffer { target_peer_id, payload } => {
            relay_opaque(state, current_room, peer_id, &target_peer_id, |from_peer_id| {
                ServerMessage::WebrtcOffer { from_peer_id, payload }
            });
            false
        }
        ClientMessage::WebrtcAnswer { target_peer_id, payload } => {
            relay_opaque(state, current_room, peer_id, &target_peer_id, |from_peer_id| {
                ServerMessage::WebrtcAnswer { from_peer_id, payload }
            });
            false
        }
        ClientMessage::IceCandidate { target_peer_id, payload } => {
            relay_opaque(state, current_room, peer_id, &target_peer_id, |from_peer_id| {
                ServerMessage::IceCandidate { from_peer_id, payload }
            });
            false
        }
        ClientMessage::LockConnection { peer_id: target } => {
            handle_lock_connection(state, current_room, &target);
            false
        }
        ClientMessage::ReconnectWithLock { lock_id } => {
            handle_reconnect_with_lock(state, peer_id, current_room, &lock_id);
            false
        }
        ClientMessage::TransferStatus { status, progress, speed } => {
            if let Some(room_id) = current_room.as_deref() {
                state.broadcast_to_room(
                    room_id,
                    Some(peer_id),
                    ServerMessage::PeerStatus {
                        from_peer_id: peer_id.to_string(),
                        status,
                        progress,
                        speed,
                    },
                );
            }
            false
        }
    }
}

fn handle_generate_code(state: &RelayState, peer_id: &str, current_room: &mut Option<String>) {
    let code = match state.codes.generate_unused() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "code space exhausted");
            return;
        }
    };
    state.codes.register(&code, peer_id);
    state.rooms.join(&code, peer_id, Role::Receiver);
    *current_room = Some(code.clone());

    state.send_to_peer(
        peer_id,
        ServerMessage::CodeGenerated {
            code: code.clone(),
            room_id: code,
            timestamp: Utc::now().timestamp_millis(),
        },
    );
}

/// Runs the §4.2 abuse-control gate, then the join itself. Returns true
/// (close the connection) only on `ROOM_FULL`.
fn handle_join_room(
    state: &RelayState,
    peer_id: &str,
    client_key: &str,
    current_room: &mut Option<String>,
    code: &str,
    role: Role,
) -> bool {
    if state.abuse.is_locked(client_key) {
        send_error(state, peer_id, "RATE_LIMITED", "too many failed attempts, try again later");
        return false;
    }
    if !state.abuse.check_rate(client_key) {
        send_error(state, peer_id, "RATE_LIMITED", "rate limit exceeded");
        return false;
    }
    state.abuse.record_attempt(client_key);

    if !state.codes.validate(code) {
        state.abuse.record_failure(client_key);
        send_error(state, peer_id, "INVALID_CODE", "invalid or expired code");
        return false;
    }
    state.abuse.record_success(client_key);

    match state.rooms.join(code, peer_id, role) {
        JoinOutcome::RoomFull => {
            send_error(state, peer_id, "ROOM_FULL", "room already has two peers");
            true
        }
        JoinOutcome::Joined { .. } => {
            *current_room = Some(code.to_string());
            state.broadcast_to_room(
                code,
                Some(peer_id),
                ServerMessage::PeerJoined {
                    peer_id: peer_id.to_string(),
                    role,
                },
            );
            false
        }
    }
}

fn relay_opaque(
    state: &RelayState,
    current_room: &Option<String>,
    from_peer_id: &str,
    target_peer_id: &str,
    build: impl FnOnce(String) -> ServerMessage,
) {
    let Some(room_id) = current_room.as_deref() else {
        return;
    };
    if state.rooms.peer(room_id, target_peer_id).is_none() {
        // Target absent — best-effort payload, dropped silently (§4.3).
        return;
    }
    state.send_to_peer(target_peer_id, build(from_peer_id.to_string()));
}

fn handle_lock_connection(state: &RelayState, current_room: &Option<String>, target_peer_id: &str) {
    let Some(room_id) = current_room.as_deref() else {
        return;
    };
    if let Some((lock_id, expires_at)) = state.rooms.lock_connection(room_id, target_peer_id) {
        state.send_to_peer(target_peer_id, ServerMessage::ConnectionLocked { lock_id, expires_at });
    }
}

fn handle_reconnect_with_lock(
    state: &RelayState,
    peer_id: &str,
    current_room: &mut Option<String>,
    lock_id: &str,
) {
    match state.rooms.reconnect_with_lock(lock_id, peer_id) {
        Ok((room_id, role)) => {
            *current_room = Some(room_id);
            state.send_to_peer(
                peer_id,
                ServerMessage::PeerJoined {
                    peer_id: peer_id.to_string(),
                    role,
                },
            );
        }
        Err(e) => {
            if let Some(code) = e.wire_code() {
                send_error(state, peer_id, code, &e.to_string());
            }
        }
    }
}

fn send_error(state: &RelayState, peer_id: &str, code: &str, message: &str) {
    state.send_to_peer(
        peer_id,
        ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;

    fn state() -> RelayState {
        RelayState::new(RelayConfig::default())
    }

    #[test]
    fn generate_code_registers_receiver_and_room() {
        let state = state();
        let mut room = None;
        handle_generate_code(&state, "peer-a", &mut room);
        let room_id = room.unwrap();
        assert!(state.codes.validate(&room_id));
        assert_eq!(state.rooms.peer(&room_id, "peer-a").unwrap().role, Role::Receiver);
    }

    #[test]
    fn join_room_with_invalid_code_records_failure_not_rate() {
        let state = state();
        let mut room = None;
        let close = handle_join_room(&state, "peer-b", "1.2.3.4", &mut room, "000000", Role::Sender);
        assert!(!close);
        assert!(room.is_none());
        assert!(!state.abuse.is_locked("1.2.3.4"));
    }

    #[test]
    fn join_room_third_peer_is_rejected_and_closes() {
        let state = state();
        state.codes.register("000042", "peer-a");
        state.rooms.join("000042", "peer-a", Role::Receiver);
        state.rooms.join("000042", "peer-b", Role::Sender);

        let mut room = None;
        let close = handle_join_room(&state, "peer-c", "1.2.3.4", &mut room, "000042", Role::Sender);
        assert!(close);
    }

    #[test]
    fn lockout_after_three_failures_yields_rate_limited() {
        let state = state();
        let mut room = None;
        for _ in 0..3 {
            handle_join_room(&state, "peer-x", "1.2.3.4", &mut room, "nope", Role::Sender);
        }
        assert!(state.abuse.is_locked("1.2.3.4"));
    }
}
