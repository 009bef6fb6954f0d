//! # Transfer State Machine (C7)
//!
//! Drives a single sender or receiver session: pairing through the broker
//! (C4), negotiating the datagram channel (C8), then streaming/reassembling
//! framed chunks (C5) with optional per-chunk compression (C6).
//!
//! The session never talks to the network directly. It is handed inbound
//! [`ServerMessage`]s and [`ChannelEvent`]s by an embedding event loop, and
//! in turn exposes queues of outbound [`ClientMessage`]s (to send to the
//! broker) and [`TransferEvent`]s (to surface to the UI). This mirrors the
//! single-threaded cooperative scheduling the engine runs under: every
//! suspension point — waiting on the next message, yielding between chunks
//! — is explicit, and there is no shared mutable state across tasks.

use std::collections::VecDeque;
use std::time::Duration;

use crate::compression::{compress, decompress, should_compress};
use crate::datagram::{
    ChannelEvent, DatagramChannel, DatagramChannelFactory, DatagramConfig, SignalPayload,
};
use crate::error::{Error, Result};
use crate::signaling::{ClientMessage, DataChannelControl, Role, ServerMessage};
use crate::storage::{
    chunk_stream, deserialize_chunk, serialize_chunk, Chunk, ChunkAccumulator, ChunkMetadata,
    DEFAULT_CHUNK_SIZE,
};

/// Cooperative pause between chunks, so a single-threaded runtime doesn't
/// monopolize the executor pushing into the data channel's send buffer.
/// Not a timeout — see §5 "Timeouts".
pub const CHUNK_YIELD_MS: u64 = 1;

/// Small debounce between emitting `file_metadata` and the first chunk, so
/// the receiver's control-message handler has landed before bulk data
/// starts arriving (ordering is guaranteed by the transport regardless;
/// this just avoids a burst at the moment a file begins).
pub const METADATA_DEBOUNCE_MS: u64 = 10;

/// Lifecycle state of a [`TransferSession`]. Every transition below is
/// triggered by exactly one event (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Idle,
    Connecting,
    Waiting,
    Transferring,
    Completed,
    Cancelled,
    Error,
}

/// External configuration for the transfer engine (§6).
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub chunk_size: usize,
    pub datagram: DatagramConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            enable_encryption: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            datagram: DatagramConfig::default(),
        }
    }
}

/// One file queued for the sender path, not yet split into chunks.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub file_name: String,
    pub file_type: String,
    pub data: Vec<u8>,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The receiver's pairing code is ready to display.
    CodeReady(String),
    StateChanged(TransferState),
    ConnectionLocked { lock_id: String, expires_at: i64 },
    Progress { bytes_transferred: u64, total_bytes: u64 },
    FileReceived { file_name: String, file_type: String, data: Vec<u8> },
    TransferComplete,
    Cancelled,
    Error(String),
}

struct SendCursor {
    chunks: VecDeque<Chunk>,
}

/// Drives one sender or receiver session end to end. Generic over the
/// datagram channel factory so tests can substitute a mock/loopback
/// channel without touching any dispatch logic below.
pub struct TransferSession<F: DatagramChannelFactory> {
    role: Role,
    config: TransferConfig,
    factory: F,
    channel: Option<F::Channel>,

    state: TransferState,
    self_peer_id: String,
    room_id: Option<String>,
    target_peer_id: Option<String>,

    accumulator: ChunkAccumulator,
    pending_metadata: Option<ChunkMetadata>,
    current_file_compressed: bool,
    bytes_transferred: u64,
    total_bytes: u64,

    outbound_files: VecDeque<OutboundFile>,
    send_cursor: Option<SendCursor>,
    transfer_finished_sent: bool,

    signaling_out: Vec<ClientMessage>,
    events: Vec<TransferEvent>,
}

impl<F: DatagramChannelFactory> TransferSession<F> {
    /// Starts the receiver path (§4.6): asks the broker to mint a code and
    /// enters `waiting`.
    pub fn initialize_as_receiver(factory: F, config: TransferConfig, self_peer_id: String) -> Self {
        let mut session = Self::new(Role::Receiver, factory, config, self_peer_id);
        session.set_state(TransferState::Waiting);
        session.signaling_out.push(ClientMessage::GenerateCode);
        session
    }

    /// Starts the sender path (§4.6): joins the receiver's room and enters
    /// `connecting`.
    pub fn initialize_as_sender(
        factory: F,
        config: TransferConfig,
        self_peer_id: String,
        code: String,
        files: Vec<OutboundFile>,
    ) -> Self {
        let mut session = Self::new(Role::Sender, factory, config, self_peer_id);
        session.room_id = Some(code.clone());
        session.outbound_files = files.into();
        session.set_state(TransferState::Connecting);
        session.signaling_out.push(ClientMessage::JoinRoom { code, role: Role::Sender });
        session
    }

    fn new(role: Role, factory: F, config: TransferConfig, self_peer_id: String) -> Self {
        Self {
            role,
            config,
            factory,
            channel: None,
            state: TransferState::Idle,
            self_peer_id,
            room_id: None,
            target_peer_id: None,
            accumulator: ChunkAccumulator::default(),
            pending_metadata: None,
            current_file_compressed: false,
            bytes_transferred: 0,
            total_bytes: 0,
            outbound_files: VecDeque::new(),
            send_cursor: None,
            transfer_finished_sent: false,
            signaling_out: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Drains pending broker-bound messages — the embedding event loop
    /// sends each one over the signaling socket.
    pub fn take_outbound_signaling(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.signaling_out)
    }

    /// Drains pending events for the UI layer.
    pub fn take_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            self.state = state;
            self.events.push(TransferEvent::StateChanged(state));
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, TransferState::Completed | TransferState::Cancelled)
    }

    /// `cancel()` moves to `cancelled` unconditionally and tears down local
    /// state (§4.6). Already-buffered outbound bytes may still reach the
    /// peer — no attempt is made to recall them.
    pub fn cancel(&mut self) {
        self.channel = None;
        self.accumulator = ChunkAccumulator::default();
        self.pending_metadata = None;
        self.send_cursor = None;
        self.outbound_files.clear();
        self.state = TransferState::Cancelled;
        self.events.push(TransferEvent::Cancelled);
    }

    /// Requests a reconnection lock bound to this session's own peer id
    /// (§4.3 `lock_connection`), for foreground/background reconnection.
    pub fn request_connection_lock(&mut self) {
        self.signaling_out
            .push(ClientMessage::LockConnection { peer_id: self.self_peer_id.clone() });
    }

    /// Redeems a previously issued lock on a fresh connection, inheriting
    /// the old one's role and room.
    pub fn reconnect_with_lock(&mut self, lock_id: String) {
        self.signaling_out.push(ClientMessage::ReconnectWithLock { lock_id });
    }

    fn create_channel(&mut self, initiator: bool) {
        match self.factory.create(initiator, &self.config.datagram) {
            Ok(channel) => self.channel = Some(channel),
            Err(e) => {
                self.events.push(TransferEvent::Error(format!("channel setup failed: {e}")));
                self.set_state(TransferState::Error);
            }
        }
    }

    /// Dispatches one message received from the broker (§4.6).
    pub fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::CodeGenerated { code, room_id, .. } => {
                self.room_id = Some(room_id);
                self.events.push(TransferEvent::CodeReady(code));
            }
            ServerMessage::PeerJoined { peer_id, role } => self.on_peer_joined(peer_id, role),
            ServerMessage::WebrtcOffer { from_peer_id, payload } => {
                self.on_webrtc_offer(from_peer_id, payload)
            }
            ServerMessage::WebrtcAnswer { from_peer_id, payload } => {
                self.on_webrtc_answer(from_peer_id, payload)
            }
            ServerMessage::IceCandidate { from_peer_id, payload } => {
                self.on_ice_candidate(from_peer_id, payload)
            }
            ServerMessage::PeerLeft { .. } => {
                if !self.is_terminal() {
                    self.set_state(TransferState::Error);
                    self.events.push(TransferEvent::Error("peer disconnected".to_string()));
                }
            }
            ServerMessage::ConnectionLocked { lock_id, expires_at } => {
                self.events.push(TransferEvent::ConnectionLocked { lock_id, expires_at });
            }
            ServerMessage::PeerStatus { .. } => {
                // Progress chatter from the peer; not modeled as a local
                // state transition. Left for a UI layer to surface.
            }
            ServerMessage::Error { code, message } => {
                self.events.push(TransferEvent::Error(format!("{code}: {message}")));
                if matches!(code.as_str(), "PEER_DISCONNECTED" | "LOCK_EXPIRED" | "LOCK_NOT_FOUND") {
                    self.set_state(TransferState::Error);
                }
            }
        }
        self.drain_channel_events();
    }

    fn on_peer_joined(&mut self, peer_id: String, role: Role) {
        if peer_id == self.self_peer_id {
            // Echo from a redeemed reconnection lock: inherit the role,
            // do not treat ourselves as our own counterpart.
            self.role = role;
            return;
        }
        if role == self.role {
            return;
        }
        self.target_peer_id = Some(peer_id);
        if self.role == Role::Receiver {
            self.set_state(TransferState::Connecting);
            self.create_channel(true);
        }
        // Sender awaits `webrtc_offer`; the receiver is the initiator.
    }

    fn on_webrtc_offer(&mut self, from_peer_id: String, payload: serde_json::Value) {
        if self.role != Role::Sender {
            return;
        }
        if self.channel.is_none() {
            self.create_channel(false);
        }
        self.target_peer_id = Some(from_peer_id);
        self.feed_signal(payload);
    }

    fn on_webrtc_answer(&mut self, _from_peer_id: String, payload: serde_json::Value) {
        if self.role != Role::Receiver {
            return;
        }
        self.feed_signal(payload);
    }

    fn on_ice_candidate(&mut self, from_peer_id: String, payload: serde_json::Value) {
        if self.target_peer_id.is_none() {
            self.target_peer_id = Some(from_peer_id);
        }
        self.feed_signal(payload);
    }

    fn feed_signal(&mut self, payload: serde_json::Value) {
        let Ok(signal) = serde_json::from_value::<SignalPayload>(payload) else {
            return;
        };
        if let Some(channel) = self.channel.as_mut() {
            let _ = channel.signal(signal);
        }
    }

    /// Drains events surfaced by the datagram channel — signals to relay
    /// through the broker, `connected`/`disconnected`, and inbound
    /// datagrams.
    fn drain_channel_events(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        let channel_events = channel.poll_events();
        self.channel = Some(channel);

        for event in channel_events {
            match event {
                ChannelEvent::Signal(payload) => self.relay_signal(payload),
                ChannelEvent::Connected => self.set_state(TransferState::Transferring),
                ChannelEvent::Disconnected | ChannelEvent::Error(_) => {
                    if !self.is_terminal() {
                        self.set_state(TransferState::Error);
                        self.events.push(TransferEvent::Error("datagram channel failed".to_string()));
                    }
                }
                ChannelEvent::Message(bytes) => self.handle_incoming_datagram(bytes),
            }
        }
    }

    fn relay_signal(&mut self, payload: SignalPayload) {
        let Some(target_peer_id) = self.target_peer_id.clone() else {
            return;
        };
        let value = serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null);
        let msg = match payload {
            SignalPayload::Offer { .. } => ClientMessage::WebrtcOffer { target_peer_id, payload: value },
            SignalPayload::Answer { .. } => ClientMessage::WebrtcAnswer { target_peer_id, payload: value },
            SignalPayload::Candidate { .. } => ClientMessage::IceCandidate { target_peer_id, payload: value },
        };
        self.signaling_out.push(msg);
    }

    /// Dispatches one inbound datagram (§4.6 step 5): a UTF-8 JSON payload
    /// with a known `type` is control; anything else is a framed chunk.
    fn handle_incoming_datagram(&mut self, bytes: Vec<u8>) {
        if let Ok(text) = std::str::from_utf8(&bytes) {
            if let Ok(control) = serde_json::from_str::<DataChannelControl>(text) {
                self.handle_control_message(control);
                return;
            }
        }
        self.handle_chunk(&bytes);
    }

    fn handle_control_message(&mut self, control: DataChannelControl) {
        match control {
            DataChannelControl::FileMetadata { metadata, compressed, .. } => {
                self.accumulator.reset(metadata.total_chunks);
                self.current_file_compressed = compressed;
                self.total_bytes = metadata.total_size;
                self.bytes_transferred = 0;
                self.pending_metadata = Some(metadata);
            }
            DataChannelControl::TransferComplete => {
                self.set_state(TransferState::Completed);
                self.events.push(TransferEvent::TransferComplete);
            }
        }
    }

    fn handle_chunk(&mut self, bytes: &[u8]) {
        let mut chunk = match deserialize_chunk(bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.events.push(TransferEvent::Error(format!("malformed chunk: {e}")));
                return;
            }
        };
        let logical_size = chunk.size as u64;
        if self.current_file_compressed {
            match decompress(&chunk.payload) {
                Ok(payload) => chunk.payload = payload,
                Err(e) => {
                    self.events.push(TransferEvent::Error(format!("decompression failed: {e}")));
                    self.set_state(TransferState::Error);
                    return;
                }
            }
        }
        if !self.accumulator.add_chunk(chunk) {
            return; // duplicate index, benign
        }
        self.bytes_transferred += logical_size;
        self.events.push(TransferEvent::Progress {
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
        });
        if self.accumulator.is_complete() {
            if let Some(metadata) = self.pending_metadata.take() {
                if let Ok(data) = self.accumulator.merge() {
                    self.events.push(TransferEvent::FileReceived {
                        file_name: metadata.file_name,
                        file_type: metadata.file_type,
                        data,
                    });
                }
            }
        }
    }

    // ── Sender-side chunk pump ──────────────────────────────────────────

    fn begin_file(&mut self, file: OutboundFile) -> Result<()> {
        let chunk_size = self.config.chunk_size;
        let total_size = file.data.len() as u64;
        let mut metadata =
            ChunkMetadata::new(file.file_name.clone(), file.file_type.clone(), total_size, chunk_size);
        let compressed = self.config.enable_compression && should_compress(total_size);
        metadata.compressed = compressed;
        self.current_file_compressed = compressed;
        self.total_bytes = total_size;
        self.bytes_transferred = 0;

        let control = DataChannelControl::FileMetadata { metadata, compressed, encrypted: false };
        let json = serde_json::to_string(&control)?;
        self.send_bytes(json.as_bytes())?;

        let chunks = chunk_stream(&file.data, chunk_size)?;
        self.send_cursor = Some(SendCursor { chunks: chunks.into() });
        Ok(())
    }

    fn send_chunk(&mut self, chunk: Chunk) -> Result<()> {
        let logical_size = chunk.size as u64;
        let payload = if self.current_file_compressed {
            compress(&chunk.payload)
        } else {
            chunk.payload.clone()
        };
        let wire_chunk = Chunk { index: chunk.index, size: chunk.size, payload };
        self.send_bytes(&serialize_chunk(&wire_chunk))?;
        self.bytes_transferred += logical_size;
        self.events.push(TransferEvent::Progress {
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
        });
        Ok(())
    }

    fn finish_sending(&mut self) -> Result<()> {
        let json = serde_json::to_string(&DataChannelControl::TransferComplete)?;
        self.send_bytes(json.as_bytes())?;
        self.transfer_finished_sent = true;
        self.set_state(TransferState::Completed);
        self.events.push(TransferEvent::TransferComplete);
        Ok(())
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(Error::NotConnected)?;
        channel.send(bytes)
    }

    /// Advances the sender pipeline by exactly one unit of work: start the
    /// next file's metadata, send the next chunk of the file in flight, or
    /// — once every file and `transfer_complete` have gone out — do
    /// nothing. No-op for the receiver path and while not `transferring`.
    ///
    /// The spec forbids concurrent in-flight files: this never emits file
    /// N+1's metadata before file N's last chunk has been handed to the
    /// channel (`send_cursor` gates it).
    pub async fn pump(&mut self) -> Result<()> {
        self.drain_channel_events();
        if self.role != Role::Sender || self.state != TransferState::Transferring {
            return Ok(());
        }

        if self.send_cursor.is_none() {
            let Some(file) = self.outbound_files.pop_front() else {
                if !self.transfer_finished_sent {
                    self.finish_sending()?;
                }
                return Ok(());
            };
            self.begin_file(file)?;
            yield_for(METADATA_DEBOUNCE_MS).await;
            return Ok(());
        }

        let next_chunk = self.send_cursor.as_mut().and_then(|cursor| cursor.chunks.pop_front());
        match next_chunk {
            Some(chunk) => {
                self.send_chunk(chunk)?;
                yield_for(CHUNK_YIELD_MS).await;
            }
            None => self.send_cursor = None,
        }
        Ok(())
    }

    /// Runs [`Self::pump`] until the sender has emitted `transfer_complete`
    /// or the session left `transferring` (error/cancel).
    pub async fn run_sender_to_completion(&mut self) -> Result<()> {
        while self.role == Role::Sender
            && self.state == TransferState::Transferring
            && (!self.outbound_files.is_empty() || self.send_cursor.is_some() || !self.transfer_finished_sent)
        {
            self.pump().await?;
        }
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
async fn yield_for(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(target_arch = "wasm32")]
async fn yield_for(_millis: u64) {
    // No timer feature on the wasm tokio build; a bare reschedule point
    // is enough to avoid monopolizing the single-threaded executor.
    tokio::task::yield_now().await;
}
