//! Broker state: the Code Registry (C1), Abuse Control (C2), and Room
//! Manager (C3). All data structures are concurrent (DashMap) so connection
//! tasks never block on each other.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Role, ServerMessage};

/// Length of a generated code, per spec (fixed; do not auto-detect).
pub const CODE_LENGTH: usize = 6;

const DEFAULT_CODE_TTL_SECS: i64 = 300;
const DEFAULT_LOCK_TTL_SECS: i64 = 300;
const DEFAULT_RATE_WINDOW_SECS: i64 = 60;
const DEFAULT_RATE_LIMIT: u32 = 10;
const DEFAULT_LOCKOUT_THRESHOLD: u32 = 3;
const DEFAULT_LOCKOUT_SECS: i64 = 300;
const MAX_ROOM_POPULATION: usize = 2;
const CODE_GENERATION_RETRIES: u32 = 100;

/// Broker configuration — every field here is a tuning knob on a default
/// already fixed by the spec; tests exercise the fixed defaults directly.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub code_ttl_secs: i64,
    pub lock_ttl_secs: i64,
    pub rate_window_secs: i64,
    pub rate_limit: u32,
    pub lockout_threshold: u32,
    pub lockout_secs: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            code_ttl_secs: DEFAULT_CODE_TTL_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
            rate_limit: DEFAULT_RATE_LIMIT,
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            lockout_secs: DEFAULT_LOCKOUT_SECS,
            cleanup_interval_secs: 30,
        }
    }
}

// ── C1: Code Registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CodeEntry {
    receiver_peer_id: String,
    created_at: chrono::DateTime<Utc>,
}

/// Allocates short-lived numeric codes and validates them against the
/// registered receiver's connection.
#[derive(Clone)]
pub struct CodeRegistry {
    codes: Arc<DashMap<String, CodeEntry>>,
    ttl_secs: i64,
}

impl CodeRegistry {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            codes: Arc::new(DashMap::new()),
            ttl_secs,
        }
    }

    pub fn register(&self, code: &str, receiver_peer_id: &str) {
        self.codes.insert(
            code.to_string(),
            CodeEntry {
                receiver_peer_id: receiver_peer_id.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    /// True iff `code` is registered and unexpired. Evicts it if expired.
    pub fn validate(&self, code: &str) -> bool {
        let Some(entry) = self.codes.get(code) else {
            return false;
        };
        let age = Utc::now().timestamp() - entry.created_at.timestamp();
        if age > self.ttl_secs {
            drop(entry);
            self.codes.remove(code);
            return false;
        }
        true
    }

    pub fn expire(&self, code: &str) {
        self.codes.remove(code);
    }

    pub fn receiver_of(&self, code: &str) -> Option<String> {
        self.codes.get(code).map(|e| e.receiver_peer_id.clone())
    }

    /// Mints an unused `CODE_LENGTH`-digit decimal code. Retries up to 100
    /// times; on exhaustion, sweeps expired codes and retries 100 more
    /// times before failing.
    pub fn generate_unused(&self) -> Result<String, crate::error::Error> {
        let mut rng = rand::thread_rng();
        let ceiling = 10_u32.pow(CODE_LENGTH as u32);

        for _ in 0..CODE_GENERATION_RETRIES {
            let candidate = format!("{:0width$}", rng.gen_range(0..ceiling), width = CODE_LENGTH);
            if !self.is_live(&candidate) {
                return Ok(candidate);
            }
        }

        self.sweep_expired();

        for _ in 0..CODE_GENERATION_RETRIES {
            let candidate = format!("{:0width$}", rng.gen_range(0..ceiling), width = CODE_LENGTH);
            if !self.is_live(&candidate) {
                return Ok(candidate);
            }
        }

        Err(crate::error::Error::CapacityExhausted)
    }

    fn is_live(&self, code: &str) -> bool {
        self.codes
            .get(code)
            .map(|e| Utc::now().timestamp() - e.created_at.timestamp() <= self.ttl_secs)
            .unwrap_or(false)
    }

    fn sweep_expired(&self) {
        let now = Utc::now().timestamp();
        let expired: Vec<String> = self
            .codes
            .iter()
            .filter(|entry| now - entry.created_at.timestamp() > self.ttl_secs)
            .map(|entry| entry.key().clone())
            .collect();
        for code in expired {
            self.codes.remove(&code);
        }
    }
}

// ── C2: Abuse Control ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RateLimitBucket {
    window_start: chrono::DateTime<Utc>,
    attempts_in_window: u32,
}

#[derive(Debug, Clone)]
struct LockoutRecord {
    failed_attempts: u32,
    locked_until: Option<chrono::DateTime<Utc>>,
}

/// Per-client rate limiting and consecutive-failure lockout.
#[derive(Clone)]
pub struct AbuseControl {
    buckets: Arc<DashMap<String, RateLimitBucket>>,
    lockouts: Arc<DashMap<String, LockoutRecord>>,
    window_secs: i64,
    rate_limit: u32,
    lockout_threshold: u32,
    lockout_secs: i64,
}

impl AbuseControl {
    pub fn new(window_secs: i64, rate_limit: u32, lockout_threshold: u32, lockout_secs: i64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            lockouts: Arc::new(DashMap::new()),
            window_secs,
            rate_limit,
            lockout_threshold,
            lockout_secs,
        }
    }

    /// True iff `key` has not yet reached the rate limit in the current
    /// rolling window. Does not itself record an attempt.
    pub fn check_rate(&self, key: &str) -> bool {
        match self.buckets.get(key) {
            Some(bucket) => {
                let age = Utc::now().timestamp() - bucket.window_start.timestamp();
                if age >= self.window_secs {
                    true
                } else {
                    bucket.attempts_in_window < self.rate_limit
                }
            }
            None => true,
        }
    }

    /// Records an attempt, rolling the window if it has elapsed.
    pub fn record_attempt(&self, key: &str) {
        let now = Utc::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| RateLimitBucket {
            window_start: now,
            attempts_in_window: 0,
        });

        if now.timestamp() - bucket.window_start.timestamp() >= self.window_secs {
            bucket.window_start = now;
            bucket.attempts_in_window = 0;
        }
        bucket.attempts_in_window += 1;
    }

    /// Records a failed code validation, advancing the consecutive-failure
    /// counter and locking out the key once the threshold is crossed.
    pub fn record_failure(&self, key: &str) {
        let mut record = self.lockouts.entry(key.to_string()).or_insert_with(|| LockoutRecord {
            failed_attempts: 0,
            locked_until: None,
        });
        record.failed_attempts += 1;
        if record.failed_attempts >= self.lockout_threshold {
            record.locked_until = Some(Utc::now() + chrono::Duration::seconds(self.lockout_secs));
        }
    }

    /// Clears the lockout record entirely on a successful validation.
    pub fn record_success(&self, key: &str) {
        self.lockouts.remove(key);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        match self.lockouts.get(key) {
            Some(record) => match record.locked_until {
                Some(until) => Utc::now() < until,
                None => false,
            },
            None => false,
        }
    }
}

// ── C3: Room Manager ────────────────────────────────────────────────────────

/// One end of a transfer session within a room.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
struct ConnectionLock {
    room_id: String,
    peer_id: String,
    role: Role,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Room {
    peers: std::collections::HashMap<String, Peer>,
}

/// Per-room pairing state: up to two peers and their roles, plus a
/// process-wide reconnection-lock table (locks refer to peers by
/// room_id + peer_id, never by handle — see §9 "Cyclic references").
/// `room_id` is identical to the code used to join the room.
#[derive(Clone)]
pub struct RoomManager {
    rooms: Arc<DashMap<String, Room>>,
    locks: Arc<DashMap<String, ConnectionLock>>,
    lock_ttl_secs: i64,
}

/// Outcome of attempting to add a peer to a room.
pub enum JoinOutcome {
    Joined { peers_in_room: Vec<Peer> },
    RoomFull,
}

impl RoomManager {
    pub fn new(lock_ttl_secs: i64) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            lock_ttl_secs,
        }
    }

    /// Adds `peer_id` with `role` to `room_id`. Fails with `RoomFull` if the
    /// room already has two peers.
    pub fn join(&self, room_id: &str, peer_id: &str, role: Role) -> JoinOutcome {
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        if room.peers.len() >= MAX_ROOM_POPULATION && !room.peers.contains_key(peer_id) {
            return JoinOutcome::RoomFull;
        }
        room.peers.insert(
            peer_id.to_string(),
            Peer {
                peer_id: peer_id.to_string(),
                role,
            },
        );
        JoinOutcome::Joined {
            peers_in_room: room.peers.values().cloned().collect(),
        }
    }

    /// Removes a peer from its room. Returns the remaining peers, and
    /// whether the room is now empty (caller should expire the Code).
    pub fn leave(&self, room_id: &str, peer_id: &str) -> (Vec<Peer>, bool) {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return (Vec::new(), true);
        };
        room.peers.remove(peer_id);
        let remaining: Vec<Peer> = room.peers.values().cloned().collect();
        let empty = room.peers.is_empty();
        drop(room);
        if empty {
            self.rooms.remove(room_id);
        }
        (remaining, empty)
    }

    pub fn peers_in_room(&self, room_id: &str) -> Vec<Peer> {
        self.rooms
            .get(room_id)
            .map(|r| r.peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peer(&self, room_id: &str, peer_id: &str) -> Option<Peer> {
        self.rooms.get(room_id)?.peers.get(peer_id).cloned()
    }

    /// Mints a fresh reconnection lock bound to `peer_id`'s current role.
    pub fn lock_connection(&self, room_id: &str, peer_id: &str) -> Option<(String, i64)> {
        let room = self.rooms.get(room_id)?;
        let role = room.peers.get(peer_id)?.role;
        drop(room);
        let lock_id = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + chrono::Duration::seconds(self.lock_ttl_secs);
        self.locks.insert(
            lock_id.clone(),
            ConnectionLock {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                role,
                expires_at,
            },
        );
        Some((lock_id, expires_at.timestamp()))
    }

    /// Redeems a lock, transplanting its bound role onto `new_peer_id` in
    /// the lock's room. Consumes the lock unconditionally once found, even
    /// if expired — a lock is single-use regardless of outcome.
    pub fn reconnect_with_lock(
        &self,
        lock_id: &str,
        new_peer_id: &str,
    ) -> Result<(String, Role), crate::error::Error> {
        let (_, lock) = self
            .locks
            .remove(lock_id)
            .ok_or(crate::error::Error::LockNotFound)?;

        if Utc::now() > lock.expires_at {
            return Err(crate::error::Error::LockExpired);
        }

        let mut room = self.rooms.entry(lock.room_id.clone()).or_default();
        room.peers.remove(&lock.peer_id);
        room.peers.insert(
            new_peer_id.to_string(),
            Peer {
                peer_id: new_peer_id.to_string(),
                role: lock.role,
            },
        );
        Ok((lock.room_id, lock.role))
    }

    pub fn room_is_empty(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|r| r.peers.is_empty())
            .unwrap_or(true)
    }
}

// ── Broker-wide shared state ────────────────────────────────────────────────

pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Clone)]
pub struct RelayState {
    pub config: RelayConfig,
    pub codes: CodeRegistry,
    pub abuse: AbuseControl,
    pub rooms: RoomManager,
    /// peer_id → outbound sender channel, for direct delivery by connection id.
    pub connections: Arc<DashMap<String, ClientSender>>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let codes = CodeRegistry::new(config.code_ttl_secs);
        let abuse = AbuseControl::new(
            config.rate_window_secs,
            config.rate_limit,
            config.lockout_threshold,
            config.lockout_secs,
        );
        let rooms = RoomManager::new(config.lock_ttl_secs);
        Self {
            config,
            codes,
            abuse,
            rooms,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn register_connection(&self, peer_id: &str, sender: ClientSender) {
        self.connections.insert(peer_id.to_string(), sender);
    }

    pub fn unregister_connection(&self, peer_id: &str) {
        self.connections.remove(peer_id);
    }

    /// Sends a message directly to a connection id. Returns false if the
    /// connection is not (or no longer) registered.
    pub fn send_to_peer(&self, peer_id: &str, message: ServerMessage) -> bool {
        if let Some(sender) = self.connections.get(peer_id) {
            sender.send(message).is_ok()
        } else {
            false
        }
    }

    pub fn broadcast_to_room(&self, room_id: &str, except: Option<&str>, message: ServerMessage) {
        for peer in self.rooms.peers_in_room(room_id) {
            if Some(peer.peer_id.as_str()) == except {
                continue;
            }
            self.send_to_peer(&peer.peer_id, message.clone());
        }
    }

    /// Periodic sweep: evicts expired codes. Called by the cleanup task.
    pub fn cleanup_expired(&self) {
        self.codes.sweep_expired();
    }
}
