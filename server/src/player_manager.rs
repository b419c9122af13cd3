//! Player connection management for the multiplayer server
//!
//! This module owns the server-side roster of named players, including:
//! - Player lifecycle (attach on CONNECT, detach on connection loss,
//!   reattach on RECONNECT, removal when the detach window expires)
//! - The connection-to-name mapping used to authorize inbound frames
//! - The outbound sender handle used to route frames to a player's socket
//! - Ping bookkeeping for the liveness monitor
//!
//! A player record survives a dropped socket: it moves to the detached state
//! and keeps its room seat, so the player can reattach with a fresh socket
//! until the cleanup window runs out.

use log::info;
use shared::Frame;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Handle for routing frames to one live connection.
///
/// The session's writer task is the only task that touches the socket; every
/// other task sends through this channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Server-wide connection number assigned by the acceptor.
    pub conn_id: u64,
    /// Outbound frame queue drained by the connection's writer task.
    pub sender: UnboundedSender<Frame>,
}

/// Result of an attach attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A fresh record was created for the name.
    Created,
    /// The name is held by an attached or detached player.
    NameTaken,
}

/// One named player.
///
/// Invariant: `connection` is `Some` exactly while the player is attached,
/// and `detached_since` is `Some` exactly while detached.
#[derive(Debug)]
struct PlayerRecord {
    connection: Option<ConnectionHandle>,
    room: Option<String>,
    last_ping: Instant,
    detached_since: Option<Instant>,
}

impl PlayerRecord {
    fn is_attached(&self) -> bool {
        self.connection.is_some()
    }
}

/// Roster of all known players, attached or detached.
///
/// The manager is wrapped in one `RwLock` by the server; every operation here
/// is a bounded critical section with no I/O or await points.
pub struct PlayerManager {
    players: HashMap<String, PlayerRecord>,
    conn_to_name: HashMap<u64, String>,
}

impl PlayerManager {
    pub fn new() -> Self {
        PlayerManager {
            players: HashMap::new(),
            conn_to_name: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Claims `name` for a new connection. Fails if the name exists in any
    /// state; a detached holder must come back through [`reattach`].
    ///
    /// [`reattach`]: PlayerManager::reattach
    pub fn attach(&mut self, name: &str, handle: ConnectionHandle) -> AttachOutcome {
        if self.players.contains_key(name) {
            return AttachOutcome::NameTaken;
        }

        self.conn_to_name.insert(handle.conn_id, name.to_string());
        self.players.insert(
            name.to_string(),
            PlayerRecord {
                connection: Some(handle),
                room: None,
                last_ping: Instant::now(),
                detached_since: None,
            },
        );
        info!("Player {} connected", name);
        AttachOutcome::Created
    }

    /// Reattaches a detached player to a new connection. Fails if the name
    /// is unknown or currently attached.
    pub fn reattach(&mut self, name: &str, handle: ConnectionHandle) -> bool {
        let Some(record) = self.players.get_mut(name) else {
            return false;
        };
        if record.is_attached() {
            return false;
        }

        self.conn_to_name.insert(handle.conn_id, name.to_string());
        record.connection = Some(handle);
        record.detached_since = None;
        record.last_ping = Instant::now();
        info!("Player {} reconnected", name);
        true
    }

    /// Moves an attached player to the detached state, dropping the
    /// connection mapping. Idempotent on already-detached players.
    pub fn detach(&mut self, name: &str) {
        let Some(record) = self.players.get_mut(name) else {
            return;
        };
        if let Some(handle) = record.connection.take() {
            self.conn_to_name.remove(&handle.conn_id);
            record.detached_since = Some(Instant::now());
            info!("Player {} detached", name);
        }
    }

    /// Erases a player record entirely, freeing the name.
    pub fn remove(&mut self, name: &str) {
        if let Some(record) = self.players.remove(name) {
            if let Some(handle) = record.connection {
                self.conn_to_name.remove(&handle.conn_id);
            }
            info!("Player {} removed", name);
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Resolves a connection to its player name, if the connection has one.
    pub fn name_by_conn(&self, conn_id: u64) -> Option<String> {
        self.conn_to_name.get(&conn_id).cloned()
    }

    /// Outbound sender for an attached player; `None` while detached.
    pub fn sender_of(&self, name: &str) -> Option<UnboundedSender<Frame>> {
        self.players
            .get(name)?
            .connection
            .as_ref()
            .map(|handle| handle.sender.clone())
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.players
            .get(name)
            .is_some_and(PlayerRecord::is_attached)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.players.contains_key(name)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    // ------------------------------------------------------------------
    // Room assignment
    // ------------------------------------------------------------------

    pub fn set_room(&mut self, name: &str, room_id: &str) {
        if let Some(record) = self.players.get_mut(name) {
            record.room = Some(room_id.to_string());
        }
    }

    pub fn clear_room(&mut self, name: &str) {
        if let Some(record) = self.players.get_mut(name) {
            record.room = None;
        }
    }

    /// The room the player is seated in; `None` means lobby.
    pub fn room_of(&self, name: &str) -> Option<String> {
        self.players.get(name)?.room.clone()
    }

    // ------------------------------------------------------------------
    // Liveness bookkeeping
    // ------------------------------------------------------------------

    /// Refreshes the player's last-ping timestamp. Unknown names are a
    /// no-op.
    pub fn update_ping(&mut self, name: &str) {
        if let Some(record) = self.players.get_mut(name) {
            record.last_ping = Instant::now();
        }
    }

    /// Attached players whose last ping is older than `timeout`.
    pub fn scan_timed_out(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.players
            .iter()
            .filter(|(_, record)| {
                record.is_attached() && now.duration_since(record.last_ping) > timeout
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Test-only: ages a player's last ping so timeout scans trigger.
    #[cfg(test)]
    pub(crate) fn backdate_ping(&mut self, name: &str, age: Duration) {
        if let Some(record) = self.players.get_mut(name) {
            record.last_ping = Instant::now() - age;
        }
    }

    /// Test-only: ages a player's detach timestamp so cleanup scans trigger.
    #[cfg(test)]
    pub(crate) fn backdate_detach(&mut self, name: &str, age: Duration) {
        if let Some(record) = self.players.get_mut(name) {
            if record.detached_since.is_some() {
                record.detached_since = Some(Instant::now() - age);
            }
        }
    }

    /// Detached players whose detach window has been open longer than
    /// `threshold`.
    pub fn scan_expired_detached(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        self.players
            .iter()
            .filter(|(_, record)| {
                record
                    .detached_since
                    .is_some_and(|since| now.duration_since(since) > threshold)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Default for PlayerManager {
    fn default() -> Self {
        Self::new()
    }
}
