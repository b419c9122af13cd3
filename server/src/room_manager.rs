//! Room management and matchmaking
//!
//! Rooms are two-seat tables identified by `ROOM_<n>` with monotonically
//! increasing `n` (never reused within a process). Each room exclusively
//! owns its [`Game`]. Cross-references run through stable string keys: rooms
//! hold player names, players hold a room id, and both sides resolve through
//! their managers under lock.
//!
//! All game mutation flows through [`RoomManager::with_room`]: the server
//! holds the room lock for the whole closure, which is what makes turns on
//! one room totally ordered.

use crate::game::{Game, GamePhase};
use log::info;
use std::collections::BTreeMap;

/// A seated pair of players and the game they share.
pub struct Room {
    pub id: String,
    pub players: Vec<String>,
    pub game: Game,
}

impl Room {
    fn new(id: String) -> Self {
        Room {
            id,
            players: Vec::new(),
            game: Game::new(),
        }
    }

    pub fn is_game_active(&self) -> bool {
        self.game.is_active()
    }

    /// Discards the current game and re-seats the remaining players,
    /// returning the room to the waiting state.
    pub fn reset_game(&mut self) {
        self.game = Game::new();
        for name in &self.players {
            self.game.add_player(name);
        }
    }
}

/// All rooms on the server.
///
/// Backed by a `BTreeMap` so matchmaking scans rooms in a stable order.
pub struct RoomManager {
    rooms: BTreeMap<String, Room>,
    next_room_id: u64,
    max_rooms: usize,
    room_capacity: usize,
}

impl RoomManager {
    pub fn new(max_rooms: usize, room_capacity: usize) -> Self {
        RoomManager {
            rooms: BTreeMap::new(),
            next_room_id: 1,
            max_rooms,
            room_capacity,
        }
    }

    /// Creates an empty room, or returns `None` at the room cap.
    pub fn create_room(&mut self) -> Option<String> {
        if self.rooms.len() >= self.max_rooms {
            return None;
        }
        let room_id = format!("ROOM_{}", self.next_room_id);
        self.next_room_id += 1;
        self.rooms.insert(room_id.clone(), Room::new(room_id.clone()));
        info!("Created room {}", room_id);
        Some(room_id)
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn is_room_full(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.players.len() >= self.room_capacity)
    }

    pub fn room_players(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.players.clone())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Seats `name` in `room_id`. Fails if the room does not exist, is
    /// full, or already seats the name.
    pub fn join_room(&mut self, name: &str, room_id: &str) -> bool {
        let capacity = self.room_capacity;
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.players.len() >= capacity || room.players.iter().any(|p| p == name) {
            return false;
        }

        room.players.push(name.to_string());
        room.game.add_player(name);
        info!("Player {} joined room {}", name, room_id);
        true
    }

    /// Seats `name` in the first room with exactly one free seat, creating
    /// a new room when none is open. Returns `None` only when the room cap
    /// prevents creating one.
    pub fn join_any_available_room(&mut self, name: &str) -> Option<String> {
        let open_room = self
            .rooms
            .values()
            .find(|room| {
                room.players.len() + 1 == self.room_capacity
                    && !room.players.iter().any(|p| p == name)
            })
            .map(|room| room.id.clone());

        if let Some(room_id) = open_room {
            if self.join_room(name, &room_id) {
                return Some(room_id);
            }
        }

        let room_id = self.create_room()?;
        if self.join_room(name, &room_id) {
            Some(room_id)
        } else {
            None
        }
    }

    /// Unseats `name` from `room_id`. An emptied room is deleted; a room
    /// whose active game loses a seat falls back to the waiting state.
    pub fn leave_room(&mut self, name: &str, room_id: &str) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(position) = room.players.iter().position(|p| p == name) else {
            return false;
        };

        room.players.remove(position);
        info!("Player {} left room {}", name, room_id);

        if room.players.is_empty() {
            self.delete_room(room_id);
        } else if room.game.phase() == GamePhase::Waiting {
            room.game.remove_player(name);
        } else {
            room.reset_game();
        }
        true
    }

    pub fn delete_room(&mut self, room_id: &str) -> bool {
        if self.rooms.remove(room_id).is_some() {
            info!("Deleted room {}", room_id);
            true
        } else {
            false
        }
    }

    /// Runs `operation` against the room while the caller holds the manager
    /// lock, passing `None` if the room is absent. This is the sole path
    /// for reading or mutating game state.
    pub fn with_room<R>(&mut self, room_id: &str, operation: impl FnOnce(Option<&mut Room>) -> R) -> R {
        operation(self.rooms.get_mut(room_id))
    }
}
