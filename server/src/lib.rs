//! # Palace Game Server Library
//!
//! Authoritative TCP session server for the Palace shedding card game. The
//! server accepts line-framed protocol connections, binds them to named
//! player identities, matches players into two-seat rooms, and drives the
//! card game to completion while tolerating transient client disconnects.
//!
//! ## Architecture
//!
//! - One tokio task per accepted connection runs the session message loop
//!   ([`session`]); a paired writer task is the sole writer to each socket.
//! - Shared state lives in two registries behind `RwLock`s: the player
//!   roster ([`player_manager`]) and the room table ([`room_manager`]).
//!   Game state is only touched through `RoomManager::with_room`, which
//!   serializes all moves within a room.
//! - The pure game rules live in [`game`] and perform no I/O.
//! - A background liveness monitor ([`network`]) detaches silent players
//!   and cleans up those whose reconnection window has expired.
//!
//! ## Disconnection model
//!
//! Dropping a socket detaches the player instead of deleting it. Within the
//! cleanup window the same name can reattach via RECONNECT and resume a
//! running game; past the window the player is removed and any opponent is
//! awarded the win.

pub mod config;
pub mod game;
pub mod network;
pub mod player_manager;
pub mod room_manager;
pub mod session;
