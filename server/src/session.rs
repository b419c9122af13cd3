//! Per-connection session handling: frame loop, routing, dispatch
//!
//! Each accepted TCP connection runs one `run_session` task. The task owns
//! the read half of the socket and a writer task owns the write half; every
//! outbound frame for this connection, from this session or from anywhere
//! else in the server, goes through one mpsc channel so the socket has a
//! single writer.
//!
//! An inbound frame produces an ordered list of outbound frames, each tagged
//! with a dispatch route:
//! - `Direct` frames answer the originating socket.
//! - `Targeted` frames go to a named player, silently dropped if detached.
//! - `Broadcast` frames reach the originator unmodified plus a
//!   `room_notification`-tagged copy for every other seat in the room.

use crate::network::ServerState;
use crate::game::PlayResult;
use crate::player_manager::{AttachOutcome, ConnectionHandle};
use crate::room_manager::Room;
use log::{debug, info, warn};
use shared::{
    format_card_list, is_valid_player_name, parse_card_list, Card, DecodeError, Frame,
    MessageType, BROADCAST_TYPE_KEY, EMPTY_PILE_CODE, MAX_INBOUND_BUFFER, RESERVE_TOKEN,
    ROOM_NOTIFICATION,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

/// Where an outbound frame is sent.
#[derive(Debug)]
enum Route {
    /// Reply to the originating socket only.
    Direct,
    /// Deliver to a named player if attached, drop otherwise.
    Targeted(String),
    /// Originator gets the frame as-is; every listed seat gets a copy
    /// tagged `broadcast_type=room_notification` plus the optional
    /// type-specific note.
    Broadcast {
        others: Vec<String>,
        note: Option<(&'static str, String)>,
    },
}

/// One outbound frame with its dispatch route.
#[derive(Debug)]
struct Outbound {
    frame: Frame,
    route: Route,
}

impl Outbound {
    fn direct(frame: Frame) -> Self {
        Outbound {
            frame,
            route: Route::Direct,
        }
    }

    fn targeted(name: impl Into<String>, frame: Frame) -> Self {
        Outbound {
            frame,
            route: Route::Targeted(name.into()),
        }
    }
}

fn error_frame(message: &str) -> Frame {
    Frame::new(MessageType::Error).with("error", message)
}

fn error_reply(message: &str) -> Vec<Outbound> {
    vec![Outbound::direct(error_frame(message))]
}

// ============================================================================
// Session task
// ============================================================================

/// Runs the message loop for one accepted connection until EOF, an I/O
/// error, a protocol violation, or server shutdown, then tears the session
/// down through the detach path.
pub async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    state: ServerState,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Session {} started for {}", conn_id, addr);

    let (mut read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(writer_loop(rx, write_half, conn_id));

    let invalid_limit = state.config.invalid_message_limit;
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut invalid_count: u32 = 0;

    'session: loop {
        tokio::select! {
            result = read_half.read(&mut chunk) => {
                match result {
                    Ok(0) => {
                        debug!("Session {} closed by peer", conn_id);
                        break 'session;
                    }
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);

                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes);
                            let line = line.trim_end_matches(['\n', '\r']);
                            if line.is_empty() {
                                continue;
                            }
                            if !process_line(&state, conn_id, &tx, line, &mut invalid_count)
                                .await
                            {
                                break 'session;
                            }
                            if invalid_count >= invalid_limit {
                                warn!(
                                    "Session {} exceeded invalid message limit, closing",
                                    conn_id
                                );
                                break 'session;
                            }
                        }

                        // Only incomplete data may sit in the buffer.
                        if buffer.len() > MAX_INBOUND_BUFFER {
                            warn!("Session {} overflowed the inbound buffer", conn_id);
                            break 'session;
                        }
                    }
                    Err(e) => {
                        warn!("Session {} read error: {}", conn_id, e);
                        break 'session;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Session {} closing for server shutdown", conn_id);
                break 'session;
            }
        }
    }

    teardown(&state, conn_id).await;

    // Dropping the session's sender (after the registry dropped its clone in
    // detach) lets the writer drain queued frames and exit.
    drop(tx);
    let _ = writer.await;
    debug!("Session {} finished", conn_id);
}

/// Drains the outbound channel onto the socket. Sole writer for this
/// connection.
async fn writer_loop(
    mut rx: UnboundedReceiver<Frame>,
    write_half: OwnedWriteHalf,
    conn_id: u64,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(frame) = rx.recv().await {
        debug!("Session {} sending {}", conn_id, frame.msg_type.name());
        if writer.write_all(frame.encode().as_bytes()).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

/// Handles one complete inbound line. Returns false when the connection
/// must close.
async fn process_line(
    state: &ServerState,
    conn_id: u64,
    tx: &UnboundedSender<Frame>,
    line: &str,
    invalid_count: &mut u32,
) -> bool {
    let frame = match Frame::decode(line) {
        Ok(frame) => frame,
        Err(DecodeError::BadFormat) => {
            // Framing errors get no reply.
            warn!("Session {} sent malformed frame: {:?}", conn_id, line);
            *invalid_count += 1;
            return true;
        }
        Err(DecodeError::UnknownType(code)) => {
            warn!("Session {} sent unknown message type {}", conn_id, code);
            *invalid_count += 1;
            return true;
        }
    };

    // Server-to-client codes are not valid requests.
    if frame.msg_type.code() >= 100 {
        warn!(
            "Session {} sent server-side message type {}",
            conn_id,
            frame.msg_type.name()
        );
        *invalid_count += 1;
        return true;
    }

    // Per-type required data fields.
    if let Some(key) = frame.msg_type.required_data_key() {
        if frame.get(key).map_or(true, str::is_empty) {
            *invalid_count += 1;
            let mut reply = error_frame(&format!("Missing required field: {}", key));
            let closing = *invalid_count >= state.config.invalid_message_limit;
            if closing {
                reply.set("disconnect", "true");
            }
            let _ = tx.send(reply);
            return !closing;
        }
    }

    *invalid_count = 0;
    debug!(
        "Session {} received {} frame",
        conn_id,
        frame.msg_type.name()
    );

    let replies = handle_frame(state, conn_id, tx, &frame).await;
    let mut keep_open = true;
    for outbound in replies {
        if outbound.frame.get("disconnect") == Some("true") {
            keep_open = false;
        }
        dispatch(state, tx, outbound).await;
    }
    keep_open
}

/// Detaches the session's player (keeping the record for the reconnection
/// window) and tells the rest of the room.
async fn teardown(state: &ServerState, conn_id: u64) {
    let (name, room_id) = {
        let mut players = state.players.write().await;
        match players.name_by_conn(conn_id) {
            Some(name) => {
                let room_id = players.room_of(&name);
                players.detach(&name);
                (Some(name), room_id)
            }
            None => (None, None),
        }
    };

    let Some(name) = name else {
        return;
    };
    info!("Player {} disconnected, reconnection window open", name);

    let Some(room_id) = room_id else {
        return;
    };
    let others: Vec<String> = state
        .rooms
        .read()
        .await
        .room_players(&room_id)
        .into_iter()
        .filter(|p| p != &name)
        .collect();

    for other in others {
        let mut frame = Frame::new(MessageType::PlayerDisconnected);
        frame.player = other.clone();
        frame.room = room_id.clone();
        frame.set("disconnected_player", name.clone());
        frame.set("status", "temporarily_disconnected");
        send_targeted(state, &other, frame).await;
    }
}

// ============================================================================
// Dispatch
// ============================================================================

async fn dispatch(state: &ServerState, direct_tx: &UnboundedSender<Frame>, outbound: Outbound) {
    match outbound.route {
        Route::Direct => {
            let _ = direct_tx.send(outbound.frame);
        }
        Route::Targeted(name) => {
            send_targeted(state, &name, outbound.frame).await;
        }
        Route::Broadcast { others, note } => {
            let _ = direct_tx.send(outbound.frame.clone());
            for other in others {
                let mut copy = outbound.frame.clone();
                copy.set(BROADCAST_TYPE_KEY, ROOM_NOTIFICATION);
                if let Some((key, value)) = &note {
                    copy.set(key, value.clone());
                }
                send_targeted(state, &other, copy).await;
            }
        }
    }
}

/// Routes a frame to a named player's socket. Detached players drop the
/// frame silently; a full or closed channel means the writer task is gone
/// and the reader will notice on its own.
pub(crate) async fn send_targeted(state: &ServerState, name: &str, frame: Frame) {
    match state.players.read().await.sender_of(name) {
        Some(sender) => {
            let _ = sender.send(frame);
        }
        None => {
            debug!(
                "Dropping {} frame for detached player {}",
                frame.msg_type.name(),
                name
            );
        }
    }
}

// ============================================================================
// Routing table
// ============================================================================

async fn handle_frame(
    state: &ServerState,
    conn_id: u64,
    tx: &UnboundedSender<Frame>,
    frame: &Frame,
) -> Vec<Outbound> {
    match frame.msg_type {
        MessageType::Connect => handle_connect(state, conn_id, tx, frame).await,
        MessageType::Reconnect => handle_reconnect(state, conn_id, tx, frame).await,
        _ => {
            // Everything else requires an attached player on this socket.
            let Some(name) = state.players.read().await.name_by_conn(conn_id) else {
                return error_reply("Must connect first");
            };
            match frame.msg_type {
                MessageType::Ping => handle_ping(state, &name).await,
                MessageType::JoinRoom => handle_join_room(state, &name).await,
                MessageType::LeaveRoom => handle_leave_room(state, &name).await,
                MessageType::StartGame => handle_start_game(state, &name).await,
                MessageType::PlayCards => handle_play_cards(state, &name, frame).await,
                MessageType::PickupPile => handle_pickup_pile(state, &name).await,
                // Outbound codes were filtered in process_line.
                _ => error_reply("Unknown message type"),
            }
        }
    }
}

async fn handle_connect(
    state: &ServerState,
    conn_id: u64,
    tx: &UnboundedSender<Frame>,
    frame: &Frame,
) -> Vec<Outbound> {
    let name = frame.get("name").unwrap_or_default();
    if !is_valid_player_name(name) {
        return error_reply("Invalid name");
    }

    let mut players = state.players.write().await;
    if players.name_by_conn(conn_id).is_some() {
        return error_reply("Already connected");
    }

    let handle = ConnectionHandle {
        conn_id,
        sender: tx.clone(),
    };
    match players.attach(name, handle) {
        AttachOutcome::Created => {
            let mut reply = Frame::new(MessageType::Connected);
            reply.player = name.to_string();
            reply.set("name", name);
            reply.set("status", "success");
            vec![Outbound::direct(reply)]
        }
        AttachOutcome::NameTaken => error_reply("Connection failed - name already taken"),
    }
}

async fn handle_reconnect(
    state: &ServerState,
    conn_id: u64,
    tx: &UnboundedSender<Frame>,
    frame: &Frame,
) -> Vec<Outbound> {
    let name = frame.get("name").unwrap_or_default();
    if !is_valid_player_name(name) {
        return error_reply("Invalid name");
    }

    let room_id = {
        let mut players = state.players.write().await;
        if players.name_by_conn(conn_id).is_some() {
            return error_reply("Already connected");
        }
        let handle = ConnectionHandle {
            conn_id,
            sender: tx.clone(),
        };
        if !players.reattach(name, handle) {
            return error_reply("Reconnection failed - player not found or session expired");
        }
        players.room_of(name)
    };

    let mut connected = Frame::new(MessageType::Connected);
    connected.player = name.to_string();
    connected.set("name", name);
    connected.set("status", "success");
    let mut replies = vec![Outbound::direct(connected)];

    // A seated player gets a fresh view of the game and the room learns
    // they are back.
    if let Some(room_id) = room_id {
        let (state_frame, others) = {
            let mut rooms = state.rooms.write().await;
            rooms.with_room(&room_id, |room| match room {
                Some(room) => {
                    let state_frame = room
                        .game
                        .is_active()
                        .then(|| game_state_frame(room, name));
                    let others: Vec<String> = room
                        .players
                        .iter()
                        .filter(|p| *p != name)
                        .cloned()
                        .collect();
                    (state_frame, others)
                }
                None => (None, Vec::new()),
            })
        };

        if let Some(state_frame) = state_frame {
            replies.push(Outbound::targeted(name, state_frame));
        }
        for other in others {
            let mut frame = Frame::new(MessageType::PlayerReconnected);
            frame.player = other.clone();
            frame.room = room_id.clone();
            frame.set("reconnected_player", name);
            frame.set("status", "reconnected");
            replies.push(Outbound::targeted(other, frame));
        }
    }
    replies
}

async fn handle_ping(state: &ServerState, name: &str) -> Vec<Outbound> {
    state.players.write().await.update_ping(name);
    vec![Outbound::direct(Frame::new(MessageType::Pong))]
}

async fn handle_join_room(state: &ServerState, name: &str) -> Vec<Outbound> {
    if state.players.read().await.room_of(name).is_some() {
        return error_reply("Already in a room");
    }

    let (room_id, room_players, room_full) = {
        let mut rooms = state.rooms.write().await;
        match rooms.join_any_available_room(name) {
            Some(room_id) => {
                let players = rooms.room_players(&room_id);
                let full = rooms.is_room_full(&room_id);
                (room_id, players, full)
            }
            None => {
                // Matchmaking only fails outright when no seat is open and
                // the room cap blocks creating another room.
                if rooms.room_count() >= state.config.max_rooms {
                    return error_reply("Server full");
                }
                return error_reply("Error occurred while joining room");
            }
        }
    };

    state.players.write().await.set_room(name, &room_id);

    let others: Vec<String> = room_players
        .iter()
        .filter(|p| *p != name)
        .cloned()
        .collect();

    let mut reply = Frame::new(MessageType::RoomJoined);
    reply.player = name.to_string();
    reply.room = room_id;
    reply.set("player_count", room_players.len().to_string());
    reply.set("players", room_players.join(","));
    reply.set("room_full", if room_full { "true" } else { "false" });
    reply.set("status", "success");

    vec![Outbound {
        frame: reply,
        route: Route::Broadcast {
            others,
            note: Some(("joined_player", name.to_string())),
        },
    }]
}

async fn handle_leave_room(state: &ServerState, name: &str) -> Vec<Outbound> {
    let Some(room_id) = state.players.read().await.room_of(name) else {
        return error_reply("Not in any room");
    };

    let remaining = {
        let mut rooms = state.rooms.write().await;
        if !rooms.leave_room(name, &room_id) {
            return error_reply("Leave room failed");
        }
        rooms.room_players(&room_id)
    };

    state.players.write().await.clear_room(name);

    let mut reply = Frame::new(MessageType::RoomLeft);
    reply.player = name.to_string();
    reply.set("status", "left");

    vec![Outbound {
        frame: reply,
        route: Route::Broadcast {
            others: remaining,
            note: Some(("left_player", name.to_string())),
        },
    }]
}

async fn handle_start_game(state: &ServerState, name: &str) -> Vec<Outbound> {
    let Some(room_id) = state.players.read().await.room_of(name) else {
        return error_reply("Not in any room");
    };

    let started = {
        let mut rooms = state.rooms.write().await;
        rooms.with_room(&room_id, |room| match room {
            Some(room) => {
                if room.players.len() < 2 || !room.game.start_game() {
                    None
                } else {
                    let others: Vec<String> = room
                        .players
                        .iter()
                        .filter(|p| *p != name)
                        .cloned()
                        .collect();
                    Some((others, game_state_frames(room)))
                }
            }
            None => None,
        })
    };

    let Some((others, state_frames)) = started else {
        return error_reply("Cannot start game");
    };

    let mut announce = Frame::new(MessageType::GameStarted);
    announce.room = room_id;
    announce.set("status", "started");

    let mut replies = vec![Outbound {
        frame: announce,
        route: Route::Broadcast { others, note: None },
    }];
    replies.extend(state_frames);
    replies
}

async fn handle_play_cards(state: &ServerState, name: &str, frame: &Frame) -> Vec<Outbound> {
    let cards_value = frame.get("cards").unwrap_or_default();

    enum Request {
        Cards(Vec<Card>),
        Reserve,
    }
    let request = if cards_value == RESERVE_TOKEN {
        Request::Reserve
    } else {
        match parse_card_list(cards_value) {
            Ok(cards) => Request::Cards(cards),
            Err(_) => return error_reply("Invalid card play"),
        }
    };

    let Some(room_id) = state.players.read().await.room_of(name) else {
        return error_reply("Not in any room");
    };

    let (replies, finished_seats) = {
        let mut rooms = state.rooms.write().await;
        let outcome = rooms.with_room(&room_id, |room| {
            let Some(room) = room else {
                return None;
            };
            let result = match &request {
                Request::Cards(cards) => room.game.play_cards(name, cards),
                Request::Reserve => room.game.play_reserve(name),
            };
            match result {
                PlayResult::InvalidPlayer | PlayResult::InvalidCard => Some((Vec::new(), None)),
                PlayResult::Success | PlayResult::PickupRequired => {
                    let mut replies = vec![Outbound::direct(turn_result(name, "play_success"))];
                    replies.extend(game_state_frames(room));
                    Some((replies, None))
                }
                PlayResult::GameOver => {
                    let seats = room.players.clone();
                    let mut replies = vec![Outbound::direct(turn_result(name, "play_success"))];
                    for seat in &seats {
                        let mut over = Frame::new(MessageType::GameOver);
                        over.player = seat.clone();
                        over.room = room_id.clone();
                        over.set("winner", name);
                        over.set("status", "game_over");
                        replies.push(Outbound::targeted(seat.clone(), over));
                    }
                    for seat in &seats {
                        let mut left = Frame::new(MessageType::RoomLeft);
                        left.player = seat.clone();
                        left.set("status", "left");
                        replies.push(Outbound::targeted(seat.clone(), left));
                    }
                    Some((replies, Some(seats)))
                }
            }
        });

        let Some((replies, finished_seats)) = outcome else {
            return error_reply("Internal server error");
        };
        if replies.is_empty() {
            return error_reply("Invalid card play");
        }
        // The finished room is torn down under the same lock that ran the
        // winning move.
        if finished_seats.is_some() {
            rooms.delete_room(&room_id);
        }
        (replies, finished_seats)
    };

    if let Some(seats) = finished_seats {
        let mut players = state.players.write().await;
        for seat in &seats {
            players.clear_room(seat);
        }
    }
    replies
}

async fn handle_pickup_pile(state: &ServerState, name: &str) -> Vec<Outbound> {
    let Some(room_id) = state.players.read().await.room_of(name) else {
        return error_reply("Not in any room");
    };

    let mut rooms = state.rooms.write().await;
    let outcome = rooms.with_room(&room_id, |room| {
        let Some(room) = room else {
            return None;
        };
        match room.game.pickup_pile(name) {
            PlayResult::Success => {
                let mut replies = vec![Outbound::direct(turn_result(name, "pickup_success"))];
                replies.extend(game_state_frames(room));
                Some(replies)
            }
            _ => Some(Vec::new()),
        }
    });

    match outcome {
        Some(replies) if !replies.is_empty() => replies,
        Some(_) => error_reply("Cannot pickup pile"),
        None => error_reply("Internal server error"),
    }
}

fn turn_result(player: &str, result: &str) -> Frame {
    let mut frame = Frame::new(MessageType::TurnResult)
        .with("result", result)
        .with("status", "success");
    frame.player = player.to_string();
    frame
}

// ============================================================================
// Game state views
// ============================================================================

/// Per-seat GAME_STATE frames for every player in the room.
fn game_state_frames(room: &Room) -> Vec<Outbound> {
    room.players
        .iter()
        .map(|seat| Outbound::targeted(seat.clone(), game_state_frame(room, seat)))
        .collect()
}

/// The GAME_STATE frame as seen by `seat`: own cards in full, opponent as
/// counts only.
fn game_state_frame(room: &Room, seat: &str) -> Frame {
    let game = &room.game;
    let hand = game.hand_of(seat).unwrap_or(&[]);
    let opponent = room.players.iter().find(|p| *p != seat);

    let mut frame = Frame::new(MessageType::GameState);
    frame.player = seat.to_string();
    frame.room = room.id.clone();
    frame.set("hand", format_card_list(hand));
    frame.set("reserves", game.reserve_count_of(seat).to_string());
    match opponent {
        Some(opponent) => {
            frame.set("opponent_name", opponent.clone());
            frame.set(
                "opponent_hand",
                game.hand_of(opponent).map_or(0, <[Card]>::len).to_string(),
            );
            frame.set(
                "opponent_reserves",
                game.reserve_count_of(opponent).to_string(),
            );
        }
        None => {
            frame.set("opponent_name", "");
            frame.set("opponent_hand", "0");
            frame.set("opponent_reserves", "0");
        }
    }
    frame.set("current_player", game.current_player().unwrap_or_default());
    frame.set(
        "top_card",
        game.top_discard()
            .map(|card| card.to_string())
            .unwrap_or_else(|| EMPTY_PILE_CODE.to_string()),
    );
    frame.set("deck_size", game.deck_size().to_string());
    frame.set("discard_pile_size", game.discard_size().to_string());
    frame.set(
        "must_play_low",
        if game.must_play_low() { "true" } else { "false" },
    );
    frame.set(
        "your_turn",
        if game.is_player_turn(seat) {
            "true"
        } else {
            "false"
        },
    );
    frame
}
