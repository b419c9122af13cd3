//! Integration tests for the Palace session server
//!
//! These tests boot the real server on an ephemeral port and drive it over
//! actual TCP connections, speaking the wire protocol exactly as a client
//! would.

use server::config::ServerConfig;
use server::network::Server;
use shared::{Frame, MessageType};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Boots a server on 127.0.0.1 with an ephemeral port and leaves it
/// running for the duration of the test.
async fn spawn_server(mut config: ServerConfig) -> SocketAddr {
    config.ip = "127.0.0.1".to_string();
    config.port = 0;
    let server = Server::bind(config).await.expect("failed to bind server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run(std::future::pending::<()>()));
    addr
}

/// Minimal protocol client for the tests.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> TestClient {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        let (read_half, write_half) = stream.into_split();
        TestClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send_line(&mut self, line: &str) {
        let mut data = line.to_string();
        data.push('\n');
        self.send_raw(data.as_bytes()).await;
    }

    async fn send_raw(&mut self, data: &[u8]) {
        // The server may already have closed the socket in teardown tests.
        let _ = self.writer.write_all(data).await;
    }

    async fn recv(&mut self) -> Frame {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed");
        assert!(n > 0, "connection closed while waiting for a frame");
        Frame::decode(&line).expect("server sent an undecodable frame")
    }

    /// Receives frames until one of the wanted type arrives.
    async fn recv_until(&mut self, msg_type: MessageType) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.msg_type == msg_type {
                return frame;
            }
        }
    }

    /// CONNECTs under `name` and asserts success.
    async fn login(&mut self, name: &str) {
        self.send_line(&format!("0|||name={}", name)).await;
        let frame = self.recv().await;
        assert_eq!(frame.msg_type, MessageType::Connected);
        assert_eq!(frame.get("status"), Some("success"));
    }

    /// Asserts the server eventually closes this connection, tolerating
    /// any frames sent before the close.
    async fn expect_closed(mut self) {
        loop {
            let mut line = String::new();
            let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for the server to close")
                .expect("read failed");
            if n == 0 {
                return;
            }
        }
    }
}

/// Connects Alice and Bob, seats them in ROOM_1, starts the game, and
/// returns both clients with their initial GAME_STATE frames.
async fn start_two_player_game(addr: SocketAddr) -> (TestClient, TestClient, Frame, Frame) {
    let mut alice = TestClient::connect(addr).await;
    alice.login("Alice").await;
    alice.send_line("2|||").await;
    let joined = alice.recv().await;
    assert_eq!(joined.msg_type, MessageType::RoomJoined);

    let mut bob = TestClient::connect(addr).await;
    bob.login("Bob").await;
    bob.send_line("2|||").await;
    let joined = bob.recv().await;
    assert_eq!(joined.msg_type, MessageType::RoomJoined);
    assert_eq!(joined.get("room_full"), Some("true"));

    // Alice sees Bob arrive.
    let notice = alice.recv().await;
    assert_eq!(notice.msg_type, MessageType::RoomJoined);
    assert_eq!(notice.get("joined_player"), Some("Bob"));

    alice.send_line("5|||").await;
    let started = alice.recv().await;
    assert_eq!(started.msg_type, MessageType::GameStarted);
    assert_eq!(started.get("status"), Some("started"));

    let alice_state = alice.recv_until(MessageType::GameState).await;
    let bob_state = bob.recv_until(MessageType::GameState).await;
    (alice, bob, alice_state, bob_state)
}

/// CONNECTION AND LOBBY TESTS
mod lobby_tests {
    use super::*;

    /// Scenario: connect and join a room solo, asserting exact wire bytes.
    #[tokio::test]
    async fn connect_and_join_solo() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut alice = TestClient::connect(addr).await;

        alice.send_line("0|||name=Alice").await;
        let connected = alice.recv().await;
        assert_eq!(connected.encode(), "100|Alice||name=Alice|status=success\n");

        alice.send_line("2|||").await;
        let joined = alice.recv().await;
        assert_eq!(
            joined.encode(),
            "101|Alice|ROOM_1|player_count=1|players=Alice|room_full=false|status=success\n"
        );
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_but_connection_survives() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        client.send_line("0|||name=bad name!").await;
        let reply = client.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Invalid name"));

        // Still connected; a valid name now works.
        client.login("goodname").await;
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;

        let mut imposter = TestClient::connect(addr).await;
        imposter.send_line("0|||name=Alice").await;
        let reply = imposter.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(
            reply.get("error"),
            Some("Connection failed - name already taken")
        );
    }

    #[tokio::test]
    async fn ping_pong() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;

        alice.send_line("4|||").await;
        let pong = alice.recv().await;
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn requests_before_connect_are_refused() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        for request in ["4|||", "2|||", "5|||"] {
            client.send_line(request).await;
            let reply = client.recv().await;
            assert_eq!(reply.msg_type, MessageType::Error);
            assert_eq!(reply.get("error"), Some("Must connect first"));
        }
    }
}

/// ROOM AND MATCHMAKING TESTS
mod room_tests {
    use super::*;

    /// Scenario: a second player fills the room and the game starts with
    /// exactly one seat holding the turn.
    #[tokio::test]
    async fn two_players_and_start() {
        let addr = spawn_server(ServerConfig::default()).await;
        let (_alice, _bob, alice_state, bob_state) = start_two_player_game(addr).await;

        assert_eq!(alice_state.room, "ROOM_1");
        assert_eq!(bob_state.room, "ROOM_1");

        let turns = [&alice_state, &bob_state]
            .iter()
            .filter(|state| state.get("your_turn") == Some("true"))
            .count();
        assert_eq!(turns, 1);

        // The seat holding the turn matches current_player on both views.
        let current = alice_state.get("current_player").unwrap();
        assert_eq!(bob_state.get("current_player"), Some(current));
    }

    #[tokio::test]
    async fn leaving_frees_the_seat() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;
        alice.send_line("2|||").await;
        alice.recv().await;

        let mut bob = TestClient::connect(addr).await;
        bob.login("Bob").await;
        bob.send_line("2|||").await;
        bob.recv().await;
        alice.recv().await; // Bob's join notice

        alice.send_line("3|||").await;
        let left = alice.recv().await;
        assert_eq!(left.msg_type, MessageType::RoomLeft);
        assert_eq!(left.get("status"), Some("left"));

        let notice = bob.recv().await;
        assert_eq!(notice.msg_type, MessageType::RoomLeft);
        assert_eq!(notice.get("left_player"), Some("Alice"));

        // Carol takes the freed seat next to Bob.
        let mut carol = TestClient::connect(addr).await;
        carol.login("Carol").await;
        carol.send_line("2|||").await;
        let joined = carol.recv().await;
        assert_eq!(joined.room, "ROOM_1");
        assert_eq!(joined.get("players"), Some("Bob,Carol"));
        assert_eq!(joined.get("room_full"), Some("true"));
    }

    #[tokio::test]
    async fn double_join_is_rejected() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;
        alice.send_line("2|||").await;
        alice.recv().await;

        alice.send_line("2|||").await;
        let reply = alice.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Already in a room"));
    }

    #[tokio::test]
    async fn start_needs_two_seats() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;
        alice.send_line("2|||").await;
        alice.recv().await;

        alice.send_line("5|||").await;
        let reply = alice.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Cannot start game"));
    }

    #[tokio::test]
    async fn room_cap_refuses_new_rooms() {
        let config = ServerConfig {
            max_rooms: 1,
            ..ServerConfig::default()
        };
        let addr = spawn_server(config).await;

        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;
        alice.send_line("2|||").await;
        alice.recv().await;
        let mut bob = TestClient::connect(addr).await;
        bob.login("Bob").await;
        bob.send_line("2|||").await;
        bob.recv().await;

        // The only room is full and no further room may be created.
        let mut carol = TestClient::connect(addr).await;
        carol.login("Carol").await;
        carol.send_line("2|||").await;
        let reply = carol.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Server full"));
    }
}

/// GAMEPLAY TESTS
mod game_tests {
    use super::*;

    /// Scenario: the opening player plays one card and both seats see the
    /// updated state.
    #[tokio::test]
    async fn play_a_card() {
        let addr = spawn_server(ServerConfig::default()).await;
        let (mut alice, mut bob, alice_state, bob_state) = start_two_player_game(addr).await;

        let (actor, waiter, actor_state) = if alice_state.get("your_turn") == Some("true") {
            (&mut alice, &mut bob, &alice_state)
        } else {
            (&mut bob, &mut alice, &bob_state)
        };
        let actor_name = actor_state.player.clone();
        let waiter_name = if actor_name == "Alice" { "Bob" } else { "Alice" };

        // The pile is empty at game start, so any hand card is playable.
        let card = actor_state
            .get("hand")
            .unwrap()
            .split(',')
            .next()
            .unwrap()
            .to_string();
        actor.send_line(&format!("7|||cards={}", card)).await;

        let result = actor.recv().await;
        assert_eq!(
            result.encode(),
            format!("111|{}||result=play_success|status=success\n", actor_name)
        );

        let actor_view = actor.recv_until(MessageType::GameState).await;
        assert_eq!(actor_view.get("your_turn"), Some("false"));
        assert_eq!(actor_view.get("current_player"), Some(waiter_name));
        // Hand refilled to three from the draw pile.
        assert_eq!(actor_view.get("hand").unwrap().split(',').count(), 3);

        let waiter_view = waiter.recv_until(MessageType::GameState).await;
        assert_eq!(waiter_view.get("your_turn"), Some("true"));
        assert_eq!(waiter_view.get("opponent_hand"), Some("3"));

        // A ten burns itself; anything else sits on top of the pile.
        if card.starts_with("10") {
            assert_eq!(waiter_view.get("top_card"), Some("1S"));
            assert_eq!(waiter_view.get("discard_pile_size"), Some("0"));
        } else {
            assert_eq!(waiter_view.get("top_card"), Some(card.as_str()));
            assert_eq!(waiter_view.get("discard_pile_size"), Some("1"));
        }
    }

    #[tokio::test]
    async fn play_out_of_turn_is_rejected() {
        let addr = spawn_server(ServerConfig::default()).await;
        let (mut alice, mut bob, alice_state, bob_state) = start_two_player_game(addr).await;

        let (waiter, waiter_state) = if alice_state.get("your_turn") == Some("true") {
            (&mut bob, &bob_state)
        } else {
            (&mut alice, &alice_state)
        };
        let card = waiter_state.get("hand").unwrap().split(',').next().unwrap();

        waiter.send_line(&format!("7|||cards={}", card)).await;
        let reply = waiter.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Invalid card play"));
    }

    #[tokio::test]
    async fn pickup_of_empty_pile_is_rejected() {
        let addr = spawn_server(ServerConfig::default()).await;
        let (mut alice, mut bob, alice_state, _) = start_two_player_game(addr).await;

        let actor = if alice_state.get("your_turn") == Some("true") {
            &mut alice
        } else {
            &mut bob
        };
        actor.send_line("8|||").await;
        let reply = actor.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Cannot pickup pile"));
    }
}

/// PROTOCOL ROBUSTNESS TESTS
mod protocol_tests {
    use super::*;

    #[tokio::test]
    async fn malformed_frames_close_the_connection() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        // Three consecutive framing errors exhaust the invalid limit; none
        // of them gets a reply.
        for _ in 0..3 {
            client.send_line("this is not a frame").await;
        }
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn unknown_message_types_close_the_connection() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        // Type 1 is not in the protocol.
        for _ in 0..3 {
            client.send_line("1|||").await;
        }
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn missing_required_field_gets_error_but_stays_open() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        client.send_line("0|||").await;
        let reply = client.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Missing required field: name"));
        assert_eq!(reply.get("disconnect"), None);

        // A valid frame resets the invalid counter and works normally.
        client.login("Alice").await;
    }

    #[tokio::test]
    async fn repeated_validation_failures_disconnect() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        client.send_line("0|||").await;
        client.send_line("0|||").await;
        client.send_line("0|||").await;

        let first = client.recv().await;
        assert_eq!(first.get("disconnect"), None);
        let second = client.recv().await;
        assert_eq!(second.get("disconnect"), None);
        let third = client.recv().await;
        assert_eq!(third.get("disconnect"), Some("true"));
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn oversized_buffer_closes_the_connection() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        // 9 KiB with no newline ever arriving overflows the 8 KiB inbound
        // buffer.
        let blob = vec![b'a'; 9 * 1024];
        client.send_raw(&blob).await;
        client.expect_closed().await;
    }
}

/// RECONNECTION AND LIVENESS TESTS
mod reconnection_tests {
    use super::*;

    /// Scenario: a mid-game drop followed by RECONNECT within the window
    /// restores the session.
    #[tokio::test]
    async fn disconnect_and_reconnect_within_window() {
        let addr = spawn_server(ServerConfig::default()).await;
        let (alice, mut bob, _, _) = start_two_player_game(addr).await;

        drop(alice);
        let notice = bob.recv().await;
        assert_eq!(notice.msg_type, MessageType::PlayerDisconnected);
        assert_eq!(notice.player, "Bob");
        assert_eq!(notice.room, "ROOM_1");
        assert_eq!(notice.get("disconnected_player"), Some("Alice"));
        assert_eq!(notice.get("status"), Some("temporarily_disconnected"));

        // A plain CONNECT may not steal the detached name.
        let mut alice2 = TestClient::connect(addr).await;
        alice2.send_line("0|||name=Alice").await;
        let refused = alice2.recv().await;
        assert_eq!(refused.msg_type, MessageType::Error);

        // RECONNECT restores the identity and replays the game state.
        alice2.send_line("6|||name=Alice").await;
        let connected = alice2.recv().await;
        assert_eq!(connected.msg_type, MessageType::Connected);
        assert_eq!(connected.get("name"), Some("Alice"));
        assert_eq!(connected.get("status"), Some("success"));

        let state = alice2.recv().await;
        assert_eq!(state.msg_type, MessageType::GameState);
        assert_eq!(state.room, "ROOM_1");
        assert_eq!(state.get("hand").unwrap().split(',').count(), 3);

        let back = bob.recv().await;
        assert_eq!(back.msg_type, MessageType::PlayerReconnected);
        assert_eq!(back.get("reconnected_player"), Some("Alice"));
        assert_eq!(back.get("status"), Some("reconnected"));
    }

    #[tokio::test]
    async fn reconnect_for_unknown_name_fails() {
        let addr = spawn_server(ServerConfig::default()).await;
        let mut client = TestClient::connect(addr).await;

        client.send_line("6|||name=Ghost").await;
        let reply = client.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(
            reply.get("error"),
            Some("Reconnection failed - player not found or session expired")
        );
    }

    /// Scenario: a drop that outlives the detach window forfeits the game
    /// and frees the name.
    #[tokio::test]
    async fn expired_window_forfeits_the_game() {
        let config = ServerConfig {
            heartbeat_check_interval: 1,
            cleanup_threshold_seconds: 1,
            ..ServerConfig::default()
        };
        let addr = spawn_server(config).await;
        let (alice, mut bob, _, _) = start_two_player_game(addr).await;

        drop(alice);
        let notice = bob.recv().await;
        assert_eq!(notice.msg_type, MessageType::PlayerDisconnected);

        // The liveness monitor awards Bob the win once the window expires.
        let game_over = bob.recv().await;
        assert_eq!(
            game_over.encode(),
            "112|Bob|ROOM_1|winner=Bob|reason=opponent_disconnect|status=game_over\n"
        );
        let left = bob.recv().await;
        assert_eq!(left.encode(), "102|Bob||status=left\n");

        // The name is free again for a fresh CONNECT.
        let mut newcomer = TestClient::connect(addr).await;
        newcomer.login("Alice").await;
    }

    #[tokio::test]
    async fn silent_player_is_detached_by_ping_timeout() {
        let config = ServerConfig {
            heartbeat_check_interval: 1,
            player_timeout_seconds: 1,
            cleanup_threshold_seconds: 3600,
            ..ServerConfig::default()
        };
        let addr = spawn_server(config).await;
        let mut alice = TestClient::connect(addr).await;
        alice.login("Alice").await;

        // Stay silent past the ping timeout; the monitor detaches us even
        // though the socket is still open.
        tokio::time::sleep(Duration::from_secs(3)).await;
        alice.send_line("4|||").await;
        let reply = alice.recv().await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.get("error"), Some("Must connect first"));

        // The same socket can reattach to the detached identity.
        alice.send_line("6|||name=Alice").await;
        let connected = alice.recv().await;
        assert_eq!(connected.msg_type, MessageType::Connected);
    }
}
