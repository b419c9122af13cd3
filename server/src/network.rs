//! Server network layer: TCP accept loop, liveness monitor, shutdown
//!
//! One task per accepted connection (see `session`), one background ticker
//! that enforces the two-tier timeout policy, and a graceful-shutdown path
//! that stops accepting, signals every task through a watch channel, and
//! waits a bounded grace period for them to finish.

use crate::config::ServerConfig;
use crate::player_manager::PlayerManager;
use crate::room_manager::RoomManager;
use crate::session::{run_session, send_targeted};
use log::{error, info, warn};
use shared::{Frame, MessageType};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::interval;

/// How long shutdown waits for sessions and the monitor before abandoning
/// them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shared handles threaded through every task.
///
/// Lock ordering: tasks that need both registries take the player lock
/// first, release it, then take the room lock; the two are never held at
/// once.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub players: Arc<RwLock<PlayerManager>>,
    pub rooms: Arc<RwLock<RoomManager>>,
}

/// Listening server: owns the acceptor socket and the shutdown channel.
pub struct Server {
    listener: TcpListener,
    state: ServerState,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Binds the listening socket and builds the shared state.
    pub async fn bind(
        config: ServerConfig,
    ) -> Result<Server, Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let state = ServerState {
            players: Arc::new(RwLock::new(PlayerManager::new())),
            rooms: Arc::new(RwLock::new(RoomManager::new(
                config.max_rooms,
                config.max_players_per_room,
            ))),
            config: Arc::new(config),
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Server {
            listener,
            state,
            shutdown_tx,
        })
    }

    /// The actually bound address (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown_signal` resolves, then performs
    /// a graceful shutdown.
    pub async fn run<F>(
        self,
        shutdown_signal: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        let monitor = tokio::spawn(liveness_loop(
            self.state.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut next_conn_id: u64 = 1;
        tokio::pin!(shutdown_signal);

        info!("Server started successfully");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("Connection #{} accepted from {}", next_conn_id, addr);
                            sessions.spawn(run_session(
                                stream,
                                addr,
                                next_conn_id,
                                self.state.clone(),
                                self.shutdown_tx.subscribe(),
                            ));
                            next_conn_id += 1;
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                        }
                    }
                    // Reap sessions that have already finished.
                    while sessions.try_join_next().is_some() {}
                }
                _ = &mut shutdown_signal => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Stop accepting, then wake the monitor and every session; reads
        // unblock via the watch channel.
        drop(self.listener);
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            while sessions.join_next().await.is_some() {}
            let _ = monitor.await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Shutdown grace period expired, abandoning remaining tasks");
        }

        info!("Server stopped");
        Ok(())
    }
}

// ============================================================================
// Liveness monitor
// ============================================================================

/// Background ticker enforcing the two-tier timeout policy: silent attached
/// players are detached, and detached players whose reconnection window ran
/// out are cleaned up (forfeiting any active game to the remaining seat).
async fn liveness_loop(state: ServerState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.config.heartbeat_check_interval.max(1));
    let mut ticker = interval(period);
    info!(
        "Liveness monitor started ({}s interval, {}s ping timeout, {}s cleanup threshold)",
        state.config.heartbeat_check_interval,
        state.config.player_timeout_seconds,
        state.config.cleanup_threshold_seconds,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_ping_timeouts(&state).await;
                sweep_expired_detached(&state).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Liveness monitor stopped");
}

/// Detaches attached players whose last ping is too old and notifies their
/// rooms. Registry work happens under the locks; frame dispatch after
/// release.
async fn sweep_ping_timeouts(state: &ServerState) {
    let timeout = Duration::from_secs(state.config.player_timeout_seconds);

    let timed_out: Vec<(String, Option<String>)> = {
        let mut players = state.players.write().await;
        players
            .scan_timed_out(timeout)
            .into_iter()
            .map(|name| {
                let room_id = players.room_of(&name);
                players.detach(&name);
                (name, room_id)
            })
            .collect()
    };

    for (name, room_id) in timed_out {
        info!("Player {} timed out waiting for ping", name);
        let Some(room_id) = room_id else {
            continue;
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
            frame.set("status", "timed_out");
            send_targeted(state, &other, frame).await;
        }
    }
}

/// Removes detached players whose reconnection window expired. A victim
/// seated in an active game forfeits it: the remaining seat is declared the
/// winner and the room is torn down.
async fn sweep_expired_detached(state: &ServerState) {
    let threshold = Duration::from_secs(state.config.cleanup_threshold_seconds);

    let victims: Vec<(String, Option<String>)> = {
        let mut players = state.players.write().await;
        players
            .scan_expired_detached(threshold)
            .into_iter()
            .map(|name| {
                let room_id = players.room_of(&name);
                players.clear_room(&name);
                players.remove(&name);
                (name, room_id)
            })
            .collect()
    };

    for (victim, room_id) in victims {
        info!("Reconnection window expired for {}, cleaning up", victim);
        let Some(room_id) = room_id else {
            continue;
        };

        let survivor: Option<String> = {
            let mut rooms = state.rooms.write().await;
            let survivor = rooms.with_room(&room_id, |room| {
                let room = room?;
                if room.is_game_active() {
                    room.players.iter().find(|p| **p != victim).cloned()
                } else {
                    None
                }
            });
            match &survivor {
                Some(_) => {
                    rooms.delete_room(&room_id);
                }
                None => {
                    rooms.leave_room(&victim, &room_id);
                }
            }
            survivor
        };

        let Some(survivor) = survivor else {
            continue;
        };
        info!(
            "Player {} wins {} by opponent disconnect",
            survivor, room_id
        );
        state.players.write().await.clear_room(&survivor);

        let mut game_over = Frame::new(MessageType::GameOver);
        game_over.player = survivor.clone();
        game_over.room = room_id.clone();
        game_over.set("winner", survivor.clone());
        game_over.set("reason", "opponent_disconnect");
        game_over.set("status", "game_over");
        send_targeted(state, &survivor, game_over).await;

        let mut left = Frame::new(MessageType::RoomLeft);
        left.player = survivor.clone();
        left.set("status", "left");
        send_targeted(state, &survivor, left).await;
    }
}
