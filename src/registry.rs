//! Process-wide session registry and per-session snapshot broadcaster.
//!
//! The registry maps session ids to their engines, tracks the connections
//! attached to each session (with last-pong metadata for the heartbeat),
//! and spawns the engine loop plus a broadcaster task per session.
//! Sessions created from a lobby live until the lobby tears them down;
//! direct sessions die with their last connection.

use crate::bot_manager::{BotError, BotManager};
use crate::config::ServerConfig;
use crate::data::PlayerId;
use crate::game_session::{run_session_loop, GameSession};
use crate::network::ServerMessage;
use crate::track::Track;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Frames pushed to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

pub type ConnectionSender = UnboundedSender<Outbound>;

struct ConnectionHandle {
    player_id: PlayerId,
    sender: ConnectionSender,
    last_pong: f64,
}

struct SessionEntry {
    engine: Arc<Mutex<GameSession>>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    from_lobby: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    config: ServerConfig,
}

fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SessionRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Construct a session bound to `track`, spawn its engine loop and
    /// broadcaster, and register it.
    pub async fn create_session(
        self: &Arc<Self>,
        session_id: Option<String>,
        track: Arc<Track>,
        from_lobby: bool,
    ) -> Result<(String, Arc<Mutex<GameSession>>), BotError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let bot_manager = BotManager::new(&self.config)?;
        let engine = Arc::new(Mutex::new(GameSession::new(
            track,
            &self.config,
            bot_manager,
        )));

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    engine: Arc::clone(&engine),
                    connections: HashMap::new(),
                    from_lobby,
                },
            );
        }

        tokio::spawn(run_session_loop(
            Arc::clone(&engine),
            self.config.game.tick_rate,
        ));
        tokio::spawn(Self::broadcaster(
            Arc::clone(self),
            session_id.clone(),
            self.config.server.broadcast_rate_hz,
        ));

        info!(%session_id, from_lobby, "session created");
        Ok((session_id, engine))
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Mutex<GameSession>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| Arc::clone(&entry.engine))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn connection_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, |entry| entry.connections.len())
    }

    /// Close the engine and drop the entry; connections are told to go.
    pub async fn remove_session(&self, session_id: &str) {
        let entry = self.sessions.write().await.remove(session_id);
        if let Some(entry) = entry {
            entry.engine.lock().await.close();
            for connection in entry.connections.values() {
                let _ = connection.sender.send(Outbound::Close {
                    code: 1001,
                    reason: "session closed".to_string(),
                });
            }
            info!(session_id, "session removed");
        }
    }

    pub async fn register_connection(
        &self,
        session_id: &str,
        player_id: &str,
        sender: ConnectionSender,
    ) -> Option<ConnectionId> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        let connection_id = Uuid::new_v4();
        entry.connections.insert(
            connection_id,
            ConnectionHandle {
                player_id: player_id.to_string(),
                sender,
                last_pong: now_unix_secs(),
            },
        );
        debug!(session_id, %connection_id, player_id, "connection registered");
        Some(connection_id)
    }

    /// Drop a connection. A direct session with no connections left is
    /// destroyed; lobby sessions persist until their lobby goes.
    pub async fn remove_connection(&self, session_id: &str, connection_id: ConnectionId) {
        let mut destroy = false;
        {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.connections.remove(&connection_id);
                destroy = entry.connections.is_empty() && !entry.from_lobby;
            }
        }
        if destroy {
            info!(session_id, "last client disconnected, destroying session");
            self.remove_session(session_id).await;
        }
    }

    pub async fn update_pong(&self, session_id: &str, connection_id: ConnectionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions
            .get_mut(session_id)
            .and_then(|entry| entry.connections.get_mut(&connection_id))
        {
            handle.last_pong = now_unix_secs();
        }
    }

    pub async fn last_pong(&self, session_id: &str, connection_id: ConnectionId) -> Option<f64> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|entry| entry.connections.get(&connection_id))
            .map(|handle| handle.last_pong)
    }

    /// Per-session fan-out task. Snapshots are best-effort: a failed
    /// delivery drops that connection, lost frames are tolerated.
    async fn broadcaster(registry: Arc<Self>, session_id: String, rate_hz: u32) {
        let mut ticker = interval(Duration::from_micros(1_000_000 / rate_hz.max(1) as u64));

        loop {
            ticker.tick().await;

            let (engine, targets) = {
                let sessions = registry.sessions.read().await;
                let Some(entry) = sessions.get(&session_id) else {
                    debug!(%session_id, "broadcaster stopping: session gone");
                    return;
                };
                if entry.connections.is_empty() {
                    continue;
                }
                // Copy the target list so delivery tolerates concurrent
                // disconnects.
                let targets: Vec<(ConnectionId, ConnectionSender)> = entry
                    .connections
                    .iter()
                    .map(|(id, handle)| (*id, handle.sender.clone()))
                    .collect();
                (Arc::clone(&entry.engine), targets)
            };

            let snapshot = engine.lock().await.snapshot();
            let message = ServerMessage::GameState(snapshot);

            let mut failed = Vec::new();
            for (connection_id, sender) in targets {
                if sender.send(Outbound::Message(message.clone())).is_err() {
                    failed.push(connection_id);
                }
            }
            for connection_id in failed {
                warn!(%session_id, %connection_id, "dropping dead connection");
                registry.remove_connection(&session_id, connection_id).await;
            }
        }
    }

    /// Players attached to a session's connections, for lobby bookkeeping.
    pub async fn connected_players(&self, session_id: &str) -> Vec<PlayerId> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| {
                entry
                    .connections
                    .values()
                    .map(|handle| handle.player_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::straight_track;
    use tokio::sync::mpsc;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(ServerConfig::default()))
    }

    fn track() -> Arc<Track> {
        Arc::new(straight_track(500.0, 100.0, &[250.0, 500.0]))
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let registry = registry();
        let (session_id, _engine) = registry
            .create_session(None, track(), false)
            .await
            .unwrap();

        assert!(registry.get_session(&session_id).await.is_some());
        assert_eq!(registry.session_count().await, 1);

        registry.remove_session(&session_id).await;
        assert!(registry.get_session(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_direct_session_dies_with_last_connection() {
        let registry = registry();
        let (session_id, _engine) = registry
            .create_session(None, track(), false)
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry
            .register_connection(&session_id, "p1", tx)
            .await
            .unwrap();
        assert_eq!(registry.connection_count(&session_id).await, 1);

        registry.remove_connection(&session_id, conn).await;
        assert!(registry.get_session(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_lobby_session_survives_disconnects() {
        let registry = registry();
        let (session_id, _engine) = registry
            .create_session(Some("lobby-session".to_string()), track(), true)
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry
            .register_connection(&session_id, "p1", tx)
            .await
            .unwrap();
        registry.remove_connection(&session_id, conn).await;

        assert!(registry.get_session(&session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_snapshots() {
        let registry = registry();
        let (session_id, engine) = registry
            .create_session(None, track(), false)
            .await
            .unwrap();
        engine.lock().await.add_player("p1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register_connection(&session_id, "p1", tx)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("snapshot within deadline")
            .expect("channel open");
        match frame {
            Outbound::Message(ServerMessage::GameState(snapshot)) => {
                assert!(snapshot.players.contains_key("p1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pong_tracking() {
        let registry = registry();
        let (session_id, _engine) = registry
            .create_session(None, track(), false)
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry
            .register_connection(&session_id, "p1", tx)
            .await
            .unwrap();

        let before = registry.last_pong(&session_id, conn).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.update_pong(&session_id, conn).await;
        let after = registry.last_pong(&session_id, conn).await.unwrap();
        assert!(after >= before);
    }
}
