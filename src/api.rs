//! HTTP/WebSocket glue: the lobby REST surface, the per-session message
//! stream, heartbeats and the bot store.
//!
//! The framing itself belongs to axum; this layer maps frames to
//! [`ClientMessage`]/[`ServerMessage`] and drives the lobby manager,
//! session registry and engines.

use crate::config::ServerConfig;
use crate::data::PlayerId;
use crate::lobby::{LobbySettings, LobbyStatus};
use crate::lobby_manager::LobbyManager;
use crate::network::{ClientMessage, LobbyStatePayload, ServerMessage, TrackPayload};
use crate::registry::{ConnectionId, ConnectionSender, Outbound, SessionRegistry};
use crate::track::{Difficulty, TrackFactory};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// --- Bot store ---

#[derive(Debug, Clone)]
pub struct StoredBot {
    pub code: String,
    pub class_name: String,
    pub owner_username: String,
}

/// Source of stored bot programs; persistence lives elsewhere.
pub trait BotStore: Send + Sync {
    fn get(&self, bot_id: &str) -> Option<StoredBot>;
}

#[derive(Default)]
pub struct InMemoryBotStore {
    bots: std::sync::RwLock<HashMap<String, StoredBot>>,
}

impl InMemoryBotStore {
    pub fn insert(&self, bot_id: &str, bot: StoredBot) {
        self.bots
            .write()
            .expect("bot store lock")
            .insert(bot_id.to_string(), bot);
    }
}

impl BotStore for InMemoryBotStore {
    fn get(&self, bot_id: &str) -> Option<StoredBot> {
        self.bots.read().expect("bot store lock").get(bot_id).cloned()
    }
}

// --- Lobby connection hub ---

struct LobbyConnection {
    sender: ConnectionSender,
    last_pong: f64,
}

/// Connections attached to lobbies that have no running session yet.
#[derive(Default)]
pub struct LobbyHub {
    connections: RwLock<HashMap<String, HashMap<ConnectionId, LobbyConnection>>>,
}

impl LobbyHub {
    pub async fn register(&self, lobby_id: &str, sender: ConnectionSender) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        self.connections
            .write()
            .await
            .entry(lobby_id.to_string())
            .or_default()
            .insert(
                connection_id,
                LobbyConnection {
                    sender,
                    last_pong: now_unix_secs(),
                },
            );
        connection_id
    }

    pub async fn remove(&self, lobby_id: &str, connection_id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(lobby) = connections.get_mut(lobby_id) {
            lobby.remove(&connection_id);
            if lobby.is_empty() {
                connections.remove(lobby_id);
            }
        }
    }

    pub async fn update_pong(&self, lobby_id: &str, connection_id: ConnectionId) {
        if let Some(connection) = self
            .connections
            .write()
            .await
            .get_mut(lobby_id)
            .and_then(|l| l.get_mut(&connection_id))
        {
            connection.last_pong = now_unix_secs();
        }
    }

    pub async fn last_pong(&self, lobby_id: &str, connection_id: ConnectionId) -> Option<f64> {
        self.connections
            .read()
            .await
            .get(lobby_id)
            .and_then(|l| l.get(&connection_id))
            .map(|c| c.last_pong)
    }

    pub async fn broadcast(&self, lobby_id: &str, message: ServerMessage) {
        let targets: Vec<ConnectionSender> = {
            let connections = self.connections.read().await;
            connections
                .get(lobby_id)
                .map(|l| l.values().map(|c| c.sender.clone()).collect())
                .unwrap_or_default()
        };
        for sender in targets {
            let _ = sender.send(Outbound::Message(message.clone()));
        }
    }
}

// --- Application state ---

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub lobby_manager: Arc<LobbyManager>,
    pub registry: Arc<SessionRegistry>,
    pub bot_store: Arc<dyn BotStore>,
    pub track_factory: Arc<dyn TrackFactory>,
    pub lobby_hub: Arc<LobbyHub>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/lobbies", post(create_lobby).get(list_lobbies))
        .route("/lobbies/{id}", get(get_lobby).delete(delete_lobby))
        .route("/lobbies/{id}/settings", put(update_lobby_settings))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// --- REST handlers ---

#[derive(Debug, Deserialize)]
struct CreateLobbyRequest {
    name: String,
    host_id: String,
    #[serde(default)]
    settings: Option<LobbySettings>,
}

async fn create_lobby(
    State(state): State<AppState>,
    Json(request): Json<CreateLobbyRequest>,
) -> Response {
    if request.name.trim().is_empty() || request.host_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "name and host_id are required"})),
        )
            .into_response();
    }

    let lobby = state
        .lobby_manager
        .create_lobby(&request.name, &request.host_id, request.settings)
        .await;
    (StatusCode::CREATED, Json(LobbyStatePayload::from(&lobby))).into_response()
}

#[derive(Debug, Deserialize)]
struct ListLobbiesQuery {
    status: Option<String>,
}

async fn list_lobbies(
    State(state): State<AppState>,
    Query(query): Query<ListLobbiesQuery>,
) -> Response {
    let filter = match query.status.as_deref() {
        None => None,
        Some("waiting") => Some(LobbyStatus::Waiting),
        Some("starting") => Some(LobbyStatus::Starting),
        Some("racing") => Some(LobbyStatus::Racing),
        Some("finished") => Some(LobbyStatus::Finished),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("unknown status '{other}'")})),
            )
                .into_response();
        }
    };

    let lobbies: Vec<LobbyStatePayload> = state
        .lobby_manager
        .list_lobbies(filter)
        .await
        .iter()
        .map(LobbyStatePayload::from)
        .collect();
    Json(lobbies).into_response()
}

async fn get_lobby(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.lobby_manager.get_lobby(&id).await {
        Some(lobby) => Json(LobbyStatePayload::from(&lobby)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "lobby not found"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PlayerQuery {
    player_id: String,
}

async fn update_lobby_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PlayerQuery>,
    Json(settings): Json<LobbySettings>,
) -> Response {
    let Some(lobby) = state.lobby_manager.get_lobby(&id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "lobby not found"})),
        )
            .into_response();
    };
    if !lobby.is_host(&query.player_id) {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "only the host can update settings"})),
        )
            .into_response();
    }

    if state
        .lobby_manager
        .update_settings(&id, &query.player_id, settings)
        .await
    {
        match state.lobby_manager.get_lobby(&id).await {
            Some(lobby) => {
                let payload = LobbyStatePayload::from(&lobby);
                state
                    .lobby_hub
                    .broadcast(&id, ServerMessage::LobbyState(payload.clone()))
                    .await;
                Json(payload).into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        }
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "settings cannot be updated now"})),
        )
            .into_response()
    }
}

async fn delete_lobby(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PlayerQuery>,
) -> Response {
    let Some(lobby) = state.lobby_manager.get_lobby(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !lobby.is_host(&query.player_id) {
        return StatusCode::FORBIDDEN.into_response();
    }

    if state.lobby_manager.disband_lobby(&id, &query.player_id).await {
        if let Some(session_id) = lobby.game_session_id {
            state.registry.remove_session(&session_id).await;
        }
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::BAD_REQUEST.into_response()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    sessions: usize,
    lobbies: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sessions: state.registry.session_count().await,
        lobbies: state.lobby_manager.list_lobbies(None).await.len(),
    })
}

// --- WebSocket handling ---

#[derive(Debug, Deserialize)]
struct WsParams {
    lobby_id: Option<String>,
    session_id: Option<String>,
    player_id: Option<String>,
    difficulty: Option<String>,
    seed: Option<u64>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Where this connection's liveness is tracked.
enum ConnectionScope {
    Session {
        session_id: String,
        connection_id: ConnectionId,
    },
    Lobby {
        lobby_id: String,
        connection_id: ConnectionId,
    },
}

async fn handle_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let player_id: PlayerId = params
        .player_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: channel -> socket, terminating on a close frame.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to encode server message");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let scope = match establish(&state, &params, &player_id, &tx).await {
        Some(scope) => scope,
        None => {
            let _ = tx.send(Outbound::Close {
                code: 1008,
                reason: "could not join".to_string(),
            });
            let _ = writer.await;
            return;
        }
    };

    let heartbeat = heartbeat_monitor(
        state.clone(),
        &scope,
        tx.clone(),
        state.config.server.ping_interval_secs,
        state.config.server.pong_timeout_secs,
    );
    tokio::pin!(heartbeat);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else {
                    debug!(%player_id, "client disconnected");
                    break;
                };
                match frame {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => {
                                handle_client_message(&state, &scope, &player_id, &tx, message)
                                    .await;
                            }
                            Err(e) => {
                                let _ = tx.send(Outbound::Message(ServerMessage::Error {
                                    message: format!("malformed message: {e}"),
                                }));
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // Transport-level ping/pong and binary frames are
                    // ignored; liveness uses the JSON heartbeat.
                    _ => {}
                }
            }
            _ = &mut heartbeat => {
                warn!(%player_id, "heartbeat timed out, closing connection");
                let _ = tx.send(Outbound::Close {
                    code: 1008,
                    reason: "ping timeout".to_string(),
                });
                break;
            }
        }
    }

    teardown(&state, &scope, &player_id).await;
    drop(tx);
    let _ = writer.await;
}

/// Join a session (direct mode) or a lobby (lobby mode) and send the
/// opening message.
async fn establish(
    state: &AppState,
    params: &WsParams,
    player_id: &str,
    tx: &ConnectionSender,
) -> Option<ConnectionScope> {
    if let Some(lobby_id) = &params.lobby_id {
        let lobby = state.lobby_manager.get_lobby(lobby_id).await?;
        if !lobby.contains(player_id)
            && !state
                .lobby_manager
                .join_lobby(lobby_id, player_id, None)
                .await
        {
            return None;
        }

        let connection_id = state.lobby_hub.register(lobby_id, tx.clone()).await;
        let lobby = state.lobby_manager.get_lobby(lobby_id).await?;
        let _ = tx.send(Outbound::Message(ServerMessage::LobbyJoined {
            lobby_id: lobby_id.clone(),
            join_code: lobby.join_code.clone(),
            player_id: player_id.to_string(),
        }));
        state
            .lobby_hub
            .broadcast(lobby_id, ServerMessage::LobbyState(LobbyStatePayload::from(&lobby)))
            .await;

        return Some(ConnectionScope::Lobby {
            lobby_id: lobby_id.clone(),
            connection_id,
        });
    }

    // Direct mode: join an existing session or spin up a fresh one.
    let (session_id, engine) = match &params.session_id {
        Some(id) => (id.clone(), state.registry.get_session(id).await?),
        None => {
            let difficulty = Difficulty::parse(params.difficulty.as_deref().unwrap_or("medium"));
            let track = Arc::new(state.track_factory.build(difficulty, params.seed));
            state
                .registry
                .create_session(None, track, false)
                .await
                .map_err(|e| warn!(error = %e, "failed to create session"))
                .ok()?
        }
    };

    {
        let mut engine = engine.lock().await;
        if engine.players.contains_key(player_id) {
            debug!(player_id, "player reattached to session");
        } else if engine.add_player(player_id).is_none() {
            return None;
        }
    }

    let connection_id = state
        .registry
        .register_connection(&session_id, player_id, tx.clone())
        .await?;

    let track_payload = {
        let engine = engine.lock().await;
        TrackPayload::from(engine.track.as_ref())
    };
    let _ = tx.send(Outbound::Message(ServerMessage::Connected {
        session_id: session_id.clone(),
        player_id: player_id.to_string(),
        track: track_payload,
    }));

    Some(ConnectionScope::Session {
        session_id,
        connection_id,
    })
}

async fn handle_client_message(
    state: &AppState,
    scope: &ConnectionScope,
    player_id: &str,
    tx: &ConnectionSender,
    message: ClientMessage,
) {
    match scope {
        ConnectionScope::Session {
            session_id,
            connection_id,
        } => match message {
            ClientMessage::Input(input) => {
                if let Some(engine) = state.registry.get_session(session_id).await {
                    engine.lock().await.update_input(player_id, input);
                }
            }
            ClientMessage::Pong => {
                state.registry.update_pong(session_id, *connection_id).await;
            }
            ClientMessage::StartRace => {
                if let Some(engine) = state.registry.get_session(session_id).await {
                    if !engine.lock().await.start_race() {
                        let _ = tx.send(Outbound::Message(ServerMessage::Error {
                            message: "race cannot start now".to_string(),
                        }));
                    }
                }
            }
            ClientMessage::SubmitBot { bot_id } => {
                let response = submit_bot_to_session(state, session_id, &bot_id).await;
                let _ = tx.send(Outbound::Message(response));
            }
            ClientMessage::LeaveLobby | ClientMessage::AddBotToLobby { .. } => {
                let _ = tx.send(Outbound::Message(ServerMessage::Error {
                    message: "not in a lobby".to_string(),
                }));
            }
        },
        ConnectionScope::Lobby {
            lobby_id,
            connection_id,
        } => match message {
            ClientMessage::Pong => {
                state.lobby_hub.update_pong(lobby_id, *connection_id).await;
            }
            ClientMessage::StartRace => {
                start_lobby_race(state, lobby_id, player_id, tx).await;
            }
            ClientMessage::AddBotToLobby { bot_id } => {
                add_bot_to_lobby(state, lobby_id, &bot_id, tx).await;
            }
            ClientMessage::LeaveLobby => {
                let lobby = state.lobby_manager.get_lobby(lobby_id).await;
                if state.lobby_manager.leave_lobby(lobby_id, player_id).await {
                    state
                        .lobby_hub
                        .broadcast(
                            lobby_id,
                            ServerMessage::LobbyMemberLeft {
                                player_id: player_id.to_string(),
                            },
                        )
                        .await;
                    match state.lobby_manager.get_lobby(lobby_id).await {
                        Some(lobby) => {
                            state
                                .lobby_hub
                                .broadcast(
                                    lobby_id,
                                    ServerMessage::LobbyState(LobbyStatePayload::from(&lobby)),
                                )
                                .await;
                        }
                        None => {
                            // Lobby disbanded with the last member.
                            if let Some(session_id) =
                                lobby.and_then(|l| l.game_session_id)
                            {
                                state.registry.remove_session(&session_id).await;
                            }
                        }
                    }
                }
            }
            ClientMessage::Input(_) | ClientMessage::SubmitBot { .. } => {
                let _ = tx.send(Outbound::Message(ServerMessage::Error {
                    message: "no active session for this connection".to_string(),
                }));
            }
        },
    }
}

async fn submit_bot_to_session(
    state: &AppState,
    session_id: &str,
    bot_id: &str,
) -> ServerMessage {
    let Some(stored) = state.bot_store.get(bot_id) else {
        return ServerMessage::BotSubmissionResponse {
            success: false,
            bot_player_id: None,
            error: Some(format!("bot '{bot_id}' not found")),
        };
    };
    let Some(engine) = state.registry.get_session(session_id).await else {
        return ServerMessage::BotSubmissionResponse {
            success: false,
            bot_player_id: None,
            error: Some("session gone".to_string()),
        };
    };

    let bot_player_id = format!("bot-{}-{}", stored.owner_username, bot_id);
    let result = engine.lock().await.submit_bot(
        &bot_player_id,
        &stored.code,
        &stored.class_name,
    );
    match result {
        Ok(()) => ServerMessage::BotSubmissionResponse {
            success: true,
            bot_player_id: Some(bot_player_id),
            error: None,
        },
        Err(e) => ServerMessage::BotSubmissionResponse {
            success: false,
            bot_player_id: None,
            error: Some(e.to_string()),
        },
    }
}

async fn add_bot_to_lobby(state: &AppState, lobby_id: &str, bot_id: &str, tx: &ConnectionSender) {
    let Some(stored) = state.bot_store.get(bot_id) else {
        let _ = tx.send(Outbound::Message(ServerMessage::BotSubmissionResponse {
            success: false,
            bot_player_id: None,
            error: Some(format!("bot '{bot_id}' not found")),
        }));
        return;
    };

    let added = state
        .lobby_manager
        .add_bot_to_lobby(lobby_id, bot_id, &stored.owner_username)
        .await;
    let _ = tx.send(Outbound::Message(ServerMessage::BotSubmissionResponse {
        success: added.is_some(),
        bot_player_id: added.clone(),
        error: if added.is_some() {
            None
        } else {
            Some("bot could not be added".to_string())
        },
    }));

    if added.is_some() {
        if let Some(lobby) = state.lobby_manager.get_lobby(lobby_id).await {
            state
                .lobby_hub
                .broadcast(lobby_id, ServerMessage::LobbyState(LobbyStatePayload::from(&lobby)))
                .await;
        }
    }
}

/// Host-triggered lobby start: build the track, construct the session,
/// seat every member (loading bots from the store), begin the countdown
/// and tell everyone to move over.
async fn start_lobby_race(state: &AppState, lobby_id: &str, player_id: &str, tx: &ConnectionSender) {
    let Some((session_id, track)) = state.lobby_manager.start_race(lobby_id, player_id).await
    else {
        let _ = tx.send(Outbound::Message(ServerMessage::Error {
            message: "race cannot start (not host, or lobby not ready)".to_string(),
        }));
        return;
    };

    let engine = match state
        .registry
        .create_session(Some(session_id.clone()), track, true)
        .await
    {
        Ok((_, engine)) => engine,
        Err(e) => {
            warn!(lobby_id, error = %e, "failed to construct session");
            let _ = tx.send(Outbound::Message(ServerMessage::Error {
                message: "failed to construct session".to_string(),
            }));
            return;
        }
    };

    if let Some(lobby) = state.lobby_manager.get_lobby(lobby_id).await {
        let mut engine = engine.lock().await;
        engine.set_grace_period(lobby.settings.grace_period_secs);
        for member in lobby.members.values() {
            if member.is_bot {
                let Some(bot_ref) = &member.bot_ref else {
                    continue;
                };
                match state.bot_store.get(bot_ref) {
                    Some(stored) => {
                        if let Err(e) = engine.submit_bot(
                            &member.player_id,
                            &stored.code,
                            &stored.class_name,
                        ) {
                            warn!(
                                lobby_id,
                                bot = %member.player_id,
                                error = %e,
                                "bot failed to load, racing without it"
                            );
                        }
                    }
                    None => {
                        warn!(lobby_id, bot = %member.player_id, "stored bot missing");
                    }
                }
            } else {
                engine.add_player(&member.player_id);
            }
        }
        engine.start_race();
    }

    state.lobby_manager.transition_to_racing(lobby_id).await;
    state
        .lobby_hub
        .broadcast(
            lobby_id,
            ServerMessage::RaceStarting {
                session_id: session_id.clone(),
            },
        )
        .await;
    info!(lobby_id, %session_id, "lobby race started");
}

/// Ping on an interval; resolve (causing a close) once a pong goes
/// missing for longer than `ping_interval + pong_timeout`.
async fn heartbeat_monitor(
    state: AppState,
    scope: &ConnectionScope,
    tx: ConnectionSender,
    ping_interval: f64,
    pong_timeout: f64,
) {
    loop {
        sleep(Duration::from_secs_f64(ping_interval)).await;

        if tx
            .send(Outbound::Message(ServerMessage::Ping {
                timestamp: now_unix_secs(),
            }))
            .is_err()
        {
            return;
        }

        sleep(Duration::from_secs_f64(pong_timeout)).await;

        let last_pong = match scope {
            ConnectionScope::Session {
                session_id,
                connection_id,
            } => state.registry.last_pong(session_id, *connection_id).await,
            ConnectionScope::Lobby {
                lobby_id,
                connection_id,
            } => state.lobby_hub.last_pong(lobby_id, *connection_id).await,
        };
        let Some(last_pong) = last_pong else {
            // Connection already gone from its registry.
            return;
        };

        if now_unix_secs() - last_pong > ping_interval + pong_timeout {
            return;
        }
    }
}

async fn teardown(state: &AppState, scope: &ConnectionScope, player_id: &str) {
    match scope {
        ConnectionScope::Session {
            session_id,
            connection_id,
        } => {
            if let Some(engine) = state.registry.get_session(session_id).await {
                engine.lock().await.remove_player(player_id);
            }
            state
                .registry
                .remove_connection(session_id, *connection_id)
                .await;
        }
        ConnectionScope::Lobby {
            lobby_id,
            connection_id,
        } => {
            state.lobby_hub.remove(lobby_id, *connection_id).await;
            let lobby = state.lobby_manager.get_lobby(lobby_id).await;
            if state.lobby_manager.leave_lobby(lobby_id, player_id).await {
                state
                    .lobby_hub
                    .broadcast(
                        lobby_id,
                        ServerMessage::LobbyMemberLeft {
                            player_id: player_id.to_string(),
                        },
                    )
                    .await;
                if state.lobby_manager.get_lobby(lobby_id).await.is_none() {
                    if let Some(session_id) = lobby.and_then(|l| l.game_session_id) {
                        state.registry.remove_session(&session_id).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::StageFactory;

    fn app_state() -> AppState {
        let config = Arc::new(ServerConfig::default());
        let track_factory: Arc<dyn TrackFactory> = Arc::new(StageFactory::default());
        AppState {
            config: Arc::clone(&config),
            lobby_manager: Arc::new(LobbyManager::new(Arc::clone(&track_factory))),
            registry: Arc::new(SessionRegistry::new((*config).clone())),
            bot_store: Arc::new(InMemoryBotStore::default()),
            track_factory,
            lobby_hub: Arc::new(LobbyHub::default()),
        }
    }

    #[test]
    fn test_in_memory_bot_store() {
        let store = InMemoryBotStore::default();
        assert!(store.get("1").is_none());
        store.insert(
            "1",
            StoredBot {
                code: "(module)".to_string(),
                class_name: "Racer".to_string(),
                owner_username: "alice".to_string(),
            },
        );
        let bot = store.get("1").unwrap();
        assert_eq!(bot.owner_username, "alice");
    }

    #[tokio::test]
    async fn test_lobby_hub_round_trip() {
        let hub = LobbyHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.register("l1", tx).await;

        hub.broadcast("l1", ServerMessage::Ping { timestamp: 1.0 }).await;
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Message(ServerMessage::Ping { .. }))
        ));

        let before = hub.last_pong("l1", conn).await.unwrap();
        hub.update_pong("l1", conn).await;
        assert!(hub.last_pong("l1", conn).await.unwrap() >= before);

        hub.remove("l1", conn).await;
        assert!(hub.last_pong("l1", conn).await.is_none());
    }

    #[tokio::test]
    async fn test_submit_unknown_bot() {
        let state = app_state();
        let track = Arc::new(crate::track::straight_track(500.0, 100.0, &[500.0]));
        let (session_id, _) = state
            .registry
            .create_session(None, track, false)
            .await
            .unwrap();

        let response = submit_bot_to_session(&state, &session_id, "missing").await;
        match response {
            ServerMessage::BotSubmissionResponse { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("missing"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_bot_seats_bot_player() {
        let state = app_state();
        let store = InMemoryBotStore::default();
        store.insert(
            "7",
            StoredBot {
                code: r#"
                    (module
                      (func (export "Racer"))
                      (func (export "on_tick") (result i32) i32.const 1))
                "#
                .to_string(),
                class_name: "Racer".to_string(),
                owner_username: "alice".to_string(),
            },
        );
        let state = AppState {
            bot_store: Arc::new(store),
            ..state
        };

        let track = Arc::new(crate::track::straight_track(500.0, 100.0, &[500.0]));
        let (session_id, engine) = state
            .registry
            .create_session(None, track, false)
            .await
            .unwrap();

        let response = submit_bot_to_session(&state, &session_id, "7").await;
        match response {
            ServerMessage::BotSubmissionResponse {
                success,
                bot_player_id,
                ..
            } => {
                assert!(success);
                assert_eq!(bot_player_id.as_deref(), Some("bot-alice-7"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(engine.lock().await.players.contains_key("bot-alice-7"));
    }
}
