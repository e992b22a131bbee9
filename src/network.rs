//! Wire protocol: `{type, data}` framed JSON messages between clients and
//! the server, plus the track and snapshot payloads they carry.

use crate::data::{PlayerId, PlayerInput, RaceInfo};
use crate::game_session::GameSession;
use crate::lobby::{Lobby, LobbySettings, LobbyStatus};
use crate::physics::{CarState, Vec2};
use crate::track::{Checkpoint, Containment, Obstacle, SurfaceKind, Track};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Client to server ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Input for the next tick; missing fields default to false.
    Input(PlayerInput),
    /// Heartbeat acknowledgment.
    Pong,
    /// Request the race countdown (host in lobby mode, anyone in direct
    /// mode).
    StartRace,
    /// Attach a stored bot to this session (direct mode).
    SubmitBot { bot_id: String },
    /// Lobby mode only.
    LeaveLobby,
    /// Lobby mode only.
    AddBotToLobby { bot_id: String },
}

// --- Server to client ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Initial handshake with the full track description.
    Connected {
        session_id: String,
        player_id: PlayerId,
        track: TrackPayload,
    },
    GameState(GameStateSnapshot),
    Ping {
        timestamp: f64,
    },
    LobbyJoined {
        lobby_id: String,
        join_code: String,
        player_id: PlayerId,
    },
    LobbyState(LobbyStatePayload),
    LobbyMemberLeft {
        player_id: PlayerId,
    },
    RaceStarting {
        session_id: String,
    },
    BotSubmissionResponse {
        success: bool,
        bot_player_id: Option<PlayerId>,
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

// --- Track payload ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackNodePayload {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub surface: SurfaceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentPayload {
    pub start: TrackNodePayload,
    pub end: TrackNodePayload,
    pub control1: Option<Vec2>,
    pub control2: Option<Vec2>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPayload {
    pub segments: Vec<SegmentPayload>,
    pub checkpoints: Vec<Checkpoint>,
    pub start_position: Vec2,
    pub start_heading: f64,
    pub total_length: f64,
    pub containment: Option<Containment>,
    pub obstacles: Vec<Obstacle>,
}

impl From<&Track> for TrackPayload {
    fn from(track: &Track) -> Self {
        let node = |n: &crate::track::TrackNode| TrackNodePayload {
            x: n.position.x,
            y: n.position.y,
            width: n.width,
            surface: n.surface,
        };
        Self {
            segments: track
                .segments
                .iter()
                .map(|s| SegmentPayload {
                    start: node(&s.start),
                    end: node(&s.end),
                    control1: s.control1,
                    control2: s.control2,
                })
                .collect(),
            checkpoints: track.checkpoints.clone(),
            start_position: track.start_position,
            start_heading: track.start_heading,
            total_length: track.total_length,
            containment: track.containment.clone(),
            obstacles: track.obstacles.clone(),
        }
    }
}

// --- Snapshot payload ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub car: CarState,
    pub current_checkpoint: usize,
    pub split_times: Vec<f64>,
    pub is_finished: bool,
    pub finish_time: Option<f64>,
    pub is_off_track: bool,
    pub position: Option<usize>,
    pub points: u32,
    pub dnf: bool,
    pub is_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_error: Option<String>,
}

/// Immutable, self-contained description of a session at one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStateSnapshot {
    pub tick: u64,
    pub race_info: RaceInfo,
    pub players: HashMap<PlayerId, PlayerSnapshot>,
}

impl GameStateSnapshot {
    pub fn from_session(session: &GameSession) -> Self {
        let players = session
            .players
            .iter()
            .map(|(id, p)| {
                (
                    id.clone(),
                    PlayerSnapshot {
                        car: p.car,
                        current_checkpoint: p.current_checkpoint,
                        split_times: p.split_times.clone(),
                        is_finished: p.is_finished,
                        finish_time: p.finish_time,
                        is_off_track: p.is_off_track,
                        position: p.position,
                        points: p.points,
                        dnf: p.dnf,
                        is_bot: p.is_bot,
                        bot_error: p.bot_error.clone(),
                    },
                )
            })
            .collect();

        Self {
            tick: session.tick,
            race_info: session.race_info.clone(),
            players,
        }
    }
}

// --- Lobby payload ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyMemberPayload {
    pub player_id: PlayerId,
    pub username: Option<String>,
    pub is_bot: bool,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyStatePayload {
    pub lobby_id: String,
    pub join_code: String,
    pub name: String,
    pub host_id: PlayerId,
    pub status: LobbyStatus,
    pub settings: LobbySettings,
    pub members: Vec<LobbyMemberPayload>,
    pub game_session_id: Option<String>,
}

impl From<&Lobby> for LobbyStatePayload {
    fn from(lobby: &Lobby) -> Self {
        Self {
            lobby_id: lobby.lobby_id.clone(),
            join_code: lobby.join_code.clone(),
            name: lobby.name.clone(),
            host_id: lobby.host_player_id.clone(),
            status: lobby.status,
            settings: lobby.settings.clone(),
            members: lobby
                .members
                .values()
                .map(|m| LobbyMemberPayload {
                    player_id: m.player_id.clone(),
                    username: m.username.clone(),
                    is_bot: m.is_bot,
                    ready: m.ready,
                })
                .collect(),
            game_session_id: lobby.game_session_id.clone(),
        }
    }
}
