//! Core domain types shared across the engine: player identity, inputs,
//! per-player race state and the race status machine.

use crate::physics::{CarState, Vec2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Player identifier. Humans get a UUID string; lobby bots use the
/// `bot-{owner}-{bot_ref}` convention.
pub type PlayerId = String;

/// Desired input for the next tick; overwritten in place by the latest
/// client message or bot decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    #[serde(default)]
    pub accelerate: bool,
    #[serde(default)]
    pub brake: bool,
    #[serde(default)]
    pub turn_left: bool,
    #[serde(default)]
    pub turn_right: bool,
    #[serde(default)]
    pub nitro: bool,
}

impl PlayerInput {
    /// Turn direction for the physics step: right +1, left -1, both or
    /// neither 0.
    pub fn turn_direction(&self) -> f64 {
        match (self.turn_left, self.turn_right) {
            (true, false) => -1.0,
            (false, true) => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Waiting,
    Countdown,
    Racing,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceInfo {
    pub status: RaceStatus,
    /// Wall-clock start of the race (unix seconds).
    pub start_time: Option<f64>,
    pub countdown_remaining: f64,
    /// Race-clock time of the first finisher, seconds since the start.
    pub first_finisher_time: Option<f64>,
    pub grace_period_remaining: f64,
    /// Race-clock time at which the whole race finished.
    pub finish_time: Option<f64>,
}

impl Default for RaceInfo {
    fn default() -> Self {
        Self {
            status: RaceStatus::Waiting,
            start_time: None,
            countdown_remaining: 0.0,
            first_finisher_time: None,
            grace_period_remaining: 0.0,
            finish_time: None,
        }
    }
}

/// Complete state for one race participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub id: PlayerId,
    pub car: CarState,
    pub input: PlayerInput,
    /// Position at the previous tick, for checkpoint-crossing detection.
    pub prev_position: Vec2,
    pub current_checkpoint: usize,
    pub checkpoints_passed: HashSet<usize>,
    /// Race-clock seconds at each checkpoint crossing.
    pub split_times: Vec<f64>,
    pub is_finished: bool,
    pub finish_time: Option<f64>,
    pub is_off_track: bool,
    /// Rank, 1-based; None while waiting or after a DNF.
    pub position: Option<usize>,
    pub points: u32,
    pub dnf: bool,
    /// Collision mass weight.
    pub weight: f64,
    pub is_bot: bool,
    pub bot_error: Option<String>,
}

impl PlayerState {
    pub fn new(id: PlayerId, car: CarState, is_bot: bool) -> Self {
        let prev_position = car.position;
        Self {
            id,
            car,
            input: PlayerInput::default(),
            prev_position,
            current_checkpoint: 0,
            checkpoints_passed: HashSet::new(),
            split_times: Vec::new(),
            is_finished: false,
            finish_time: None,
            is_off_track: false,
            position: None,
            points: 0,
            dnf: false,
            weight: 1.0,
            is_bot,
            bot_error: None,
        }
    }

    /// Still actively racing: not across the line and not disqualified.
    pub fn is_racing(&self) -> bool {
        !self.is_finished && !self.dnf
    }
}
