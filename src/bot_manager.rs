//! Bridge between the authoritative session state and sandboxed bots.
//!
//! Bots run at a reduced cadence (every `TICK_RATE / BOT_TICK_RATE`
//! physics ticks). Per decision the manager assembles a read-only
//! [`BotGameState`] — own car, seven vision rays, the checkpoint list and
//! a fog-of-war filtered opponent list — hands it to the sandbox and maps
//! the returned actions onto the player's input slot. Event callbacks are
//! never fatal: failures are logged and the bot keeps racing.

use crate::bot_api::{
    BotActions, BotCarState, BotGameState, BotOpponent, BotRaceState, BotRay, BotTrackState,
    CollisionKind,
};
use crate::config::ServerConfig;
use crate::data::{PlayerId, PlayerInput, PlayerState};
use crate::physics::normalize_angle;
use crate::raycast::{RayTarget, RaycastSystem};
use crate::sandbox::{BotInstance, BotSandbox, SandboxError, SandboxLimits};
use crate::track::Track;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::{info, warn};

/// Rough distance assumed between consecutive checkpoints when estimating
/// distance to the finish.
const CHECKPOINT_SPACING_ESTIMATE: f64 = 100.0;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("failed to load bot: {0}")]
    Load(SandboxError),
    #[error("bot execution error: {0}")]
    Execution(SandboxError),
}

/// A loaded bot bound to a player slot. Opaque to the engine; only the
/// sandbox touches the instance.
pub struct BotHandle {
    pub class_name: String,
    pub code_hash: u64,
    instance: BotInstance,
}

pub struct BotManager {
    sandbox: BotSandbox,
    raycast: RaycastSystem,
    tick_interval: u64,
    visibility_radius: f64,
}

impl BotManager {
    pub fn new(config: &ServerConfig) -> Result<Self, BotError> {
        let sandbox = BotSandbox::new(SandboxLimits {
            timeout_ms: config.bot.execution_timeout_ms,
            memory_limit_mb: config.bot.memory_limit_mb,
            max_code_size_kb: config.bot.max_code_size_kb,
        })
        .map_err(BotError::Load)?;

        Ok(Self {
            sandbox,
            raycast: RaycastSystem::new(config.bot.raycast_max_range, config.physics.car_radius),
            tick_interval: config.bot_tick_interval().max(1),
            visibility_radius: config.bot.opponent_visibility_radius,
        })
    }

    /// Bots decide only on every Nth physics tick.
    pub fn should_run(&self, tick: u64) -> bool {
        tick % self.tick_interval == 0
    }

    pub fn load(&self, code: &str, class_name: &str) -> Result<BotHandle, BotError> {
        let instance = self.sandbox.load(code, class_name).map_err(|e| {
            warn!(class_name, error = %e, "bot failed to load");
            BotError::Load(e)
        })?;

        let mut hasher = DefaultHasher::new();
        code.hash(&mut hasher);
        info!(class_name, "bot loaded");

        Ok(BotHandle {
            class_name: class_name.to_string(),
            code_hash: hasher.finish(),
            instance,
        })
    }

    /// Run one bot decision. A fatal sandbox violation bubbles up as
    /// `BotError` and the caller disqualifies the bot.
    pub fn tick(
        &self,
        handle: &mut BotHandle,
        view: BotGameState,
    ) -> Result<PlayerInput, BotError> {
        let actions = handle
            .instance
            .call_on_tick(view)
            .map_err(BotError::Execution)?;
        Ok(actions_to_input(actions))
    }

    /// Assemble the sensor view for one bot from the authoritative state.
    pub fn build_game_state(
        &self,
        track: &Track,
        players: &HashMap<PlayerId, PlayerState>,
        self_id: &str,
        race_elapsed: f64,
    ) -> BotGameState {
        let player = &players[self_id];
        let car = &player.car;

        let others: Vec<RayTarget<'_>> = players
            .values()
            .filter(|p| p.id != self_id)
            .map(|p| RayTarget {
                id: &p.id,
                position: p.car.position,
            })
            .collect();

        let rays = self
            .raycast
            .cast_all_rays(car.position, car.heading, track, &others)
            .iter()
            .map(|r| BotRay {
                distance: r.distance,
                hit_kind: r.hit_kind,
            })
            .collect();

        let bot_car = BotCarState {
            position: car.position,
            heading: car.heading,
            speed: car.speed(),
            velocity: car.velocity,
            angular_velocity: car.angular_velocity,
            nitro_charges: car.nitro_charges,
            nitro_active: car.nitro_active,
            current_surface: track.surface_at(car.position),
            off_track: player.is_off_track,
        };

        let bot_track = BotTrackState {
            checkpoints: track.checkpoints.iter().map(|cp| cp.position).collect(),
            next_checkpoint: player.current_checkpoint,
            // Reserved fields, conservative constants for now.
            distance_to_boundary_left: 100.0,
            distance_to_boundary_right: 100.0,
            upcoming_turn_sharpness: 0.0,
        };

        let opponents = self.visible_opponents(player, players);

        let race = BotRaceState {
            current_checkpoint: player.current_checkpoint,
            total_checkpoints: track.checkpoints.len(),
            position: player.position.unwrap_or(players.len()),
            total_cars: players.len(),
            elapsed_time: race_elapsed,
            distance_to_finish: distance_to_finish(player, track),
        };

        BotGameState {
            car: bot_car,
            rays,
            track: bot_track,
            opponents,
            race,
        }
    }

    /// Fog of war: only opponents within the visibility radius are
    /// reported, and only pose and motion — nothing else of theirs leaks
    /// into the view.
    fn visible_opponents(
        &self,
        observer: &PlayerState,
        players: &HashMap<PlayerId, PlayerState>,
    ) -> Vec<BotOpponent> {
        let mut opponents = Vec::new();
        for other in players.values() {
            if other.id == observer.id {
                continue;
            }

            let delta = other.car.position - observer.car.position;
            let distance = delta.magnitude();
            if distance > self.visibility_radius {
                continue;
            }

            let relative_angle =
                normalize_angle(delta.y.atan2(delta.x) - observer.car.heading);

            opponents.push(BotOpponent {
                position: other.car.position,
                velocity: other.car.velocity,
                heading: other.car.heading,
                distance,
                relative_angle,
            });
        }
        opponents
    }

    /// Collision callback; errors are logged, the bot keeps racing.
    pub fn on_collision(
        &self,
        handle: &mut BotHandle,
        kind: CollisionKind,
        impact_speed: f64,
        direction: f64,
    ) {
        if let Err(e) = handle
            .instance
            .call_on_collision(kind.code(), impact_speed, direction)
        {
            warn!(class_name = %handle.class_name, error = %e, "bot on_collision failed");
        }
    }

    pub fn on_checkpoint(&self, handle: &mut BotHandle, checkpoint_index: usize, split_time: f64) {
        if let Err(e) = handle
            .instance
            .call_on_checkpoint(checkpoint_index as i32, split_time)
        {
            warn!(class_name = %handle.class_name, error = %e, "bot on_checkpoint failed");
        }
    }

    pub fn on_finish(&self, handle: &mut BotHandle, finish_time: f64, final_position: usize) {
        if let Err(e) = handle
            .instance
            .call_on_finish(finish_time, final_position as i32)
        {
            warn!(class_name = %handle.class_name, error = %e, "bot on_finish failed");
        }
    }
}

fn actions_to_input(actions: BotActions) -> PlayerInput {
    PlayerInput {
        accelerate: actions.accelerate,
        brake: actions.brake,
        turn_left: actions.turn_left,
        turn_right: actions.turn_right,
        nitro: actions.nitro,
    }
}

/// Direct distance to the next checkpoint plus a constant per remaining
/// checkpoint after it.
fn distance_to_finish(player: &PlayerState, track: &Track) -> f64 {
    if player.current_checkpoint >= track.checkpoints.len() {
        return 0.0;
    }

    let next = &track.checkpoints[player.current_checkpoint];
    let mut distance = player.car.position.distance_to(next.position);

    let remaining_after = track.checkpoints.len() - player.current_checkpoint - 1;
    distance += remaining_after as f64 * CHECKPOINT_SPACING_ESTIMATE;
    distance
}
