//! Server-authoritative session engine.
//!
//! One `GameSession` owns the full state of a single race: players, bots,
//! the race status machine and the fixed-step physics. The loop task holds
//! the session lock for the duration of one tick; snapshot readers copy
//! the observable state under the same lock.
//!
//! Per tick while racing: bot decisions at the reduced cadence, the car
//! physics step per player, obstacle / boundary / car-car collision
//! resolution, directional checkpoint crossing, finish detection with the
//! grace-period rule, and rank recomputation.

use crate::bot_api::CollisionKind;
use crate::bot_manager::{BotHandle, BotManager};
use crate::config::ServerConfig;
use crate::data::{PlayerId, PlayerInput, PlayerState, RaceInfo, RaceStatus};
use crate::network::GameStateSnapshot;
use crate::physics::{normalize_angle, CarPhysics, CarState, Vec2};
use crate::track::{SurfaceKind, Track};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Weight of a passed checkpoint in the continuous progress metric.
const PROGRESS_CHECKPOINT_WEIGHT: f64 = 1000.0;

pub struct GameSession {
    pub track: Arc<Track>,
    pub players: HashMap<PlayerId, PlayerState>,
    pub race_info: RaceInfo,
    pub tick: u64,
    /// Race-clock seconds accumulated while the status is Racing.
    pub race_elapsed: f64,
    closed: bool,

    bots: HashMap<PlayerId, BotHandle>,
    physics: CarPhysics,
    bot_manager: BotManager,
    tick_interval: f64,
    countdown_secs: f64,
    grace_period_secs: f64,
    max_players: usize,
    points_by_position: Vec<u32>,
}

impl GameSession {
    pub fn new(track: Arc<Track>, config: &ServerConfig, bot_manager: BotManager) -> Self {
        Self {
            track,
            players: HashMap::new(),
            race_info: RaceInfo::default(),
            tick: 0,
            race_elapsed: 0.0,
            closed: false,
            bots: HashMap::new(),
            physics: CarPhysics::new(config.physics.clone()),
            bot_manager,
            tick_interval: 1.0 / config.game.tick_rate as f64,
            countdown_secs: config.game.countdown_secs,
            grace_period_secs: config.game.finish_grace_period_secs,
            max_players: config.game.max_players,
            points_by_position: config.race.points_by_position.clone(),
        }
    }

    /// Override the grace period, e.g. from lobby settings.
    pub fn set_grace_period(&mut self, secs: f64) {
        self.grace_period_secs = secs;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop the loop at its next tick boundary.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn spawn_car(&self) -> CarState {
        CarState::at(
            self.track.start_position,
            self.track.start_heading,
            self.physics.settings().nitro_charges,
        )
    }

    pub fn add_player(&mut self, id: &str) -> Option<&PlayerState> {
        if self.players.len() >= self.max_players {
            return None;
        }
        let player = PlayerState::new(id.to_string(), self.spawn_car(), false);
        info!(player_id = id, "player added to session");
        Some(self.players.entry(id.to_string()).or_insert(player))
    }

    pub fn add_bot_player(&mut self, id: &str, handle: BotHandle) -> bool {
        if self.players.len() >= self.max_players {
            return false;
        }
        let player = PlayerState::new(id.to_string(), self.spawn_car(), true);
        self.players.insert(id.to_string(), player);
        self.bots.insert(id.to_string(), handle);
        info!(player_id = id, "bot added to session");
        true
    }

    /// Load a stored bot program and seat it as a player.
    pub fn submit_bot(
        &mut self,
        id: &str,
        code: &str,
        class_name: &str,
    ) -> Result<(), crate::bot_manager::BotError> {
        let handle = self.bot_manager.load(code, class_name)?;
        if !self.add_bot_player(id, handle) {
            return Err(crate::bot_manager::BotError::Load(
                crate::sandbox::SandboxError::Validation("session is full".to_string()),
            ));
        }
        Ok(())
    }

    pub fn remove_player(&mut self, id: &str) {
        if self.players.remove(id).is_some() {
            info!(player_id = id, "player removed from session");
        }
        self.bots.remove(id);
    }

    pub fn update_input(&mut self, id: &str, input: PlayerInput) {
        if let Some(player) = self.players.get_mut(id) {
            if !player.is_finished {
                player.input = input;
            }
        }
    }

    /// Start (or restart) the race: reset every player to the grid and
    /// enter the countdown. Valid from Waiting or Finished.
    pub fn start_race(&mut self) -> bool {
        if !matches!(
            self.race_info.status,
            RaceStatus::Waiting | RaceStatus::Finished
        ) {
            return false;
        }

        let car = self.spawn_car();
        for player in self.players.values_mut() {
            player.car = car;
            player.prev_position = car.position;
            player.input = PlayerInput::default();
            player.current_checkpoint = 0;
            player.checkpoints_passed.clear();
            player.split_times.clear();
            player.is_finished = false;
            player.finish_time = None;
            player.is_off_track = false;
            player.position = None;
            player.points = 0;
            player.dnf = false;
            player.bot_error = None;
        }

        self.race_elapsed = 0.0;
        self.race_info = RaceInfo {
            status: RaceStatus::Countdown,
            countdown_remaining: self.countdown_secs,
            ..RaceInfo::default()
        };
        info!(players = self.players.len(), "race countdown started");
        true
    }

    /// Advance the simulation by one fixed step.
    pub fn step(&mut self) {
        self.tick += 1;
        self.update_race_status();

        if self.race_info.status == RaceStatus::Racing {
            self.race_elapsed += self.tick_interval;
            if self.bot_manager.should_run(self.tick) {
                self.run_bots();
            }
            self.update_physics();
            self.resolve_obstacle_collisions();
            self.resolve_boundary_collisions();
            self.resolve_car_collisions();
            self.check_checkpoints();
            self.check_finishers();
            self.recompute_positions();
        }
    }

    fn update_race_status(&mut self) {
        match self.race_info.status {
            RaceStatus::Countdown => {
                self.race_info.countdown_remaining -= self.tick_interval;
                if self.race_info.countdown_remaining <= 0.0 {
                    self.race_info.countdown_remaining = 0.0;
                    self.race_info.status = RaceStatus::Racing;
                    self.race_info.start_time = Some(now_unix_secs());
                    info!("race started");
                }
            }
            RaceStatus::Racing => {
                if self.race_info.first_finisher_time.is_some() {
                    self.race_info.grace_period_remaining -= self.tick_interval;
                    if self.race_info.grace_period_remaining <= 0.0 {
                        self.race_info.grace_period_remaining = 0.0;
                        self.expire_grace_period();
                    }
                }
            }
            RaceStatus::Waiting | RaceStatus::Finished => {}
        }
    }

    fn expire_grace_period(&mut self) {
        for player in self.players.values_mut() {
            if player.is_racing() {
                player.dnf = true;
                info!(player_id = %player.id, "player DNF: grace period expired");
            }
        }
        self.finalize_race();
    }

    fn finalize_race(&mut self) {
        self.race_info.status = RaceStatus::Finished;
        self.race_info.finish_time = Some(self.race_elapsed);
        self.recompute_positions();

        for player in self.players.values_mut() {
            player.points = match player.position {
                Some(position) => self
                    .points_by_position
                    .get(position - 1)
                    .copied()
                    .unwrap_or(0),
                None => 0,
            };
        }
        info!(elapsed = self.race_elapsed, "race finished");
    }

    /// Ask every live bot for its next input. A sandbox violation
    /// disqualifies only that bot.
    fn run_bots(&mut self) {
        let bot_ids: Vec<PlayerId> = self
            .bots
            .keys()
            .filter(|id| self.players.get(*id).map_or(false, |p| p.is_racing()))
            .cloned()
            .collect();

        for id in bot_ids {
            let view = self
                .bot_manager
                .build_game_state(&self.track, &self.players, &id, self.race_elapsed);

            let handle = self.bots.get_mut(&id).expect("bot handle present");
            match self.bot_manager.tick(handle, view) {
                Ok(input) => {
                    if let Some(player) = self.players.get_mut(&id) {
                        player.input = input;
                    }
                }
                Err(e) => {
                    warn!(player_id = %id, error = %e, "bot disqualified");
                    if let Some(player) = self.players.get_mut(&id) {
                        player.dnf = true;
                        player.bot_error = Some(e.to_string());
                        player.input = PlayerInput::default();
                    }
                    // No further hooks run on a disqualified bot.
                    self.bots.remove(&id);
                }
            }
        }
    }

    fn update_physics(&mut self) {
        let dt = self.tick_interval;
        let settings = self.physics.settings().clone();
        let off_track_multiplier = settings.off_track_grip_multiplier;

        for player in self.players.values_mut() {
            if player.is_finished {
                continue;
            }

            let surface = self.track.surface_at(player.car.position);
            let mut grip = grip_for(&settings, surface);

            player.is_off_track = !self.track.is_on_track(player.car.position);
            if player.is_off_track {
                grip *= off_track_multiplier;
            }

            player.prev_position = player.car.position;
            player.car = self.physics.simulate_step(
                player.car,
                player.input.accelerate,
                player.input.brake,
                player.input.turn_direction(),
                player.input.nitro,
                grip,
                dt,
            );
        }
    }

    fn resolve_obstacle_collisions(&mut self) {
        let car_radius = self.physics.settings().car_radius;
        let elasticity = self.physics.settings().collision_elasticity;
        let mut events: Vec<(PlayerId, f64, f64)> = Vec::new();

        for player in self.players.values_mut() {
            if player.is_finished {
                continue;
            }
            for obstacle in &self.track.obstacles {
                let delta = player.car.position - obstacle.position;
                let distance = delta.magnitude();
                let collision_distance = car_radius + obstacle.radius;
                if distance >= collision_distance {
                    continue;
                }

                let normal = if distance > 0.0 {
                    delta * (1.0 / distance)
                } else {
                    Vec2::new(1.0, 0.0)
                };

                let along_normal = player.car.velocity.dot(normal);
                if along_normal < 0.0 {
                    let bounce = normal * (-(1.0 + elasticity) * along_normal);
                    player.car.velocity = player.car.velocity + bounce;
                    let direction =
                        normalize_angle(normal.y.atan2(normal.x) - player.car.heading);
                    events.push((player.id.clone(), along_normal.abs(), direction));
                }

                // Always push out of penetration.
                let penetration = collision_distance - distance;
                player.car.position = player.car.position + normal * penetration;
            }
        }

        for (id, impact, direction) in events {
            self.notify_collision(&id, CollisionKind::Obstacle, impact, direction);
        }
    }

    fn resolve_boundary_collisions(&mut self) {
        let Some(containment) = self.track.containment.clone() else {
            return;
        };
        let car_radius = self.physics.settings().car_radius;
        let elasticity = self.physics.settings().collision_elasticity;
        let mut events: Vec<(PlayerId, f64, f64)> = Vec::new();

        for player in self.players.values_mut() {
            if player.is_finished {
                continue;
            }
            for (p1, p2) in containment.wall_segments() {
                let closest = closest_point_on_segment(player.car.position, p1, p2);
                let delta = player.car.position - closest;
                let distance = delta.magnitude();
                if distance >= car_radius {
                    continue;
                }

                let normal = if distance > 0.0 {
                    delta * (1.0 / distance)
                } else {
                    Vec2::new(1.0, 0.0)
                };

                let along_normal = player.car.velocity.dot(normal);
                if along_normal < 0.0 {
                    let bounce = normal * (-(1.0 + elasticity) * along_normal);
                    player.car.velocity = player.car.velocity + bounce;
                    let direction =
                        normalize_angle(normal.y.atan2(normal.x) - player.car.heading);
                    events.push((player.id.clone(), along_normal.abs(), direction));
                }

                let penetration = car_radius - distance;
                player.car.position = player.car.position + normal * penetration;
            }
        }

        for (id, impact, direction) in events {
            self.notify_collision(&id, CollisionKind::Boundary, impact, direction);
        }
    }

    fn resolve_car_collisions(&mut self) {
        let car_radius = self.physics.settings().car_radius;
        let elasticity = self.physics.settings().collision_elasticity;
        let min_speed = self.physics.settings().collision_min_speed;

        let ids: Vec<PlayerId> = self
            .players
            .values()
            .filter(|p| p.is_racing())
            .map(|p| p.id.clone())
            .collect();

        let mut events: Vec<(PlayerId, f64, f64)> = Vec::new();

        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = (&ids[i], &ids[j]);
                let (pos_a, vel_a, mass_a, heading_a) = {
                    let p = &self.players[a];
                    (p.car.position, p.car.velocity, p.weight, p.car.heading)
                };
                let (pos_b, vel_b, mass_b, heading_b) = {
                    let p = &self.players[b];
                    (p.car.position, p.car.velocity, p.weight, p.car.heading)
                };

                let delta = pos_b - pos_a;
                let distance = delta.magnitude();
                if distance >= 2.0 * car_radius {
                    continue;
                }

                let normal = if distance > 0.0 {
                    delta * (1.0 / distance)
                } else {
                    Vec2::new(1.0, 0.0)
                };

                let rel_vel = vel_b - vel_a;
                let vel_along_normal = rel_vel.dot(normal);

                // Impulse only on a real closing impact.
                if -vel_along_normal > min_speed {
                    let impulse = -(1.0 + elasticity) * vel_along_normal
                        / (1.0 / mass_a + 1.0 / mass_b);
                    let new_vel_a = vel_a + normal * (-impulse / mass_a);
                    let new_vel_b = vel_b + normal * (impulse / mass_b);
                    self.players.get_mut(a).unwrap().car.velocity = new_vel_a;
                    self.players.get_mut(b).unwrap().car.velocity = new_vel_b;

                    let impact = vel_along_normal.abs();
                    events.push((
                        a.clone(),
                        impact,
                        normalize_angle(normal.y.atan2(normal.x) - heading_a),
                    ));
                    events.push((
                        b.clone(),
                        impact,
                        normalize_angle((-normal.y).atan2(-normal.x) - heading_b),
                    ));
                }

                // Always separate, displacements inversely proportional to
                // mass.
                let overlap = 2.0 * car_radius - distance;
                let total_inv = 1.0 / mass_a + 1.0 / mass_b;
                let push_a = overlap * (1.0 / mass_a) / total_inv;
                let push_b = overlap * (1.0 / mass_b) / total_inv;
                self.players.get_mut(a).unwrap().car.position = pos_a + normal * -push_a;
                self.players.get_mut(b).unwrap().car.position = pos_b + normal * push_b;
            }
        }

        for (id, impact, direction) in events {
            self.notify_collision(&id, CollisionKind::Car, impact, direction);
        }
    }

    fn notify_collision(&mut self, id: &str, kind: CollisionKind, impact: f64, direction: f64) {
        if let Some(handle) = self.bots.get_mut(id) {
            self.bot_manager.on_collision(handle, kind, impact, direction);
        }
    }

    fn check_checkpoints(&mut self) {
        let mut events: Vec<(PlayerId, usize, f64)> = Vec::new();

        for player in self.players.values_mut() {
            if !player.is_racing() {
                continue;
            }
            if player.current_checkpoint >= self.track.checkpoints.len() {
                continue;
            }

            let checkpoint = &self.track.checkpoints[player.current_checkpoint];
            let (gate_a, gate_b) = checkpoint.line();

            if !segments_intersect(player.prev_position, player.car.position, gate_a, gate_b) {
                continue;
            }

            // Reject reverse crossings.
            let movement = player.car.position - player.prev_position;
            let tangent = Vec2::new(checkpoint.angle.cos(), checkpoint.angle.sin());
            if movement.dot(tangent) <= 0.0 {
                continue;
            }

            let index = player.current_checkpoint;
            player.checkpoints_passed.insert(index);
            player.current_checkpoint += 1;
            player.split_times.push(self.race_elapsed);
            debug!(player_id = %player.id, checkpoint = index, "checkpoint passed");
            events.push((player.id.clone(), index, self.race_elapsed));
        }

        for (id, index, split) in events {
            if let Some(handle) = self.bots.get_mut(&id) {
                self.bot_manager.on_checkpoint(handle, index, split);
            }
        }
    }

    fn check_finishers(&mut self) {
        let total_checkpoints = self.track.checkpoints.len();
        let mut events: Vec<(PlayerId, f64, usize)> = Vec::new();

        let mut finished_count = self.players.values().filter(|p| p.is_finished).count();

        for player in self.players.values_mut() {
            if !player.is_racing() || player.current_checkpoint < total_checkpoints {
                continue;
            }

            player.is_finished = true;
            player.finish_time = Some(self.race_elapsed);
            finished_count += 1;
            info!(player_id = %player.id, time = self.race_elapsed, "player finished");

            if self.race_info.first_finisher_time.is_none() {
                self.race_info.first_finisher_time = Some(self.race_elapsed);
                self.race_info.grace_period_remaining = self.grace_period_secs;
            }

            // Tentative position; finalized by the ranking step.
            events.push((player.id.clone(), self.race_elapsed, finished_count));
        }

        for (id, time, position) in events {
            if let Some(handle) = self.bots.get_mut(&id) {
                self.bot_manager.on_finish(handle, time, position);
            }
        }

        let all_done = self.players.values().all(|p| p.is_finished || p.dnf);
        if all_done && !self.players.is_empty() && self.race_info.status == RaceStatus::Racing {
            self.finalize_race();
        }
    }

    /// Continuous progress metric for a still-racing player: higher is
    /// better.
    fn progress_metric(&self, player: &PlayerState) -> f64 {
        let distance_to_next = if player.current_checkpoint < self.track.checkpoints.len() {
            let next = &self.track.checkpoints[player.current_checkpoint];
            player.car.position.distance_to(next.position)
        } else {
            0.0
        };
        PROGRESS_CHECKPOINT_WEIGHT * player.current_checkpoint as f64 - distance_to_next
    }

    fn recompute_positions(&mut self) {
        let mut finished: Vec<(PlayerId, f64)> = self
            .players
            .values()
            .filter(|p| p.is_finished)
            .map(|p| (p.id.clone(), p.finish_time.unwrap_or(f64::MAX)))
            .collect();
        finished.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut racing: Vec<(PlayerId, f64)> = self
            .players
            .values()
            .filter(|p| p.is_racing())
            .map(|p| (p.id.clone(), self.progress_metric(p)))
            .collect();
        racing.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut rank = 1;
        for (id, _) in finished.into_iter().chain(racing.into_iter()) {
            if let Some(player) = self.players.get_mut(&id) {
                player.position = Some(rank);
            }
            rank += 1;
        }

        for player in self.players.values_mut() {
            if player.dnf {
                player.position = None;
            }
        }
    }

    pub fn snapshot(&self) -> GameStateSnapshot {
        GameStateSnapshot::from_session(self)
    }
}

fn grip_for(settings: &crate::config::PhysicsSettings, surface: SurfaceKind) -> f64 {
    match surface {
        SurfaceKind::Asphalt => settings.grip_asphalt,
        SurfaceKind::Wet => settings.grip_wet,
        SurfaceKind::Gravel => settings.grip_gravel,
        SurfaceKind::Ice => settings.grip_ice,
    }
}

fn closest_point_on_segment(point: Vec2, a: Vec2, b: Vec2) -> Vec2 {
    let ab = b - a;
    let len_sq = ab.dot(ab);
    if len_sq == 0.0 {
        return a;
    }
    let t = ((point - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

fn ccw(a: Vec2, b: Vec2, c: Vec2) -> bool {
    (c.y - a.y) * (b.x - a.x) > (b.y - a.y) * (c.x - a.x)
}

/// Segment-segment intersection via orientation tests.
fn segments_intersect(p1: Vec2, p2: Vec2, p3: Vec2, p4: Vec2) -> bool {
    ccw(p1, p3, p4) != ccw(p2, p3, p4) && ccw(p1, p2, p3) != ccw(p1, p2, p4)
}

/// Drive a session at the fixed tick rate until it is closed.
pub async fn run_session_loop(session: Arc<Mutex<GameSession>>, tick_rate: u32) {
    let mut ticker = interval(Duration::from_micros(1_000_000 / tick_rate.max(1) as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let mut session = session.lock().await;
        if session.is_closed() {
            debug!("session loop stopping");
            break;
        }
        session.step();
    }
}
