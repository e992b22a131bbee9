//! Data types crossing the host/bot boundary.
//!
//! `BotGameState` is the read-only sensor view assembled per bot call; the
//! sandbox exposes it to guest code through host functions, so bots can
//! only ever observe what is in here. `BotActions` is the decoded result
//! of a bot's `on_tick`.

use crate::physics::Vec2;
use crate::raycast::HitKind;
use crate::track::SurfaceKind;

/// The bot's own car, as the bot sees it.
#[derive(Debug, Clone, Default)]
pub struct BotCarState {
    pub position: Vec2,
    pub heading: f64,
    pub speed: f64,
    pub velocity: Vec2,
    pub angular_velocity: f64,
    pub nitro_charges: u32,
    pub nitro_active: bool,
    pub current_surface: SurfaceKind,
    pub off_track: bool,
}

/// One vision ray.
#[derive(Debug, Clone, Copy, Default)]
pub struct BotRay {
    pub distance: f64,
    pub hit_kind: Option<HitKind>,
}

/// Track information exposed to bots. The boundary-distance and
/// upcoming-turn fields are reserved; they currently carry conservative
/// constants.
#[derive(Debug, Clone, Default)]
pub struct BotTrackState {
    pub checkpoints: Vec<Vec2>,
    pub next_checkpoint: usize,
    pub distance_to_boundary_left: f64,
    pub distance_to_boundary_right: f64,
    pub upcoming_turn_sharpness: f64,
}

/// An opponent within the visibility radius. Exposes nothing beyond pose
/// and motion.
#[derive(Debug, Clone, Copy)]
pub struct BotOpponent {
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f64,
    pub distance: f64,
    /// Bearing relative to the observer's heading, normalized to (-PI, PI].
    pub relative_angle: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BotRaceState {
    pub current_checkpoint: usize,
    pub total_checkpoints: usize,
    pub position: usize,
    pub total_cars: usize,
    pub elapsed_time: f64,
    pub distance_to_finish: f64,
}

/// Complete sensor view for one bot call.
#[derive(Debug, Clone, Default)]
pub struct BotGameState {
    pub car: BotCarState,
    pub rays: Vec<BotRay>,
    pub track: BotTrackState,
    pub opponents: Vec<BotOpponent>,
    pub race: BotRaceState,
}

/// Actions a bot may take each tick, decoded from the guest's bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BotActions {
    pub accelerate: bool,
    pub brake: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub nitro: bool,
}

impl BotActions {
    pub const ACCELERATE: i32 = 1;
    pub const BRAKE: i32 = 1 << 1;
    pub const TURN_LEFT: i32 = 1 << 2;
    pub const TURN_RIGHT: i32 = 1 << 3;
    pub const NITRO: i32 = 1 << 4;

    pub fn from_bits(bits: i32) -> Self {
        Self {
            accelerate: bits & Self::ACCELERATE != 0,
            brake: bits & Self::BRAKE != 0,
            turn_left: bits & Self::TURN_LEFT != 0,
            turn_right: bits & Self::TURN_RIGHT != 0,
            nitro: bits & Self::NITRO != 0,
        }
    }

    pub fn to_bits(self) -> i32 {
        let mut bits = 0;
        if self.accelerate {
            bits |= Self::ACCELERATE;
        }
        if self.brake {
            bits |= Self::BRAKE;
        }
        if self.turn_left {
            bits |= Self::TURN_LEFT;
        }
        if self.turn_right {
            bits |= Self::TURN_RIGHT;
        }
        if self.nitro {
            bits |= Self::NITRO;
        }
        bits
    }
}

/// What a bot collided with, as delivered to `on_collision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    Car,
    Boundary,
    Obstacle,
}

impl CollisionKind {
    pub fn code(self) -> i32 {
        match self {
            CollisionKind::Car => 0,
            CollisionKind::Boundary => 1,
            CollisionKind::Obstacle => 2,
        }
    }
}

/// Integer codes for surfaces crossing the sandbox boundary.
pub fn surface_code(surface: SurfaceKind) -> i32 {
    match surface {
        SurfaceKind::Asphalt => 0,
        SurfaceKind::Wet => 1,
        SurfaceKind::Gravel => 2,
        SurfaceKind::Ice => 3,
    }
}

/// Integer codes for ray hits crossing the sandbox boundary.
pub fn hit_code(hit: Option<HitKind>) -> i32 {
    match hit {
        None => 0,
        Some(HitKind::Boundary) => 1,
        Some(HitKind::Obstacle) => 2,
        Some(HitKind::Car) => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_bitmask_round_trip() {
        let actions = BotActions {
            accelerate: true,
            brake: false,
            turn_left: true,
            turn_right: false,
            nitro: true,
        };
        assert_eq!(BotActions::from_bits(actions.to_bits()), actions);
    }

    #[test]
    fn test_all_bits() {
        let all = BotActions::from_bits(0b11111);
        assert!(all.accelerate && all.brake && all.turn_left && all.turn_right && all.nitro);
        assert_eq!(BotActions::from_bits(0), BotActions::default());
    }

    #[test]
    fn test_unknown_bits_ignored() {
        let actions = BotActions::from_bits(0b100000 | BotActions::BRAKE);
        assert!(actions.brake);
        assert!(!actions.accelerate);
    }
}
