//! Car physics for the racing simulation.
//!
//! Implements the 2D top-down vehicle model: forward acceleration with a
//! speed clamp, braking that never reverses, speed-scaled turning,
//! grip/drift on the lateral velocity component, speed-proportional drag,
//! nitro boost, and position integration. All step functions are pure:
//! they take a state, inputs and a `dt` and return the new state.

use crate::config::PhysicsSettings;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Speed below which a car is snapped to a full stop by drag.
const STOP_SPEED_THRESHOLD: f64 = 0.1;

/// 2D vector used for positions, velocities and directions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn magnitude(self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Unit vector in the same direction; the zero vector normalizes to zero.
    pub fn normalize(self) -> Vec2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vec2::ZERO
        } else {
            Vec2::new(self.x / mag, self.y / mag)
        }
    }

    pub fn dot(self, other: Vec2) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn rotate(self, angle: f64) -> Vec2 {
        let (sin_a, cos_a) = angle.sin_cos();
        Vec2::new(
            self.x * cos_a - self.y * sin_a,
            self.x * sin_a + self.y * cos_a,
        )
    }

    pub fn distance_to(self, other: Vec2) -> f64 {
        (other - self).magnitude()
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f64> for Vec2 {
    type Output = Vec2;
    fn mul(self, scalar: f64) -> Vec2 {
        Vec2::new(self.x * scalar, self.y * scalar)
    }
}

/// Normalize an angle into `(-PI, PI]`.
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// Physical state of one car.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CarState {
    pub position: Vec2,
    pub velocity: Vec2,
    /// Direction the car is facing, radians, 0 = +x, normalized to (-PI, PI].
    pub heading: f64,
    pub angular_velocity: f64,
    pub is_drifting: bool,
    /// Angle between heading and velocity direction (radians).
    pub drift_angle: f64,
    pub nitro_charges: u32,
    pub nitro_active: bool,
    pub nitro_remaining_ticks: u32,
}

impl CarState {
    pub fn at(position: Vec2, heading: f64, nitro_charges: u32) -> Self {
        Self {
            position,
            velocity: Vec2::ZERO,
            heading,
            angular_velocity: 0.0,
            is_drifting: false,
            drift_angle: 0.0,
            nitro_charges,
            nitro_active: false,
            nitro_remaining_ticks: 0,
        }
    }

    pub fn speed(&self) -> f64 {
        self.velocity.magnitude()
    }

    /// Unit vector in the direction the car is facing.
    pub fn heading_vector(&self) -> Vec2 {
        Vec2::new(self.heading.cos(), self.heading.sin())
    }

    /// Unit vector perpendicular to heading (right-hand side of the car).
    pub fn lateral_vector(&self) -> Vec2 {
        Vec2::new(self.heading.sin(), -self.heading.cos())
    }
}

/// Pure car physics stepper parameterized by the tunable settings.
#[derive(Debug, Clone)]
pub struct CarPhysics {
    settings: PhysicsSettings,
}

impl CarPhysics {
    pub fn new(settings: PhysicsSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PhysicsSettings {
        &self.settings
    }

    /// Current speed cap, raised while nitro is burning.
    fn speed_limit(&self, state: &CarState) -> f64 {
        if state.nitro_active {
            self.settings.max_speed * self.settings.nitro_speed_multiplier
        } else {
            self.settings.max_speed
        }
    }

    pub fn apply_acceleration(&self, state: CarState, dt: f64) -> CarState {
        let mut new = state;
        new.velocity = state.velocity + state.heading_vector() * (self.settings.acceleration * dt);

        let limit = self.speed_limit(&state);
        if new.velocity.magnitude() > limit {
            new.velocity = new.velocity.normalize() * limit;
        }
        new
    }

    pub fn apply_braking(&self, state: CarState, dt: f64) -> CarState {
        if state.velocity.magnitude() == 0.0 {
            return state;
        }

        let mut new = state;
        let brake = state.velocity.normalize() * (-self.settings.brake_force * dt);
        new.velocity = state.velocity + brake;

        // Braking stops the car, it never reverses it.
        if state.velocity.dot(new.velocity) < 0.0 {
            new.velocity = Vec2::ZERO;
        }
        new
    }

    /// `turn_direction`: -1 left, +1 right, 0 straight.
    pub fn apply_turning(&self, state: CarState, turn_direction: f64, dt: f64) -> CarState {
        let speed = state.speed();

        // Turning loses authority at low speed.
        let speed_factor = if speed < self.settings.min_turn_speed {
            speed / self.settings.min_turn_speed
        } else {
            1.0
        };

        let turn_rate = self.settings.turn_rate * turn_direction * speed_factor;

        let mut new = state;
        new.heading = normalize_angle(state.heading + turn_rate * dt);
        new.angular_velocity = turn_rate;
        new
    }

    /// Whether the car exceeds the lateral grip budget, and the slip angle.
    pub fn drift_state(&self, state: &CarState, grip: f64) -> (bool, f64) {
        if state.speed() < self.settings.min_turn_speed {
            return (false, 0.0);
        }

        let forward = state.velocity.dot(state.heading_vector());
        let lateral = state.velocity.dot(state.lateral_vector());

        let drift_angle = if forward.abs() > 0.1 {
            lateral.atan2(forward)
        } else {
            0.0
        };

        let max_lateral = grip * self.settings.drift_threshold * state.speed();
        (lateral.abs() > max_lateral, drift_angle)
    }

    /// Pull the lateral velocity component toward zero. Reduced while
    /// drifting so the car slides instead of snapping back on line.
    pub fn apply_grip(&self, state: CarState, grip: f64, dt: f64) -> CarState {
        if state.speed() < STOP_SPEED_THRESHOLD {
            return state;
        }

        let (is_drifting, drift_angle) = self.drift_state(&state, grip);

        let heading_vec = state.heading_vector();
        let lateral_vec = state.lateral_vector();
        let forward = state.velocity.dot(heading_vec);
        let lateral = state.velocity.dot(lateral_vec);

        let grip_strength = if is_drifting { grip * 0.3 } else { grip };
        let correction = -lateral * grip_strength * self.settings.drift_recovery_rate * dt;
        let new_lateral = lateral + correction;

        let mut new = state;
        new.velocity = heading_vec * forward + lateral_vec * new_lateral;
        new.is_drifting = is_drifting;
        new.drift_angle = drift_angle;
        new
    }

    pub fn apply_drag(&self, state: CarState, dt: f64) -> CarState {
        let speed = state.speed();

        let mut new = state;
        if speed < STOP_SPEED_THRESHOLD {
            new.velocity = Vec2::ZERO;
            return new;
        }

        // Drag grows with speed and acts against the velocity direction.
        let drag_magnitude = self.settings.drag_coefficient * speed * dt;
        new.velocity = state.velocity + state.velocity.normalize() * -drag_magnitude;

        if state.velocity.dot(new.velocity) < 0.0 {
            new.velocity = Vec2::ZERO;
        }
        new
    }

    /// Consume a charge on request, burn down the remaining ticks, and
    /// deactivate when the boost runs out.
    pub fn update_nitro(&self, state: CarState, nitro_requested: bool) -> CarState {
        let mut new = state;

        if nitro_requested && new.nitro_charges > 0 && !new.nitro_active {
            new.nitro_charges -= 1;
            new.nitro_active = true;
            new.nitro_remaining_ticks = self.settings.nitro_duration_ticks;
        }

        if new.nitro_active {
            new.nitro_remaining_ticks = new.nitro_remaining_ticks.saturating_sub(1);
            if new.nitro_remaining_ticks == 0 {
                new.nitro_active = false;
            }
        }
        new
    }

    pub fn update_position(&self, state: CarState, dt: f64) -> CarState {
        let mut new = state;
        new.position = state.position + state.velocity * dt;
        new
    }

    /// One full physics step for a car with the given inputs.
    pub fn simulate_step(
        &self,
        state: CarState,
        accelerating: bool,
        braking: bool,
        turn_direction: f64,
        nitro_requested: bool,
        grip: f64,
        dt: f64,
    ) -> CarState {
        let mut new = state;

        if accelerating {
            new = self.apply_acceleration(new, dt);
        }
        if braking {
            new = self.apply_braking(new, dt);
        }
        if turn_direction != 0.0 {
            new = self.apply_turning(new, turn_direction, dt);
        }

        new = self.apply_grip(new, grip, dt);
        new = self.apply_drag(new, dt);
        new = self.update_nitro(new, nitro_requested);
        new = self.update_position(new, dt);

        new
    }
}
