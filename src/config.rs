use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub game: GameSettings,
    pub physics: PhysicsSettings,
    pub bot: BotSettings,
    pub race: RaceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind: String,
    /// Seconds between heartbeat pings on each connection.
    pub ping_interval_secs: f64,
    /// Extra seconds after a ping before a missing pong closes the connection.
    pub pong_timeout_secs: f64,
    /// Snapshot broadcast rate per session (Hz).
    pub broadcast_rate_hz: u32,
    /// Lobbies older than this are swept (seconds).
    pub lobby_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSettings {
    /// Physics ticks per second.
    pub tick_rate: u32,
    /// Bot on_tick rate (Hz). Must divide tick_rate evenly.
    pub bot_tick_rate: u32,
    pub countdown_secs: f64,
    /// Seconds after the first finisher before remaining racers are DNF'd.
    pub finish_grace_period_secs: f64,
    pub max_players: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsSettings {
    pub max_speed: f64,
    pub acceleration: f64,
    pub brake_force: f64,
    pub drag_coefficient: f64,

    pub turn_rate: f64,
    pub min_turn_speed: f64,

    pub grip_asphalt: f64,
    pub grip_wet: f64,
    pub grip_gravel: f64,
    pub grip_ice: f64,
    pub drift_threshold: f64,
    pub drift_recovery_rate: f64,

    pub off_track_grip_multiplier: f64,

    pub collision_elasticity: f64,
    /// Minimum closing speed for a car-car impulse to apply.
    pub collision_min_speed: f64,
    pub car_radius: f64,

    pub nitro_charges: u32,
    pub nitro_duration_ticks: u32,
    pub nitro_speed_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSettings {
    pub execution_timeout_ms: u64,
    pub memory_limit_mb: usize,
    pub max_code_size_kb: usize,
    pub raycast_max_range: f64,
    pub opponent_visibility_radius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceSettings {
    /// Points awarded by final position; positions past the end score zero.
    pub points_by_position: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind: "127.0.0.1:8000".to_string(),
                ping_interval_secs: 30.0,
                pong_timeout_secs: 5.0,
                broadcast_rate_hz: 60,
                lobby_max_age_secs: 3600,
            },
            game: GameSettings {
                tick_rate: 60,
                bot_tick_rate: 20,
                countdown_secs: 3.0,
                finish_grace_period_secs: 30.0,
                max_players: 8,
            },
            physics: PhysicsSettings {
                max_speed: 150.0,
                acceleration: 80.0,
                brake_force: 120.0,
                drag_coefficient: 0.02,
                turn_rate: 3.0,
                min_turn_speed: 5.0,
                grip_asphalt: 1.0,
                grip_wet: 0.7,
                grip_gravel: 0.5,
                grip_ice: 0.25,
                drift_threshold: 0.6,
                drift_recovery_rate: 2.0,
                off_track_grip_multiplier: 0.3,
                collision_elasticity: 0.7,
                collision_min_speed: 10.0,
                car_radius: 10.0,
                nitro_charges: 2,
                nitro_duration_ticks: 120,
                nitro_speed_multiplier: 1.5,
            },
            bot: BotSettings {
                execution_timeout_ms: 10,
                memory_limit_mb: 50,
                max_code_size_kb: 100,
                raycast_max_range: 200.0,
                opponent_visibility_radius: 300.0,
            },
            race: RaceSettings {
                points_by_position: vec![25, 18, 15, 12, 10, 8, 6, 4],
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {}, using defaults", e);
            Self::default()
        })
    }

    /// Physics ticks between bot on_tick invocations.
    pub fn bot_tick_interval(&self) -> u64 {
        (self.game.tick_rate / self.game.bot_tick_rate.max(1)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.game.tick_rate, 60);
        assert_eq!(config.game.bot_tick_rate, 20);
        assert_eq!(config.bot_tick_interval(), 3);
        assert_eq!(config.race.points_by_position[0], 25);
    }

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("tick_rate"));
        assert!(toml_str.contains("max_speed"));

        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.physics.max_speed, config.physics.max_speed);
    }
}
