//! Lobby data model: settings, members, the status machine and the
//! shareable join codes.

use crate::data::PlayerId;
use crate::track::Track;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LobbyStatus {
    Waiting,
    Starting,
    Racing,
    Finished,
    Disbanded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySettings {
    pub difficulty: String,
    pub seed: Option<u64>,
    pub max_players: usize,
    /// Seconds after the first finisher before the rest are DNF'd.
    pub grace_period_secs: f64,
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self {
            difficulty: "medium".to_string(),
            seed: None,
            max_players: 8,
            grace_period_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyMember {
    pub player_id: PlayerId,
    pub username: Option<String>,
    pub is_bot: bool,
    /// Store id of the bot program, when this member is a bot.
    pub bot_ref: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct Lobby {
    pub lobby_id: String,
    pub join_code: String,
    pub name: String,
    pub host_player_id: PlayerId,
    pub settings: LobbySettings,
    /// Ordered by insertion, so host transfer picks the longest-standing
    /// member.
    pub members: BTreeMap<u64, LobbyMember>,
    pub status: LobbyStatus,
    pub created_at: f64,
    pub game_session_id: Option<String>,
    pub track: Option<Arc<Track>>,
    member_seq: u64,
}

impl Lobby {
    pub fn new(
        lobby_id: String,
        join_code: String,
        name: String,
        host_player_id: PlayerId,
        settings: LobbySettings,
    ) -> Self {
        let mut lobby = Self {
            lobby_id,
            join_code,
            name,
            host_player_id: host_player_id.clone(),
            settings,
            members: BTreeMap::new(),
            status: LobbyStatus::Waiting,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            game_session_id: None,
            track: None,
            member_seq: 0,
        };
        // The host joins their own lobby, auto-ready.
        lobby.insert_member(LobbyMember {
            player_id: host_player_id,
            username: None,
            is_bot: false,
            bot_ref: None,
            ready: true,
        });
        lobby
    }

    pub fn insert_member(&mut self, member: LobbyMember) {
        self.members.insert(self.member_seq, member);
        self.member_seq += 1;
    }

    pub fn member(&self, player_id: &str) -> Option<&LobbyMember> {
        self.members.values().find(|m| m.player_id == player_id)
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.member(player_id).is_some()
    }

    pub fn remove_member(&mut self, player_id: &str) -> bool {
        let key = self
            .members
            .iter()
            .find(|(_, m)| m.player_id == player_id)
            .map(|(k, _)| *k);
        match key {
            Some(key) => {
                self.members.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_host(&self, player_id: &str) -> bool {
        self.host_player_id == player_id
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.settings.max_players
    }

    pub fn can_start_race(&self) -> bool {
        self.status == LobbyStatus::Waiting
            && !self.members.is_empty()
            && self.contains(&self.host_player_id)
    }

    /// Promote the longest-standing remaining member to host.
    pub fn transfer_host(&mut self) {
        if let Some(member) = self.members.values().next() {
            self.host_player_id = member.player_id.clone();
        }
    }
}

const ADJECTIVES: [&str; 20] = [
    "FAST", "QUICK", "SWIFT", "RAPID", "TURBO", "BLUE", "RED", "GREEN", "GOLD", "SILVER", "WILD",
    "MEGA", "SUPER", "ULTRA", "HYPER", "BOLD", "BRAVE", "EPIC", "COOL", "SLICK",
];

const NOUNS: [&str; 20] = [
    "TIGER", "LION", "EAGLE", "SHARK", "WOLF", "DRAGON", "FALCON", "VIPER", "RACER", "RALLY",
    "STORM", "BLAZE", "THUNDER", "LIGHTNING", "COMET", "ROCKET", "TURBO", "NITRO", "SPEED",
    "DRIFT",
];

/// Memorable `ADJECTIVE-NOUN-NN` join code.
pub fn generate_join_code() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let number: u32 = rng.random_range(10..100);
    format!("{adjective}-{noun}-{number}")
}

pub fn is_valid_join_code(code: &str) -> bool {
    let upper = code.to_ascii_uppercase();
    let parts: Vec<&str> = upper.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    if !ADJECTIVES.contains(&parts[0]) || !NOUNS.contains(&parts[1]) {
        return false;
    }
    matches!(parts[2].parse::<u32>(), Ok(n) if (10..100).contains(&n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby() -> Lobby {
        Lobby::new(
            "l1".to_string(),
            "FAST-TIGER-42".to_string(),
            "Friday Night".to_string(),
            "host".to_string(),
            LobbySettings::default(),
        )
    }

    #[test]
    fn test_host_auto_joined_and_ready() {
        let lobby = lobby();
        assert_eq!(lobby.member_count(), 1);
        assert!(lobby.member("host").unwrap().ready);
        assert!(lobby.is_host("host"));
    }

    #[test]
    fn test_member_order_preserved() {
        let mut lobby = lobby();
        for id in ["a", "b", "c"] {
            lobby.insert_member(LobbyMember {
                player_id: id.to_string(),
                username: None,
                is_bot: false,
                bot_ref: None,
                ready: false,
            });
        }
        let ids: Vec<_> = lobby.members.values().map(|m| m.player_id.clone()).collect();
        assert_eq!(ids, vec!["host", "a", "b", "c"]);

        lobby.remove_member("host");
        lobby.transfer_host();
        assert_eq!(lobby.host_player_id, "a");
    }

    #[test]
    fn test_full_lobby() {
        let mut lobby = lobby();
        lobby.settings.max_players = 2;
        lobby.insert_member(LobbyMember {
            player_id: "a".to_string(),
            username: None,
            is_bot: false,
            bot_ref: None,
            ready: false,
        });
        assert!(lobby.is_full());
    }

    #[test]
    fn test_can_start_requires_waiting_and_host() {
        let mut lobby = lobby();
        assert!(lobby.can_start_race());
        lobby.status = LobbyStatus::Racing;
        assert!(!lobby.can_start_race());
    }

    #[test]
    fn test_join_code_format() {
        for _ in 0..50 {
            let code = generate_join_code();
            assert!(is_valid_join_code(&code), "{code}");
        }
        assert!(is_valid_join_code("fast-tiger-42"));
        assert!(!is_valid_join_code("FAST-TIGER"));
        assert!(!is_valid_join_code("FAST-TIGER-9"));
        assert!(!is_valid_join_code("LOBBY-ABCDEF12"));
    }
}
