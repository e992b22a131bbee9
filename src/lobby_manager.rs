//! Process-wide lobby registry.
//!
//! Owns every active lobby, the join-code index, and the lobby status
//! transitions. All mutating operations are serialized through the inner
//! lock; violations of an operation's preconditions return failure, never
//! panic. Injected at startup alongside the session registry.

use crate::data::PlayerId;
use crate::lobby::{generate_join_code, Lobby, LobbyMember, LobbySettings, LobbyStatus};
use crate::track::{Difficulty, Track, TrackFactory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JOIN_CODE_ATTEMPTS: usize = 10;

#[derive(Default)]
struct Inner {
    lobbies: HashMap<String, Lobby>,
    /// join_code -> lobby_id.
    join_codes: HashMap<String, String>,
}

pub struct LobbyManager {
    inner: RwLock<Inner>,
    track_factory: Arc<dyn TrackFactory>,
}

impl LobbyManager {
    pub fn new(track_factory: Arc<dyn TrackFactory>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            track_factory,
        }
    }

    pub async fn create_lobby(
        &self,
        name: &str,
        host_player_id: &str,
        settings: Option<LobbySettings>,
    ) -> Lobby {
        let mut inner = self.inner.write().await;
        let lobby_id = Uuid::new_v4().to_string();

        let mut join_code = None;
        for _ in 0..JOIN_CODE_ATTEMPTS {
            let code = generate_join_code();
            if !inner.join_codes.contains_key(&code) {
                join_code = Some(code);
                break;
            }
        }
        let join_code = join_code.unwrap_or_else(|| {
            format!("LOBBY-{}", lobby_id[..8].to_ascii_uppercase())
        });

        let lobby = Lobby::new(
            lobby_id.clone(),
            join_code.clone(),
            name.to_string(),
            host_player_id.to_string(),
            settings.unwrap_or_default(),
        );

        inner.join_codes.insert(join_code.clone(), lobby_id.clone());
        inner.lobbies.insert(lobby_id.clone(), lobby.clone());
        info!(%lobby_id, %join_code, name, host = host_player_id, "lobby created");
        lobby
    }

    pub async fn get_lobby(&self, lobby_id: &str) -> Option<Lobby> {
        self.inner.read().await.lobbies.get(lobby_id).cloned()
    }

    pub async fn get_lobby_by_code(&self, join_code: &str) -> Option<Lobby> {
        let inner = self.inner.read().await;
        let lobby_id = inner.join_codes.get(&join_code.to_ascii_uppercase())?;
        inner.lobbies.get(lobby_id).cloned()
    }

    /// All lobbies, newest first, optionally filtered by status.
    pub async fn list_lobbies(&self, status_filter: Option<LobbyStatus>) -> Vec<Lobby> {
        let inner = self.inner.read().await;
        let mut lobbies: Vec<Lobby> = inner
            .lobbies
            .values()
            .filter(|l| status_filter.map_or(true, |s| l.status == s))
            .cloned()
            .collect();
        lobbies.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        lobbies
    }

    /// Idempotent for an already-present member.
    pub async fn join_lobby(
        &self,
        lobby_id: &str,
        player_id: &str,
        username: Option<String>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            warn!(lobby_id, player_id, "join rejected: no such lobby");
            return false;
        };

        if lobby.status != LobbyStatus::Waiting {
            warn!(lobby_id, player_id, status = ?lobby.status, "join rejected: not waiting");
            return false;
        }
        if lobby.contains(player_id) {
            debug!(lobby_id, player_id, "player already in lobby");
            return true;
        }
        if lobby.is_full() {
            warn!(lobby_id, player_id, "join rejected: lobby full");
            return false;
        }

        lobby.insert_member(LobbyMember {
            player_id: player_id.to_string(),
            username,
            is_bot: false,
            bot_ref: None,
            ready: false,
        });
        info!(
            lobby_id,
            player_id,
            members = lobby.member_count(),
            "player joined lobby"
        );
        true
    }

    /// Remove a member; transfers host or disbands as needed.
    pub async fn leave_lobby(&self, lobby_id: &str, player_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            return false;
        };
        if !lobby.remove_member(player_id) {
            return false;
        }
        info!(
            lobby_id,
            player_id,
            remaining = lobby.member_count(),
            "player left lobby"
        );

        if lobby.is_host(player_id) {
            if lobby.members.is_empty() {
                lobby.status = LobbyStatus::Disbanded;
                info!(lobby_id, "lobby empty, disbanding");
                Self::cleanup_locked(&mut inner, lobby_id);
            } else {
                lobby.transfer_host();
                info!(lobby_id, new_host = %lobby.host_player_id, "host transferred");
            }
        }
        true
    }

    /// Add a bot member; member id is `bot-{owner}-{bot_ref}`. Duplicates
    /// are rejected.
    pub async fn add_bot_to_lobby(
        &self,
        lobby_id: &str,
        bot_ref: &str,
        owner_username: &str,
    ) -> Option<PlayerId> {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            warn!(lobby_id, "cannot add bot: no such lobby");
            return None;
        };
        if lobby.status != LobbyStatus::Waiting || lobby.is_full() {
            warn!(lobby_id, status = ?lobby.status, "cannot add bot");
            return None;
        }

        let bot_player_id = format!("bot-{owner_username}-{bot_ref}");
        if lobby.contains(&bot_player_id) {
            debug!(lobby_id, %bot_player_id, "bot already in lobby");
            return None;
        }

        lobby.insert_member(LobbyMember {
            player_id: bot_player_id.clone(),
            username: Some(format!("{owner_username}'s bot")),
            is_bot: true,
            bot_ref: Some(bot_ref.to_string()),
            ready: true,
        });
        info!(lobby_id, %bot_player_id, "bot added to lobby");
        Some(bot_player_id)
    }

    /// Host-only, Waiting-only.
    pub async fn update_settings(
        &self,
        lobby_id: &str,
        player_id: &str,
        settings: LobbySettings,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            return false;
        };
        if !lobby.is_host(player_id) {
            warn!(lobby_id, player_id, "settings update rejected: not host");
            return false;
        }
        if lobby.status != LobbyStatus::Waiting {
            warn!(lobby_id, status = ?lobby.status, "settings update rejected");
            return false;
        }

        info!(
            lobby_id,
            difficulty = %settings.difficulty,
            seed = ?settings.seed,
            max_players = settings.max_players,
            "lobby settings updated"
        );
        lobby.settings = settings;
        true
    }

    /// Host-only. Builds the track and moves the lobby to Starting; the
    /// caller constructs the session and then calls
    /// [`transition_to_racing`](Self::transition_to_racing).
    pub async fn start_race(
        &self,
        lobby_id: &str,
        player_id: &str,
    ) -> Option<(String, Arc<Track>)> {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            warn!(lobby_id, "cannot start race: no such lobby");
            return None;
        };
        if !lobby.is_host(player_id) {
            warn!(lobby_id, player_id, "start rejected: not host");
            return None;
        }
        if !lobby.can_start_race() {
            warn!(
                lobby_id,
                status = ?lobby.status,
                members = lobby.member_count(),
                "start rejected"
            );
            return None;
        }

        let track = Arc::new(self.track_factory.build(
            Difficulty::parse(&lobby.settings.difficulty),
            lobby.settings.seed,
        ));
        lobby.track = Some(Arc::clone(&track));

        let game_session_id = Uuid::new_v4().to_string();
        lobby.game_session_id = Some(game_session_id.clone());
        lobby.status = LobbyStatus::Starting;

        info!(
            lobby_id,
            session_id = %game_session_id,
            members = lobby.member_count(),
            "race starting"
        );
        Some((game_session_id, track))
    }

    pub async fn transition_to_racing(&self, lobby_id: &str) -> bool {
        self.transition(lobby_id, LobbyStatus::Starting, LobbyStatus::Racing)
            .await
    }

    pub async fn finish_race(&self, lobby_id: &str) -> bool {
        self.transition(lobby_id, LobbyStatus::Racing, LobbyStatus::Finished)
            .await
    }

    async fn transition(&self, lobby_id: &str, from: LobbyStatus, to: LobbyStatus) -> bool {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            return false;
        };
        if lobby.status != from {
            return false;
        }
        lobby.status = to;
        info!(lobby_id, ?from, ?to, "lobby transition");
        true
    }

    /// Host-only, Finished -> Waiting. Clears the session binding and all
    /// human ready flags.
    pub async fn reset_lobby(&self, lobby_id: &str, player_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            return false;
        };
        if !lobby.is_host(player_id) || lobby.status != LobbyStatus::Finished {
            return false;
        }

        lobby.status = LobbyStatus::Waiting;
        lobby.game_session_id = None;
        lobby.track = None;
        for member in lobby.members.values_mut() {
            if !member.is_bot {
                member.ready = false;
            }
        }
        info!(lobby_id, "lobby reset to waiting");
        true
    }

    pub async fn disband_lobby(&self, lobby_id: &str, player_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(lobby) = inner.lobbies.get_mut(lobby_id) else {
            return false;
        };
        if !lobby.is_host(player_id) {
            warn!(lobby_id, player_id, "disband rejected: not host");
            return false;
        }
        lobby.status = LobbyStatus::Disbanded;
        Self::cleanup_locked(&mut inner, lobby_id);
        info!(lobby_id, "lobby disbanded by host");
        true
    }

    /// Sweep lobbies past the age limit or already disbanded.
    pub async fn cleanup_stale_lobbies(&self, max_age_secs: u64) -> usize {
        let mut inner = self.inner.write().await;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let stale: Vec<String> = inner
            .lobbies
            .values()
            .filter(|l| {
                now - l.created_at > max_age_secs as f64 || l.status == LobbyStatus::Disbanded
            })
            .map(|l| l.lobby_id.clone())
            .collect();

        for lobby_id in &stale {
            Self::cleanup_locked(&mut inner, lobby_id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up stale lobbies");
        }
        stale.len()
    }

    fn cleanup_locked(inner: &mut Inner, lobby_id: &str) {
        if let Some(lobby) = inner.lobbies.remove(lobby_id) {
            inner.join_codes.remove(&lobby.join_code);
            debug!(lobby_id, "lobby cleaned up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::StageFactory;

    fn manager() -> LobbyManager {
        LobbyManager::new(Arc::new(StageFactory::default()))
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let manager = manager();
        let lobby = manager.create_lobby("Race Night", "host", None).await;

        let by_id = manager.get_lobby(&lobby.lobby_id).await.unwrap();
        assert_eq!(by_id.name, "Race Night");

        let by_code = manager
            .get_lobby_by_code(&lobby.join_code.to_ascii_lowercase())
            .await
            .unwrap();
        assert_eq!(by_code.lobby_id, lobby.lobby_id);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let manager = manager();
        let lobby = manager.create_lobby("L", "host", None).await;

        assert!(manager.join_lobby(&lobby.lobby_id, "p1", None).await);
        assert!(manager.join_lobby(&lobby.lobby_id, "p1", None).await);

        let lobby = manager.get_lobby(&lobby.lobby_id).await.unwrap();
        assert_eq!(lobby.member_count(), 2);
    }

    #[tokio::test]
    async fn test_join_full_lobby_rejected() {
        let manager = manager();
        let settings = LobbySettings {
            max_players: 2,
            ..Default::default()
        };
        let lobby = manager.create_lobby("L", "host", Some(settings)).await;

        assert!(manager.join_lobby(&lobby.lobby_id, "p1", None).await);
        assert!(!manager.join_lobby(&lobby.lobby_id, "p2", None).await);
    }

    #[tokio::test]
    async fn test_host_transfer_chain_then_disband() {
        let manager = manager();
        let lobby = manager.create_lobby("L", "h", None).await;
        let id = lobby.lobby_id.clone();
        manager.join_lobby(&id, "a", None).await;
        manager.join_lobby(&id, "b", None).await;

        assert!(manager.leave_lobby(&id, "h").await);
        let lobby = manager.get_lobby(&id).await.unwrap();
        assert_eq!(lobby.host_player_id, "a");
        assert_eq!(lobby.member_count(), 2);

        assert!(manager.leave_lobby(&id, "a").await);
        let lobby = manager.get_lobby(&id).await.unwrap();
        assert_eq!(lobby.host_player_id, "b");

        assert!(manager.leave_lobby(&id, "b").await);
        assert!(manager.get_lobby(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_add_bot_and_duplicate_rejected() {
        let manager = manager();
        let lobby = manager.create_lobby("L", "host", None).await;

        let bot_id = manager
            .add_bot_to_lobby(&lobby.lobby_id, "7", "alice")
            .await
            .unwrap();
        assert_eq!(bot_id, "bot-alice-7");

        assert!(manager
            .add_bot_to_lobby(&lobby.lobby_id, "7", "alice")
            .await
            .is_none());

        let lobby = manager.get_lobby(&lobby.lobby_id).await.unwrap();
        let member = lobby.member("bot-alice-7").unwrap();
        assert!(member.is_bot && member.ready);
    }

    #[tokio::test]
    async fn test_settings_host_only() {
        let manager = manager();
        let lobby = manager.create_lobby("L", "host", None).await;
        manager.join_lobby(&lobby.lobby_id, "p1", None).await;

        let settings = LobbySettings {
            difficulty: "hard".to_string(),
            ..Default::default()
        };
        assert!(!manager
            .update_settings(&lobby.lobby_id, "p1", settings.clone())
            .await);
        assert!(manager
            .update_settings(&lobby.lobby_id, "host", settings)
            .await);
    }

    #[tokio::test]
    async fn test_start_race_lifecycle() {
        let manager = manager();
        let lobby = manager.create_lobby("L", "host", None).await;
        let id = lobby.lobby_id.clone();

        // Non-host cannot start.
        manager.join_lobby(&id, "p1", None).await;
        assert!(manager.start_race(&id, "p1").await.is_none());

        let (session_id, track) = manager.start_race(&id, "host").await.unwrap();
        assert!(!session_id.is_empty());
        assert!(!track.checkpoints.is_empty());
        assert_eq!(
            manager.get_lobby(&id).await.unwrap().status,
            LobbyStatus::Starting
        );

        // A second start is rejected once out of Waiting.
        assert!(manager.start_race(&id, "host").await.is_none());

        assert!(manager.transition_to_racing(&id).await);
        assert!(manager.finish_race(&id).await);
        assert!(manager.reset_lobby(&id, "host").await);
        assert_eq!(
            manager.get_lobby(&id).await.unwrap().status,
            LobbyStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_seeded_track_is_deterministic() {
        let manager = manager();
        let settings = LobbySettings {
            seed: Some(1234),
            ..Default::default()
        };
        let a = manager.create_lobby("A", "h1", Some(settings.clone())).await;
        let b = manager.create_lobby("B", "h2", Some(settings)).await;

        let (_, track_a) = manager.start_race(&a.lobby_id, "h1").await.unwrap();
        let (_, track_b) = manager.start_race(&b.lobby_id, "h2").await.unwrap();

        assert_eq!(track_a.checkpoints.len(), track_b.checkpoints.len());
        for (ca, cb) in track_a.checkpoints.iter().zip(track_b.checkpoints.iter()) {
            assert_eq!(ca.position, cb.position);
        }
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let manager = manager();
        let lobby = manager.create_lobby("L", "host", None).await;
        assert_eq!(manager.cleanup_stale_lobbies(3600).await, 0);
        assert_eq!(manager.cleanup_stale_lobbies(0).await, 1);
        assert!(manager.get_lobby(&lobby.lobby_id).await.is_none());
    }

    #[tokio::test]
    async fn test_list_ordered_newest_first() {
        let manager = manager();
        let a = manager.create_lobby("A", "h1", None).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = manager.create_lobby("B", "h2", None).await;

        let listed = manager.list_lobbies(None).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].lobby_id, b.lobby_id);
        assert_eq!(listed[1].lobby_id, a.lobby_id);
    }
}
