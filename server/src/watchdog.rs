//! Forces a ban when the team holding the turn lets its deadline pass.
//!
//! The watchdog races live submissions on equal terms: it reads the record,
//! computes the forced transition and swaps it in. If a player's ban lands
//! first the swap fails and the forced ban is dropped.

use crate::coordinator::{Submission, VetoCoordinator};
use crate::error::CoordinatorError;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared::veto::{apply_ban, apply_bans, forced_bans, vote_limit};
use shared::{now_millis, Actor, LobbyId, VetoMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Signals the watchdog sends to the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A forced ban was written to this lobby.
    Changed(LobbyId),
    Heartbeat { timestamp: u64 },
}

pub struct Watchdog {
    coordinator: Arc<VetoCoordinator>,
    scan_interval: Duration,
    heartbeat_interval: Duration,
}

impl Watchdog {
    pub fn new(
        coordinator: Arc<VetoCoordinator>,
        scan_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            scan_interval,
            heartbeat_interval,
        }
    }

    /// Scans every lobby once and forces bans where the deadline has
    /// passed. Returns the lobbies that were changed.
    pub fn tick<R: Rng + ?Sized>(&self, now: u64, rng: &mut R) -> Vec<LobbyId> {
        let lobbies = match self.coordinator.store().lobby_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Watchdog could not list lobbies: {}", e);
                return Vec::new();
            }
        };

        let mut changed = Vec::new();
        for lobby in lobbies {
            match self.force_expired(lobby, now, rng) {
                Ok(Some(Submission::Applied { state, .. })) => {
                    info!(
                        "Lobby {}: turn expired, forced ban ({} map(s) left)",
                        lobby,
                        state.pool.len()
                    );
                    changed.push(lobby);
                }
                Ok(Some(Submission::Superseded)) => {
                    debug!("Lobby {}: forced ban lost to a live submission", lobby);
                }
                Ok(None) => {}
                Err(e) => warn!("Watchdog skipped lobby {}: {}", lobby, e),
            }
        }
        changed
    }

    fn force_expired<R: Rng + ?Sized>(
        &self,
        lobby: LobbyId,
        now: u64,
        rng: &mut R,
    ) -> Result<Option<Submission>, CoordinatorError> {
        let (raw, state) = self.coordinator.read(lobby)?;
        if !state.is_expired(now) {
            return Ok(None);
        }

        let clock = self.coordinator.clock(now);
        let (next, outcome) = match self.coordinator.lobby(lobby)?.settings.veto_mode {
            VetoMode::Captains => {
                let Some(map) = state.pool.choose(rng) else {
                    return Ok(None);
                };
                apply_ban(&state, map, Actor::Watchdog, clock)?
            }
            VetoMode::Players => {
                let bans = forced_bans(&state, vote_limit(&state), rng);
                apply_bans(&state, &bans, clock)?
            }
        };

        self.coordinator
            .commit(lobby, &raw, next, outcome, now)
            .map(Some)
    }

    /// Runs until the notice receiver is dropped.
    pub async fn run(self, notices: mpsc::UnboundedSender<Notice>) {
        let mut rng = StdRng::from_entropy();
        let mut scan = interval(self.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first heartbeat since it fires immediately
        heartbeat.tick().await;

        info!(
            "Watchdog running every {:?}, heartbeat every {:?}",
            self.scan_interval, self.heartbeat_interval
        );

        loop {
            let sent = tokio::select! {
                _ = scan.tick() => self
                    .tick(now_millis(), &mut rng)
                    .into_iter()
                    .all(|lobby| notices.send(Notice::Changed(lobby)).is_ok()),
                _ = heartbeat.tick() => notices
                    .send(Notice::Heartbeat { timestamp: now_millis() })
                    .is_ok(),
            };
            if !sent {
                info!("Watchdog stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LaunchRequest;
    use crate::store::{LobbySettings, LobbyStore, MemoryStore, StoreError};
    use shared::{Assignment, BannedBy, Phase, Player, Team, UserId, VetoState};

    fn maps(names: &[&str]) -> Vec<String> {
        names.iter().map(|m| m.to_string()).collect()
    }

    fn setup(
        store: Arc<dyn LobbyStore>,
        mode: VetoMode,
        extra_team1: &[UserId],
    ) -> (Watchdog, LobbyId, mpsc::UnboundedReceiver<LaunchRequest>) {
        let lobby = store
            .create_lobby(
                LobbySettings {
                    creator: 1,
                    map_pool: maps(&["Ancient", "Anubis", "Inferno", "Mirage", "Nuke"]),
                    veto_mode: mode,
                    server: None,
                    connect_password: None,
                },
                0,
            )
            .unwrap();
        let seats = [(1, Assignment::Team1), (2, Assignment::Team2)]
            .into_iter()
            .chain(extra_team1.iter().map(|&id| (id, Assignment::Team1)));
        for (id, assignment) in seats {
            let mut player = Player::new(id, format!("user{}", id), id);
            player.assignment = assignment;
            store.upsert_player(lobby, player, 0).unwrap();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(VetoCoordinator::new(store, Duration::from_secs(40), tx));
        coordinator.start_match(lobby, 1, 0).unwrap();
        let watchdog = Watchdog::new(
            coordinator,
            Duration::from_secs(1),
            Duration::from_secs(15),
        );
        (watchdog, lobby, rx)
    }

    fn veto(watchdog: &Watchdog, lobby: LobbyId) -> VetoState {
        watchdog.coordinator.read(lobby).unwrap().1
    }

    #[test]
    fn test_no_action_before_deadline() {
        let (watchdog, lobby, _rx) = setup(Arc::new(MemoryStore::new()), VetoMode::Captains, &[]);
        let mut rng = StdRng::seed_from_u64(1);

        assert!(watchdog.tick(39_999, &mut rng).is_empty());
        assert!(veto(&watchdog, lobby).banned.is_empty());
    }

    #[test]
    fn test_forces_random_ban_after_deadline() {
        let (watchdog, lobby, _rx) = setup(Arc::new(MemoryStore::new()), VetoMode::Captains, &[]);
        let mut rng = StdRng::seed_from_u64(2);

        assert_eq!(watchdog.tick(40_000, &mut rng), vec![lobby]);
        let state = veto(&watchdog, lobby);
        assert_eq!(state.banned.len(), 1);
        assert_eq!(state.banned[0].by, BannedBy::Random);
        assert_eq!(state.pool.len(), 4);
        assert_eq!(state.turn, Some(Team::Team2));
        assert_eq!(state.deadline, Some(80_000));

        // The refreshed deadline has not passed yet.
        assert!(watchdog.tick(40_500, &mut rng).is_empty());
    }

    #[test]
    fn test_corrupt_lobby_does_not_stall_others() {
        let store = Arc::new(MemoryStore::new());
        let broken = store
            .create_lobby(
                LobbySettings {
                    creator: 9,
                    map_pool: maps(&["Dust2", "Overpass", "Train"]),
                    veto_mode: VetoMode::Captains,
                    server: None,
                    connect_password: None,
                },
                0,
            )
            .unwrap();
        assert!(store
            .compare_and_write_veto(broken, "", "{not json".to_string(), 0)
            .unwrap());

        let (watchdog, lobby, _rx) = setup(store.clone(), VetoMode::Captains, &[]);
        let mut rng = StdRng::seed_from_u64(5);

        assert_eq!(watchdog.tick(40_000, &mut rng), vec![lobby]);
        assert_eq!(veto(&watchdog, lobby).banned.len(), 1);
        assert_eq!(store.read_veto(broken).unwrap(), "{not json");

        // Skipped again on the next tick.
        assert_eq!(watchdog.tick(80_000, &mut rng), vec![lobby]);
    }

    #[test]
    fn test_runs_veto_to_completion() {
        let (watchdog, lobby, mut rx) =
            setup(Arc::new(MemoryStore::new()), VetoMode::Captains, &[]);
        let mut rng = StdRng::seed_from_u64(3);

        let mut now = 40_000;
        for _ in 0..4 {
            watchdog.tick(now, &mut rng);
            now += 40_000;
        }

        let state = veto(&watchdog, lobby);
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.banned.len(), 4);
        let final_map = state.final_map.unwrap();
        assert_eq!(rx.try_recv().unwrap().final_map, final_map);
        assert!(watchdog.tick(now, &mut rng).is_empty());
    }

    #[test]
    fn test_vote_mode_bans_tallied_maps_first() {
        let (watchdog, lobby, _rx) =
            setup(Arc::new(MemoryStore::new()), VetoMode::Players, &[3, 4]);
        watchdog
            .coordinator
            .submit_vote(lobby, 3, &maps(&["Mirage"]), 10)
            .unwrap();

        let mut rng = StdRng::seed_from_u64(4);
        watchdog.tick(40_000, &mut rng);

        let state = veto(&watchdog, lobby);
        assert_eq!(state.banned.len(), 1);
        assert_eq!(state.banned[0].map, "Mirage");
        assert_eq!(state.banned[0].by, BannedBy::Team1);
    }

    #[test]
    fn test_vote_mode_fills_double_slot_randomly() {
        let (watchdog, lobby, _rx) = setup(Arc::new(MemoryStore::new()), VetoMode::Players, &[]);
        let mut rng = StdRng::seed_from_u64(5);
        watchdog.tick(40_000, &mut rng);
        watchdog.tick(80_000, &mut rng);

        let state = veto(&watchdog, lobby);
        assert_eq!(state.banned.len(), 3);
        assert!(state.banned.iter().all(|b| b.by == BannedBy::Random));
        assert_eq!(state.pool.len(), 2);
        assert_eq!(state.turn, Some(Team::Team1));
    }

    /// Lands a captain's ban between the watchdog's read and its write.
    struct RacingStore {
        inner: MemoryStore,
        interloper: std::sync::Mutex<Option<String>>,
    }

    impl LobbyStore for RacingStore {
        fn create_lobby(&self, settings: LobbySettings, now: u64) -> Result<LobbyId, StoreError> {
            self.inner.create_lobby(settings, now)
        }
        fn lobby(&self, id: LobbyId) -> Result<crate::store::Lobby, StoreError> {
            self.inner.lobby(id)
        }
        fn lobby_ids(&self) -> Result<Vec<LobbyId>, StoreError> {
            self.inner.lobby_ids()
        }
        fn updated_at(&self, id: LobbyId) -> Result<u64, StoreError> {
            self.inner.updated_at(id)
        }
        fn read_veto(&self, id: LobbyId) -> Result<String, StoreError> {
            self.inner.read_veto(id)
        }
        fn compare_and_write_veto(
            &self,
            id: LobbyId,
            expected: &str,
            new: String,
            now: u64,
        ) -> Result<bool, StoreError> {
            if let Some(winner) = self.interloper.lock().unwrap().take() {
                assert!(self.inner.compare_and_write_veto(id, expected, winner, now)?);
            }
            self.inner.compare_and_write_veto(id, expected, new, now)
        }
        fn players(&self, id: LobbyId) -> Result<Vec<Player>, StoreError> {
            self.inner.players(id)
        }
        fn upsert_player(&self, id: LobbyId, player: Player, now: u64) -> Result<(), StoreError> {
            self.inner.upsert_player(id, player, now)
        }
        fn remove_player(&self, id: LobbyId, user: UserId, now: u64) -> Result<bool, StoreError> {
            self.inner.remove_player(id, user, now)
        }
        fn replace_players(
            &self,
            id: LobbyId,
            players: Vec<Player>,
            now: u64,
        ) -> Result<(), StoreError> {
            self.inner.replace_players(id, players, now)
        }
    }

    #[test]
    fn test_forced_ban_loses_race_to_captain() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            interloper: std::sync::Mutex::new(None),
        });
        let (watchdog, lobby, _rx) = setup(store.clone(), VetoMode::Captains, &[]);

        let started = veto(&watchdog, lobby);
        let (captain_ban, _) = apply_ban(
            &started,
            "Nuke",
            Actor::Team(Team::Team1),
            watchdog.coordinator.clock(39_000),
        )
        .unwrap();
        *store.interloper.lock().unwrap() = Some(captain_ban.to_raw().unwrap());

        let mut rng = StdRng::seed_from_u64(6);
        assert!(watchdog.tick(40_000, &mut rng).is_empty());

        let state = veto(&watchdog, lobby);
        assert_eq!(state.banned.len(), 1);
        assert_eq!(state.banned[0].map, "Nuke");
        assert_eq!(state.banned[0].by, BannedBy::Team1);
    }

    #[tokio::test]
    async fn test_run_emits_notices() {
        let (watchdog, lobby, _rx) = setup(Arc::new(MemoryStore::new()), VetoMode::Captains, &[]);
        let watchdog = Watchdog {
            scan_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            ..watchdog
        };
        let (tx, mut notices) = mpsc::unbounded_channel();
        let handle = tokio::spawn(watchdog.run(tx));

        // The lobby's deadline is long past in wall-clock time, so the first
        // scan forces a ban before the heartbeat fires.
        let mut saw_changed = false;
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
                .await
                .unwrap()
                .unwrap();
            match notice {
                Notice::Changed(id) => {
                    assert_eq!(id, lobby);
                    saw_changed = true;
                }
                Notice::Heartbeat { timestamp } => {
                    assert!(timestamp > 0);
                    break;
                }
            }
        }
        assert!(saw_changed);

        drop(notices);
        handle.abort();
    }
}
