//! Lobby persistence boundary.
//!
//! The veto record is kept as the raw JSON text it was written with, and
//! [`LobbyStore::compare_and_write_veto`] only accepts a write when the
//! stored text is byte-for-byte what the writer read. Every veto mutation
//! goes through that swap, so two writers racing on the same turn cannot
//! both succeed.

use log::debug;
use shared::roster::ensure_captains;
use shared::{LobbyId, Player, ServerTarget, UserId, VetoMode};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lobby {0} does not exist")]
    UnknownLobby(LobbyId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Settings chosen by the creator when the lobby is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbySettings {
    pub creator: UserId,
    pub map_pool: Vec<String>,
    pub veto_mode: VetoMode,
    pub server: Option<ServerTarget>,
    pub connect_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lobby {
    pub id: LobbyId,
    pub created_at: u64,
    pub settings: LobbySettings,
}

pub trait LobbyStore: Send + Sync {
    fn create_lobby(&self, settings: LobbySettings, now: u64) -> Result<LobbyId, StoreError>;

    fn lobby(&self, id: LobbyId) -> Result<Lobby, StoreError>;

    fn lobby_ids(&self) -> Result<Vec<LobbyId>, StoreError>;

    /// Last time anything in the lobby changed, in epoch milliseconds.
    fn updated_at(&self, id: LobbyId) -> Result<u64, StoreError>;

    /// Raw veto record; blank until the first write.
    fn read_veto(&self, id: LobbyId) -> Result<String, StoreError>;

    /// Replaces the veto record with `new` only if it still equals
    /// `expected`. Returns whether the write was accepted.
    fn compare_and_write_veto(
        &self,
        id: LobbyId,
        expected: &str,
        new: String,
        now: u64,
    ) -> Result<bool, StoreError>;

    fn players(&self, id: LobbyId) -> Result<Vec<Player>, StoreError>;

    /// Inserts the player, or replaces the entry with the same user id.
    fn upsert_player(&self, id: LobbyId, player: Player, now: u64) -> Result<(), StoreError>;

    fn remove_player(&self, id: LobbyId, user: UserId, now: u64) -> Result<bool, StoreError>;

    fn replace_players(
        &self,
        id: LobbyId,
        players: Vec<Player>,
        now: u64,
    ) -> Result<(), StoreError>;
}

struct LobbyRecord {
    lobby: Lobby,
    veto: String,
    players: Vec<Player>,
    updated_at: u64,
}

impl LobbyRecord {
    // Strictly increasing so two writes in the same millisecond are both observed.
    fn touch(&mut self, now: u64) {
        self.updated_at = now.max(self.updated_at + 1);
    }

    fn roster_changed(&mut self, now: u64) {
        ensure_captains(&mut self.players);
        self.touch(now);
    }
}

#[derive(Default)]
struct Inner {
    next_id: LobbyId,
    lobbies: BTreeMap<LobbyId, LobbyRecord>,
}

/// In-process [`LobbyStore`] behind a single mutex.
///
/// Roster writes re-run captain selection so each non-empty team keeps
/// exactly one captain.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("lobby store lock poisoned".to_string()))
    }

    fn with_record<T>(
        &self,
        id: LobbyId,
        f: impl FnOnce(&mut LobbyRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut inner = self.lock()?;
        let record = inner
            .lobbies
            .get_mut(&id)
            .ok_or(StoreError::UnknownLobby(id))?;
        Ok(f(record))
    }
}

impl LobbyStore for MemoryStore {
    fn create_lobby(&self, settings: LobbySettings, now: u64) -> Result<LobbyId, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.lobbies.insert(
            id,
            LobbyRecord {
                lobby: Lobby {
                    id,
                    created_at: now,
                    settings,
                },
                veto: String::new(),
                players: Vec::new(),
                updated_at: now,
            },
        );
        Ok(id)
    }

    fn lobby(&self, id: LobbyId) -> Result<Lobby, StoreError> {
        self.with_record(id, |record| record.lobby.clone())
    }

    fn lobby_ids(&self) -> Result<Vec<LobbyId>, StoreError> {
        Ok(self.lock()?.lobbies.keys().copied().collect())
    }

    fn updated_at(&self, id: LobbyId) -> Result<u64, StoreError> {
        self.with_record(id, |record| record.updated_at)
    }

    fn read_veto(&self, id: LobbyId) -> Result<String, StoreError> {
        self.with_record(id, |record| record.veto.clone())
    }

    fn compare_and_write_veto(
        &self,
        id: LobbyId,
        expected: &str,
        new: String,
        now: u64,
    ) -> Result<bool, StoreError> {
        self.with_record(id, |record| {
            if record.veto != expected {
                debug!("Veto write for lobby {} lost the race", id);
                return false;
            }
            record.veto = new;
            record.touch(now);
            true
        })
    }

    fn players(&self, id: LobbyId) -> Result<Vec<Player>, StoreError> {
        self.with_record(id, |record| record.players.clone())
    }

    fn upsert_player(&self, id: LobbyId, player: Player, now: u64) -> Result<(), StoreError> {
        self.with_record(id, |record| {
            match record
                .players
                .iter_mut()
                .find(|p| p.user_id == player.user_id)
            {
                Some(existing) => *existing = player,
                None => record.players.push(player),
            }
            record.roster_changed(now);
        })
    }

    fn remove_player(&self, id: LobbyId, user: UserId, now: u64) -> Result<bool, StoreError> {
        self.with_record(id, |record| {
            let before = record.players.len();
            record.players.retain(|p| p.user_id != user);
            let removed = record.players.len() != before;
            if removed {
                record.roster_changed(now);
            }
            removed
        })
    }

    fn replace_players(
        &self,
        id: LobbyId,
        players: Vec<Player>,
        now: u64,
    ) -> Result<(), StoreError> {
        self.with_record(id, |record| {
            record.players = players;
            record.roster_changed(now);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Assignment, Team};

    fn settings() -> LobbySettings {
        LobbySettings {
            creator: 1,
            map_pool: vec!["Inferno".to_string(), "Nuke".to_string()],
            veto_mode: VetoMode::Captains,
            server: None,
            connect_password: None,
        }
    }

    #[test]
    fn test_create_and_read_lobby() {
        let store = MemoryStore::new();
        let first = store.create_lobby(settings(), 100).unwrap();
        let second = store.create_lobby(settings(), 200).unwrap();
        assert_ne!(first, second);

        let lobby = store.lobby(first).unwrap();
        assert_eq!(lobby.created_at, 100);
        assert_eq!(lobby.settings, settings());
        assert_eq!(store.lobby_ids().unwrap(), vec![first, second]);
        assert_eq!(store.read_veto(first).unwrap(), "");
    }

    #[test]
    fn test_unknown_lobby() {
        let store = MemoryStore::new();
        assert!(matches!(store.lobby(9), Err(StoreError::UnknownLobby(9))));
        assert!(matches!(
            store.compare_and_write_veto(9, "", "{}".to_string(), 0),
            Err(StoreError::UnknownLobby(9))
        ));
    }

    #[test]
    fn test_compare_and_write_veto() {
        let store = MemoryStore::new();
        let id = store.create_lobby(settings(), 0).unwrap();

        assert!(store
            .compare_and_write_veto(id, "", "first".to_string(), 10)
            .unwrap());
        assert!(!store
            .compare_and_write_veto(id, "", "second".to_string(), 11)
            .unwrap());
        assert_eq!(store.read_veto(id).unwrap(), "first");

        assert!(store
            .compare_and_write_veto(id, "first", "third".to_string(), 12)
            .unwrap());
        assert_eq!(store.read_veto(id).unwrap(), "third");
    }

    #[test]
    fn test_updated_at_strictly_increases() {
        let store = MemoryStore::new();
        let id = store.create_lobby(settings(), 50).unwrap();

        store
            .compare_and_write_veto(id, "", "a".to_string(), 50)
            .unwrap();
        assert_eq!(store.updated_at(id).unwrap(), 51);

        store.upsert_player(id, Player::new(2, "two", 40), 40).unwrap();
        assert_eq!(store.updated_at(id).unwrap(), 52);

        store
            .compare_and_write_veto(id, "stale", "b".to_string(), 500)
            .unwrap();
        assert_eq!(store.updated_at(id).unwrap(), 52);
    }

    #[test]
    fn test_roster_writes_assign_captains() {
        let store = MemoryStore::new();
        let id = store.create_lobby(settings(), 0).unwrap();

        let mut early = Player::new(2, "early", 1);
        early.assignment = Assignment::Team1;
        let mut late = Player::new(3, "late", 2);
        late.assignment = Assignment::Team1;
        store.upsert_player(id, late, 5).unwrap();
        store.upsert_player(id, early, 6).unwrap();

        let captain = shared::roster::captain_of(&store.players(id).unwrap(), Team::Team1)
            .map(|p| p.user_id);
        assert_eq!(captain, Some(3));

        assert!(store.remove_player(id, 3, 7).unwrap());
        let players = store.players(id).unwrap();
        assert_eq!(players.len(), 1);
        assert!(players[0].captain);
        assert!(!store.remove_player(id, 3, 8).unwrap());
    }

    #[test]
    fn test_upsert_replaces_existing_entry() {
        let store = MemoryStore::new();
        let id = store.create_lobby(settings(), 0).unwrap();
        store.upsert_player(id, Player::new(4, "old", 1), 1).unwrap();
        store.upsert_player(id, Player::new(4, "new", 1), 2).unwrap();

        let players = store.players(id).unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "new");
    }
}
