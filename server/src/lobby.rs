//! Lobby creation and roster changes.
//!
//! Seats are frozen once the veto leaves `NOT_STARTED`, since moving players
//! mid-veto would change who may ban or vote for a turn already underway.

use crate::error::CoordinatorError;
use crate::store::{LobbySettings, LobbyStore};
use log::info;
use rand::Rng;
use shared::roster::balance;
use shared::{
    Assignment, BalanceMode, LobbyId, Packet, Phase, Player, ServerTarget, SkillRating, UserId,
    VetoError, VetoMode, VetoState,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct LobbyService {
    store: Arc<dyn LobbyStore>,
}

impl LobbyService {
    pub fn new(store: Arc<dyn LobbyStore>) -> Self {
        Self { store }
    }

    /// Opens a lobby. Blank pool entries are dropped; the pool must not be
    /// empty or repeat a map.
    pub fn create(
        &self,
        creator: UserId,
        map_pool: &[String],
        veto_mode: VetoMode,
        server: Option<ServerTarget>,
        connect_password: Option<String>,
        now: u64,
    ) -> Result<LobbyId, CoordinatorError> {
        let map_pool: Vec<String> = map_pool
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        let has_duplicates = map_pool
            .iter()
            .enumerate()
            .any(|(i, map)| map_pool[..i].contains(map));
        if map_pool.is_empty() || has_duplicates {
            return Err(VetoError::InvalidPool.into());
        }

        let id = self.store.create_lobby(
            LobbySettings {
                creator,
                map_pool,
                veto_mode,
                server,
                connect_password,
            },
            now,
        )?;
        info!("User {} opened lobby {} ({:?} veto)", creator, id, veto_mode);
        Ok(id)
    }

    /// Adds the user to the waiting room, or refreshes their name and
    /// rating if they are already in the lobby.
    pub fn join(
        &self,
        lobby: LobbyId,
        user: UserId,
        name: &str,
        skill: SkillRating,
        now: u64,
    ) -> Result<(), CoordinatorError> {
        let existing = self
            .store
            .players(lobby)?
            .into_iter()
            .find(|p| p.user_id == user);

        let player = match existing {
            Some(mut player) => {
                player.name = name.to_string();
                player.skill = skill;
                player
            }
            None => {
                self.ensure_unlocked(lobby)?;
                let mut player = Player::new(user, name, now);
                player.skill = skill;
                player
            }
        };
        self.store.upsert_player(lobby, player, now)?;
        Ok(())
    }

    pub fn leave(&self, lobby: LobbyId, user: UserId, now: u64) -> Result<(), CoordinatorError> {
        self.ensure_unlocked(lobby)?;
        if !self.store.remove_player(lobby, user, now)? {
            return Err(CoordinatorError::NotInLobby);
        }
        Ok(())
    }

    /// Moves a player between seats. Players may move themselves; anybody
    /// else needs the lobby creator.
    pub fn move_player(
        &self,
        lobby: LobbyId,
        requester: UserId,
        user: UserId,
        assignment: Assignment,
        now: u64,
    ) -> Result<(), CoordinatorError> {
        if requester != user && self.store.lobby(lobby)?.settings.creator != requester {
            return Err(CoordinatorError::NotCreator);
        }
        self.ensure_unlocked(lobby)?;

        let mut player = self
            .store
            .players(lobby)?
            .into_iter()
            .find(|p| p.user_id == user)
            .ok_or(CoordinatorError::NotInLobby)?;
        if player.assignment != assignment {
            player.assignment = assignment;
            player.captain = false;
        }
        self.store.upsert_player(lobby, player, now)?;
        Ok(())
    }

    pub fn balance<R: Rng + ?Sized>(
        &self,
        lobby: LobbyId,
        requester: UserId,
        mode: BalanceMode,
        rng: &mut R,
        now: u64,
    ) -> Result<(), CoordinatorError> {
        if self.store.lobby(lobby)?.settings.creator != requester {
            return Err(CoordinatorError::NotCreator);
        }
        self.ensure_unlocked(lobby)?;

        let players = self.store.players(lobby)?;
        let mut balanced = balance(&players, mode, rng);
        balanced.sort_by_key(|p| (p.joined_at, p.user_id));
        self.store.replace_players(lobby, balanced, now)?;
        info!("Lobby {} balanced ({:?})", lobby, mode);
        Ok(())
    }

    /// Current view of the lobby for clients.
    pub fn snapshot(&self, lobby: LobbyId) -> Result<Packet, CoordinatorError> {
        let updated_at = self.store.updated_at(lobby)?;
        let veto = VetoState::from_raw(&self.store.read_veto(lobby)?)?;
        let players = self.store.players(lobby)?;
        Ok(Packet::LobbyUpdated {
            lobby,
            updated_at,
            veto,
            players,
        })
    }

    pub fn updated_at(&self, lobby: LobbyId) -> Result<u64, CoordinatorError> {
        Ok(self.store.updated_at(lobby)?)
    }

    fn ensure_unlocked(&self, lobby: LobbyId) -> Result<(), CoordinatorError> {
        let veto = VetoState::from_raw(&self.store.read_veto(lobby)?)?;
        if veto.phase != Phase::NotStarted {
            return Err(CoordinatorError::RosterLocked);
        }
        Ok(())
    }
}
