//! Veto transitions against the lobby store.
//!
//! Every mutation reads the raw record, computes the next state with the
//! pure functions in `shared::veto`, and writes it back with a
//! compare-and-swap. A write that loses the race is reported as
//! [`Submission::Superseded`]; the caller's next read sees the winner.

use crate::error::CoordinatorError;
use crate::store::{Lobby, LobbyStore};
use log::{debug, error, info};
use shared::ballot::{commit_ballots, quorum_reached, record_ballot};
use shared::veto::{apply_ban, start_veto};
use shared::{
    Actor, BanOutcome, LobbyId, Phase, Player, Team, TurnClock, UserId, VetoMode, VetoState,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Asks the launch worker to bring up the match server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub lobby: LobbyId,
    pub final_map: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Applied {
        state: VetoState,
        outcome: BanOutcome,
    },
    /// Another writer changed the veto first; nothing was written.
    Superseded,
}

pub struct VetoCoordinator {
    store: Arc<dyn LobbyStore>,
    turn_window: Duration,
    launches: mpsc::UnboundedSender<LaunchRequest>,
}

impl VetoCoordinator {
    pub fn new(
        store: Arc<dyn LobbyStore>,
        turn_window: Duration,
        launches: mpsc::UnboundedSender<LaunchRequest>,
    ) -> Self {
        Self {
            store,
            turn_window,
            launches,
        }
    }

    pub fn store(&self) -> &Arc<dyn LobbyStore> {
        &self.store
    }

    pub fn clock(&self, now: u64) -> TurnClock {
        TurnClock::at(now).with_window(self.turn_window.as_millis() as u64)
    }

    /// Current raw record and its decoded state.
    pub fn read(&self, lobby: LobbyId) -> Result<(String, VetoState), CoordinatorError> {
        let raw = self.store.read_veto(lobby)?;
        let state = VetoState::from_raw(&raw)?;
        Ok((raw, state))
    }

    /// Begins the veto. Only the creator may start, and both teams need
    /// at least one player.
    pub fn start_match(
        &self,
        lobby: LobbyId,
        requester: UserId,
        now: u64,
    ) -> Result<Submission, CoordinatorError> {
        let settings = self.store.lobby(lobby)?.settings;
        if settings.creator != requester {
            return Err(CoordinatorError::NotCreator);
        }

        let players = self.store.players(lobby)?;
        for team in [Team::Team1, Team::Team2] {
            if !players.iter().any(|p| p.team() == Some(team)) {
                return Err(CoordinatorError::TeamsIncomplete);
            }
        }

        let (raw, state) = self.read(lobby)?;
        if state.phase != Phase::NotStarted {
            return Err(shared::VetoError::WrongPhase.into());
        }

        let next = start_veto(&settings.map_pool, self.clock(now))?;
        let outcome = match &next.final_map {
            Some(final_map) => BanOutcome::Complete {
                final_map: final_map.clone(),
            },
            None => BanOutcome::Pending,
        };
        info!(
            "Lobby {} veto started over {} map(s)",
            lobby,
            settings.map_pool.len()
        );
        self.commit(lobby, &raw, next, outcome, now)
    }

    /// A captain bans one map for their team.
    pub fn submit_ban(
        &self,
        lobby: LobbyId,
        user: UserId,
        map: &str,
        now: u64,
    ) -> Result<Submission, CoordinatorError> {
        let settings = self.store.lobby(lobby)?.settings;
        if settings.veto_mode != VetoMode::Captains {
            return Err(CoordinatorError::WrongVetoMode(settings.veto_mode));
        }

        let players = self.store.players(lobby)?;
        let player = find_player(&players, user)?;
        let team = player.team().ok_or(CoordinatorError::NotOnTeam)?;
        if !player.captain {
            return Err(CoordinatorError::NotCaptain);
        }

        let (raw, state) = self.read(lobby)?;
        let (next, outcome) = apply_ban(&state, map, Actor::Team(team), self.clock(now))?;
        debug!("Lobby {}: {:?} banned {}", lobby, team, map);
        self.commit(lobby, &raw, next, outcome, now)
    }

    /// Records a player's ballot and commits the tally once every eligible
    /// voter has one on file.
    pub fn submit_vote(
        &self,
        lobby: LobbyId,
        user: UserId,
        maps: &[String],
        now: u64,
    ) -> Result<Submission, CoordinatorError> {
        let settings = self.store.lobby(lobby)?.settings;
        if settings.veto_mode != VetoMode::Players {
            return Err(CoordinatorError::WrongVetoMode(settings.veto_mode));
        }

        let players = self.store.players(lobby)?;
        let team = find_player(&players, user)?
            .team()
            .ok_or(CoordinatorError::NotOnTeam)?;

        let (raw, state) = self.read(lobby)?;
        let balloted = record_ballot(&state, user, team, maps)?;
        let eligible = eligible_voters(&players, team);
        if !eligible.contains(&user) {
            return Err(CoordinatorError::NotEligibleVoter);
        }

        let (next, outcome) = if quorum_reached(&balloted, &eligible) {
            debug!("Lobby {}: {:?} reached quorum", lobby, team);
            commit_ballots(&balloted, self.clock(now))?
        } else {
            (balloted, BanOutcome::Pending)
        };
        self.commit(lobby, &raw, next, outcome, now)
    }

    /// Swaps `next` in for `expected` and queues the launch when the veto
    /// just finished.
    pub fn commit(
        &self,
        lobby: LobbyId,
        expected: &str,
        next: VetoState,
        outcome: BanOutcome,
        now: u64,
    ) -> Result<Submission, CoordinatorError> {
        let raw = next.to_raw()?;
        if !self.store.compare_and_write_veto(lobby, expected, raw, now)? {
            debug!("Lobby {}: veto write superseded", lobby);
            return Ok(Submission::Superseded);
        }

        if let BanOutcome::Complete { final_map } = &outcome {
            info!("Lobby {} veto finished on {}", lobby, final_map);
            let request = LaunchRequest {
                lobby,
                final_map: final_map.clone(),
            };
            if let Err(e) = self.launches.send(request) {
                error!("Failed to queue launch for lobby {}: {}", lobby, e);
            }
        }

        Ok(Submission::Applied {
            state: next,
            outcome,
        })
    }

    pub fn lobby(&self, lobby: LobbyId) -> Result<Lobby, CoordinatorError> {
        Ok(self.store.lobby(lobby)?)
    }
}

fn find_player(players: &[Player], user: UserId) -> Result<&Player, CoordinatorError> {
    players
        .iter()
        .find(|p| p.user_id == user)
        .ok_or(CoordinatorError::NotInLobby)
}

/// Members of `team` whose ballots count: every real non-captain, or the
/// captain alone when nobody else is on the team.
pub fn eligible_voters(players: &[Player], team: Team) -> BTreeSet<UserId> {
    let members = || {
        players
            .iter()
            .filter(move |p| p.team() == Some(team) && !p.placeholder)
    };
    let voters: BTreeSet<UserId> = members()
        .filter(|p| !p.captain)
        .map(|p| p.user_id)
        .collect();
    if !voters.is_empty() {
        return voters;
    }
    members().filter(|p| p.captain).map(|p| p.user_id).collect()
}
