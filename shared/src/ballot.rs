//! Vote-mode ballots.
//!
//! In vote mode the team holding the turn does not ban directly; its
//! eligible members each select up to [`vote_limit`] maps and the tally is
//! committed once everybody has voted (or by the watchdog at the deadline).

use crate::veto::{apply_bans, vote_limit, BanOutcome, BanRecord, Phase, Team, TurnClock};
use crate::veto::{VetoError, VetoState};
use crate::UserId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ballots cast during one turn. Ordered collections keep the serialized
/// form stable, which the compare-and-swap relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingVotes {
    pub team: Team,
    /// Number of bans applied when the turn began.
    pub turn: usize,
    pub votes: BTreeMap<String, BTreeSet<UserId>>,
}

impl PendingVotes {
    pub fn new(team: Team, turn: usize) -> Self {
        Self {
            team,
            turn,
            votes: BTreeMap::new(),
        }
    }

    pub fn voters(&self) -> BTreeSet<UserId> {
        self.votes.values().flatten().copied().collect()
    }

    pub fn ballot_of(&self, voter: UserId) -> Vec<&str> {
        self.votes
            .iter()
            .filter(|(_, voters)| voters.contains(&voter))
            .map(|(map, _)| map.as_str())
            .collect()
    }
}

/// Ballots for the turn currently in progress, ignoring leftovers from an
/// earlier turn.
pub fn current_votes(state: &VetoState) -> Option<&PendingVotes> {
    let turn = state.turn?;
    state
        .pending_votes
        .as_ref()
        .filter(|p| p.team == turn && p.turn == state.banned.len())
}

/// Records (or replaces) `voter`'s ballot for the current turn.
pub fn record_ballot(
    state: &VetoState,
    voter: UserId,
    team: Team,
    maps: &[String],
) -> Result<VetoState, VetoError> {
    let turn = match (state.phase, state.turn) {
        (Phase::InProgress, Some(turn)) => turn,
        _ => return Err(VetoError::WrongPhase),
    };
    if team != turn {
        return Err(VetoError::NotYourTurn);
    }

    let selection: BTreeSet<&String> = maps.iter().collect();
    if selection.is_empty() {
        return Err(VetoError::EmptyBallot);
    }
    let limit = vote_limit(state);
    if selection.len() > limit {
        return Err(VetoError::TooManyVotes {
            limit,
            got: selection.len(),
        });
    }
    if let Some(missing) = selection.iter().find(|map| !state.contains(map)) {
        return Err(VetoError::MapNotInPool((*missing).clone()));
    }

    let mut pending = current_votes(state)
        .cloned()
        .unwrap_or_else(|| PendingVotes::new(turn, state.banned.len()));
    for voters in pending.votes.values_mut() {
        voters.remove(&voter);
    }
    pending.votes.retain(|_, voters| !voters.is_empty());
    for map in selection {
        pending.votes.entry(map.clone()).or_default().insert(voter);
    }

    let mut next = state.clone();
    next.pending_votes = Some(pending);
    Ok(next)
}

/// Maps to ban for the current turn: most votes first, ties broken by pool
/// order, at most [`vote_limit`] entries.
pub fn tally(state: &VetoState) -> Vec<String> {
    let Some(pending) = current_votes(state) else {
        return Vec::new();
    };

    let mut ranked: Vec<(usize, usize, &String)> = state
        .pool
        .iter()
        .enumerate()
        .filter_map(|(position, map)| {
            pending
                .votes
                .get(map)
                .filter(|voters| !voters.is_empty())
                .map(|voters| (voters.len(), position, map))
        })
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    ranked
        .into_iter()
        .take(vote_limit(state))
        .map(|(_, _, map)| map.clone())
        .collect()
}

/// True once every eligible voter has a ballot on file for this turn.
pub fn quorum_reached(state: &VetoState, eligible: &BTreeSet<UserId>) -> bool {
    if eligible.is_empty() {
        return false;
    }
    match current_votes(state) {
        Some(pending) => eligible.is_subset(&pending.voters()),
        None => false,
    }
}

/// Bans the tallied maps on behalf of the team holding the turn.
pub fn commit_ballots(
    state: &VetoState,
    clock: TurnClock,
) -> Result<(VetoState, BanOutcome), VetoError> {
    let turn = state.turn.ok_or(VetoError::WrongPhase)?;
    let bans: Vec<BanRecord> = tally(state)
        .into_iter()
        .map(|map| BanRecord::new(map, turn.into()))
        .collect();
    apply_bans(state, &bans, clock)
}
