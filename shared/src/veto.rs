//! Map veto state machine.
//!
//! A veto reduces the lobby's map pool to a single map. Teams ban in ABBA
//! order (`TEAM1, TEAM2, TEAM2, TEAM1`, repeating) except that once exactly
//! two maps remain, the next slot goes to the team that did not use the last
//! one. Every transition takes the previous [`VetoState`] by reference and
//! returns a fresh value; the caller is responsible for persisting it with a
//! compare-and-swap against the state it read.

use crate::ballot::PendingVotes;
use crate::TURN_WINDOW_MS;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Team {
    Team1,
    Team2,
}

impl Team {
    pub fn other(self) -> Team {
        match self {
            Team::Team1 => Team::Team2,
            Team::Team2 => Team::Team1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    NotStarted,
    InProgress,
    Done,
}

/// Who a ban is attributed to in the ban log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BannedBy {
    Team1,
    Team2,
    /// Forced by the watchdog after a missed deadline.
    Random,
}

impl From<Team> for BannedBy {
    fn from(team: Team) -> Self {
        match team {
            Team::Team1 => BannedBy::Team1,
            Team::Team2 => BannedBy::Team2,
        }
    }
}

/// The party proposing a ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Team(Team),
    /// Bypasses the turn check but still consumes the current turn's slot.
    Watchdog,
}

impl Actor {
    pub fn banned_by(self) -> BannedBy {
        match self {
            Actor::Team(team) => team.into(),
            Actor::Watchdog => BannedBy::Random,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub map: String,
    pub by: BannedBy,
}

impl BanRecord {
    pub fn new(map: impl Into<String>, by: BannedBy) -> Self {
        Self {
            map: map.into(),
            by,
        }
    }
}

/// Persisted veto aggregate.
///
/// Serialized as JSON with the field names below; missing fields decode to
/// their defaults so a blank record reads as a veto that has not started.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VetoState {
    pub phase: Phase,
    pub pool: Vec<String>,
    pub banned: Vec<BanRecord>,
    pub turn: Option<Team>,
    /// Epoch milliseconds by which `turn` must act.
    pub deadline: Option<u64>,
    pub final_map: Option<String>,
    pub pending_votes: Option<PendingVotes>,
}

impl VetoState {
    pub fn from_raw(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn to_raw(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.phase == Phase::InProgress && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn contains(&self, map: &str) -> bool {
        self.pool.iter().any(|m| m == map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanOutcome {
    Pending,
    /// The pool is down to one map; the match server should be launched.
    Complete { final_map: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VetoError {
    #[error("map pool is empty or contains duplicates")]
    InvalidPool,
    #[error("veto is not in progress")]
    WrongPhase,
    #[error("it is not your team's turn")]
    NotYourTurn,
    #[error("map '{0}' is not in the remaining pool")]
    MapNotInPool(String),
    #[error("ballot is empty")]
    EmptyBallot,
    #[error("ballot selects {got} maps but at most {limit} may be banned this turn")]
    TooManyVotes { limit: usize, got: usize },
}

/// Current time plus the turn window used to refresh deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnClock {
    pub now: u64,
    pub turn_window: u64,
}

impl TurnClock {
    pub fn at(now: u64) -> Self {
        Self {
            now,
            turn_window: TURN_WINDOW_MS,
        }
    }

    pub fn with_window(mut self, turn_window: u64) -> Self {
        self.turn_window = turn_window;
        self
    }

    pub fn deadline(&self) -> u64 {
        self.now.saturating_add(self.turn_window)
    }
}

/// Team owning the `index`-th ban slot under the ABBA schedule.
pub fn abba(index: usize) -> Team {
    match index % 4 {
        0 | 3 => Team::Team1,
        _ => Team::Team2,
    }
}

/// Begins a veto over `pool`.
///
/// Pools of one or two maps skip the veto: the first map is final and nothing
/// is recorded as banned.
pub fn start_veto(pool: &[String], clock: TurnClock) -> Result<VetoState, VetoError> {
    let Some(first) = pool.first() else {
        return Err(VetoError::InvalidPool);
    };
    for (i, map) in pool.iter().enumerate() {
        if pool[..i].contains(map) {
            return Err(VetoError::InvalidPool);
        }
    }

    if pool.len() <= 2 {
        return Ok(VetoState {
            phase: Phase::Done,
            pool: vec![first.clone()],
            final_map: Some(first.clone()),
            ..VetoState::default()
        });
    }

    Ok(VetoState {
        phase: Phase::InProgress,
        pool: pool.to_vec(),
        banned: Vec::new(),
        turn: Some(abba(0)),
        deadline: Some(clock.deadline()),
        final_map: None,
        pending_votes: None,
    })
}

/// Bans a single map on behalf of `actor`.
pub fn apply_ban(
    state: &VetoState,
    map: &str,
    actor: Actor,
    clock: TurnClock,
) -> Result<(VetoState, BanOutcome), VetoError> {
    let slot = current_turn(state)?;
    if let Actor::Team(team) = actor {
        if team != slot {
            return Err(VetoError::NotYourTurn);
        }
    }
    if !state.contains(map) {
        return Err(VetoError::MapNotInPool(map.to_string()));
    }

    Ok(commit(
        state,
        &[BanRecord::new(map, actor.banned_by())],
        slot,
        clock,
    ))
}

/// Commits several bans in one turn, as produced by a vote tally.
///
/// Each record must be attributed to the team holding the turn or to
/// [`BannedBy::Random`], and the set may not exceed [`vote_limit`].
pub fn apply_bans(
    state: &VetoState,
    bans: &[BanRecord],
    clock: TurnClock,
) -> Result<(VetoState, BanOutcome), VetoError> {
    let slot = current_turn(state)?;
    if bans.is_empty() {
        return Err(VetoError::EmptyBallot);
    }
    let limit = vote_limit(state);
    if bans.len() > limit {
        return Err(VetoError::TooManyVotes {
            limit,
            got: bans.len(),
        });
    }
    for (i, ban) in bans.iter().enumerate() {
        if ban.by != BannedBy::Random && ban.by != BannedBy::from(slot) {
            return Err(VetoError::NotYourTurn);
        }
        if !state.contains(&ban.map) || bans[..i].iter().any(|b| b.map == ban.map) {
            return Err(VetoError::MapNotInPool(ban.map.clone()));
        }
    }

    Ok(commit(state, bans, slot, clock))
}

/// Number of maps the team holding the turn bans at once in vote mode.
///
/// Two when the ABBA schedule would hand the following slot straight back to
/// the same team and at least two maps would survive; one otherwise.
pub fn vote_limit(state: &VetoState) -> usize {
    match state.turn {
        Some(turn) if state.pool.len() >= 4 && abba(state.banned.len() + 1) == turn => 2,
        _ => 1,
    }
}

/// Picks `width` bans for a turn whose deadline elapsed.
///
/// Maps already carrying votes are banned first in tally order on behalf of
/// the team; remaining slots are drawn uniformly from the rest of the pool.
pub fn forced_bans<R: Rng + ?Sized>(
    state: &VetoState,
    width: usize,
    rng: &mut R,
) -> Vec<BanRecord> {
    let Some(turn) = state.turn else {
        return Vec::new();
    };
    let width = width.min(state.pool.len());

    let mut bans: Vec<BanRecord> = crate::ballot::tally(state)
        .into_iter()
        .take(width)
        .map(|map| BanRecord::new(map, turn.into()))
        .collect();

    let remaining: Vec<&String> = state
        .pool
        .iter()
        .filter(|map| !bans.iter().any(|b| &b.map == *map))
        .collect();
    bans.extend(
        remaining
            .choose_multiple(rng, width - bans.len())
            .map(|map| BanRecord::new(map.as_str(), BannedBy::Random)),
    );
    bans
}

fn current_turn(state: &VetoState) -> Result<Team, VetoError> {
    match (state.phase, state.turn) {
        (Phase::InProgress, Some(turn)) => Ok(turn),
        _ => Err(VetoError::WrongPhase),
    }
}

fn commit(
    state: &VetoState,
    bans: &[BanRecord],
    slot: Team,
    clock: TurnClock,
) -> (VetoState, BanOutcome) {
    let mut next = state.clone();
    for ban in bans {
        next.pool.retain(|map| map != &ban.map);
        next.banned.push(ban.clone());
    }
    next.pending_votes = None;

    if next.pool.len() <= 1 {
        let final_map = match next.pool.first() {
            Some(map) => map.clone(),
            None => bans.last().map(|b| b.map.clone()).unwrap_or_default(),
        };
        next.phase = Phase::Done;
        next.turn = None;
        next.deadline = None;
        next.final_map = Some(final_map.clone());
        return (next, BanOutcome::Complete { final_map });
    }

    next.turn = Some(if next.pool.len() == 2 {
        slot.other()
    } else {
        abba(next.banned.len())
    });
    next.deadline = Some(clock.deadline());
    (next, BanOutcome::Pending)
}
