//! Lobby roster, auto-balancing and captain selection.

use crate::veto::Team;
use crate::UserId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Divisor mapping the in-house rating onto the external tier scale.
pub const RATING_PER_TIER: f64 = 300.0;
pub const MAX_TIER: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Assignment {
    Team1,
    Team2,
    #[default]
    WaitingRoom,
}

impl Assignment {
    pub fn team(self) -> Option<Team> {
        match self {
            Assignment::Team1 => Some(Team::Team1),
            Assignment::Team2 => Some(Team::Team2),
            Assignment::WaitingRoom => None,
        }
    }
}

impl From<Team> for Assignment {
    fn from(team: Team) -> Self {
        match team {
            Team::Team1 => Assignment::Team1,
            Team::Team2 => Assignment::Team2,
        }
    }
}

/// Ratings gathered from outside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SkillRating {
    /// External platform skill tier, 1 to 10.
    pub tier: Option<u8>,
    /// In-house rating.
    pub rating: Option<f64>,
}

impl SkillRating {
    /// Balancing weight: the external tier when known, else the normalized
    /// in-house rating, else zero.
    pub fn weight(&self) -> f64 {
        if let Some(tier) = self.tier {
            return f64::from(tier).min(MAX_TIER);
        }
        match self.rating {
            Some(rating) if rating.is_finite() => (rating / RATING_PER_TIER).clamp(0.0, MAX_TIER),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub user_id: UserId,
    pub name: String,
    pub assignment: Assignment,
    pub captain: bool,
    /// Reserved slot without a real user behind it.
    pub placeholder: bool,
    pub joined_at: u64,
    pub skill: SkillRating,
}

impl Player {
    pub fn new(user_id: UserId, name: impl Into<String>, joined_at: u64) -> Self {
        Self {
            user_id,
            name: name.into(),
            assignment: Assignment::WaitingRoom,
            captain: false,
            placeholder: false,
            joined_at,
            skill: SkillRating::default(),
        }
    }

    pub fn team(&self) -> Option<Team> {
        self.assignment.team()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceMode {
    /// Strongest players are spread first.
    Scramble,
    /// Skill is ignored.
    Random,
}

/// Splits `players` into two teams.
///
/// Players are shuffled, sorted by descending weight in scramble mode, then
/// each goes to the smaller team (the lighter one on a tie). Captain flags
/// are normalized afterwards with [`ensure_captains`].
pub fn balance<R: Rng + ?Sized>(
    players: &[Player],
    mode: BalanceMode,
    rng: &mut R,
) -> Vec<Player> {
    let weight = |player: &Player| match mode {
        BalanceMode::Scramble => player.skill.weight(),
        BalanceMode::Random => 0.0,
    };

    let mut order = players.to_vec();
    order.shuffle(rng);
    if mode == BalanceMode::Scramble {
        order.sort_by(|a, b| weight(b).partial_cmp(&weight(a)).unwrap_or(Ordering::Equal));
    }

    let mut counts = [0usize; 2];
    let mut totals = [0.0f64; 2];
    for player in &mut order {
        let team = if counts[0] != counts[1] {
            if counts[0] < counts[1] {
                Team::Team1
            } else {
                Team::Team2
            }
        } else if totals[1] < totals[0] {
            Team::Team2
        } else {
            Team::Team1
        };
        let slot = match team {
            Team::Team1 => 0,
            Team::Team2 => 1,
        };
        counts[slot] += 1;
        totals[slot] += weight(player);
        player.assignment = team.into();
    }

    ensure_captains(&mut order);
    order
}

/// Leaves exactly one captain on every non-empty team.
///
/// An existing captain is kept (the earliest-joined if several claim it);
/// otherwise the earliest-joined real member is promoted. Waiting room
/// players are never captains.
pub fn ensure_captains(players: &mut [Player]) {
    for player in players.iter_mut() {
        if player.assignment == Assignment::WaitingRoom || player.placeholder {
            player.captain = false;
        }
    }

    for team in [Team::Team1, Team::Team2] {
        let members: Vec<usize> = (0..players.len())
            .filter(|&i| players[i].team() == Some(team))
            .collect();
        let chosen = earliest(players, members.iter().copied().filter(|&i| players[i].captain))
            .or_else(|| {
                earliest(
                    players,
                    members.iter().copied().filter(|&i| !players[i].placeholder),
                )
            })
            .or_else(|| earliest(players, members.iter().copied()));

        for &i in &members {
            players[i].captain = Some(i) == chosen;
        }
    }
}

fn earliest(players: &[Player], candidates: impl Iterator<Item = usize>) -> Option<usize> {
    candidates.min_by_key(|&i| (players[i].joined_at, players[i].user_id))
}

/// The captain of `team`, if one is flagged.
pub fn captain_of(players: &[Player], team: Team) -> Option<&Player> {
    players
        .iter()
        .find(|player| player.captain && player.team() == Some(team))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rated(user_id: UserId, joined_at: u64, tier: Option<u8>, rating: Option<f64>) -> Player {
        let mut player = Player::new(user_id, format!("player{}", user_id), joined_at);
        player.skill = SkillRating { tier, rating };
        player
    }

    #[test]
    fn test_skill_weight_formula() {
        assert_approx_eq!(SkillRating { tier: Some(7), rating: Some(3000.0) }.weight(), 7.0);
        assert_approx_eq!(SkillRating { tier: None, rating: Some(1500.0) }.weight(), 5.0);
        assert_approx_eq!(SkillRating { tier: None, rating: Some(9000.0) }.weight(), 10.0);
        assert_approx_eq!(SkillRating { tier: None, rating: Some(-20.0) }.weight(), 0.0);
        assert_approx_eq!(SkillRating::default().weight(), 0.0);
    }

    #[test]
    fn test_balance_sizes_differ_by_at_most_one() {
        let players: Vec<Player> = (1..=7).map(|id| rated(id, id, Some(5), None)).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let result = balance(&players, BalanceMode::Random, &mut rng);

        let team1 = result.iter().filter(|p| p.team() == Some(Team::Team1)).count();
        let team2 = result.iter().filter(|p| p.team() == Some(Team::Team2)).count();
        assert_eq!(team1 + team2, 7);
        assert!(team1.abs_diff(team2) <= 1);
        assert!(result.iter().all(|p| p.assignment != Assignment::WaitingRoom));
    }

    #[test]
    fn test_scramble_spreads_strongest_players() {
        let players = vec![
            rated(1, 1, Some(10), None),
            rated(2, 2, Some(9), None),
            rated(3, 3, Some(2), None),
            rated(4, 4, Some(1), None),
        ];
        let mut rng = StdRng::seed_from_u64(5);
        let result = balance(&players, BalanceMode::Scramble, &mut rng);

        let team_of = |id: UserId| result.iter().find(|p| p.user_id == id).unwrap().team();
        assert_ne!(team_of(1), team_of(2));
        assert_ne!(team_of(3), team_of(4));

        let total = |team: Team| -> f64 {
            result
                .iter()
                .filter(|p| p.team() == Some(team))
                .map(|p| p.skill.weight())
                .sum()
        };
        assert_approx_eq!(total(Team::Team1), 11.0);
        assert_approx_eq!(total(Team::Team2), 11.0);
    }

    #[test]
    fn test_balance_assigns_one_captain_per_team() {
        let players: Vec<Player> = (1..=6).map(|id| rated(id, 100 - id, None, None)).collect();
        let mut rng = StdRng::seed_from_u64(9);
        let result = balance(&players, BalanceMode::Random, &mut rng);

        for team in [Team::Team1, Team::Team2] {
            let captains: Vec<&Player> = result
                .iter()
                .filter(|p| p.captain && p.team() == Some(team))
                .collect();
            assert_eq!(captains.len(), 1);
            let earliest = result
                .iter()
                .filter(|p| p.team() == Some(team))
                .map(|p| p.joined_at)
                .min()
                .unwrap();
            assert_eq!(captains[0].joined_at, earliest);
        }
    }

    #[test]
    fn test_ensure_captains_keeps_existing_captain() {
        let mut players = vec![rated(1, 1, None, None), rated(2, 2, None, None)];
        players[0].assignment = Assignment::Team1;
        players[1].assignment = Assignment::Team1;
        players[1].captain = true;

        ensure_captains(&mut players);
        assert!(!players[0].captain);
        assert!(players[1].captain);
    }

    #[test]
    fn test_ensure_captains_skips_placeholders_and_waiting_room() {
        let mut players = vec![
            rated(1, 1, None, None),
            rated(2, 2, None, None),
            rated(3, 3, None, None),
        ];
        players[0].assignment = Assignment::Team2;
        players[0].placeholder = true;
        players[1].assignment = Assignment::Team2;
        players[2].captain = true;

        ensure_captains(&mut players);
        assert!(!players[0].captain);
        assert!(players[1].captain);
        assert!(!players[2].captain);
        assert_eq!(captain_of(&players, Team::Team2).unwrap().user_id, 2);
        assert!(captain_of(&players, Team::Team1).is_none());
    }

    #[test]
    fn test_ensure_captains_resolves_duplicate_flags() {
        let mut players = vec![rated(1, 50, None, None), rated(2, 10, None, None)];
        for player in &mut players {
            player.assignment = Assignment::Team1;
            player.captain = true;
        }
        ensure_captains(&mut players);
        assert!(!players[0].captain);
        assert!(players[1].captain);
    }
}
