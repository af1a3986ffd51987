//! Domain types shared by the scrim coordinator and its clients.
//!
//! Nothing in this crate performs I/O or reads the clock: every operation
//! that depends on time takes the current instant as an argument, which keeps
//! the veto protocol deterministic under test.

pub mod ballot;
pub mod roster;
pub mod veto;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use ballot::PendingVotes;
pub use roster::{Assignment, BalanceMode, Player, SkillRating};
pub use veto::{
    Actor, BanOutcome, BanRecord, BannedBy, Phase, Team, TurnClock, VetoError, VetoState,
};

pub const PROTOCOL_VERSION: u32 = 1;
pub const TURN_WINDOW_MS: u64 = 40_000;
pub const WATCHDOG_INTERVAL_MS: u64 = 1_000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const MAX_DATAGRAM_SIZE: usize = 8192;

pub type LobbyId = u64;
pub type UserId = u64;

/// How bans are submitted during the veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VetoMode {
    /// Each team's captain bans on behalf of the team.
    #[default]
    Captains,
    /// Non-captain members vote and the tally is banned.
    Players,
}

/// Game server instance bound to a lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTarget {
    /// `host:port` of the remote console listener
    pub control_address: String,
    pub rcon_password: String,
}

impl ServerTarget {
    pub fn new(control_address: impl Into<String>, rcon_password: impl Into<String>) -> Self {
        Self {
            control_address: control_address.into(),
            rcon_password: rcon_password.into(),
        }
    }

    /// Splits the control address into host and port.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.control_address.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        port.parse().ok().map(|port| (host, port))
    }
}

/// Datagrams exchanged between the coordinator and its clients.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
        user_id: UserId,
    },
    CreateLobby {
        map_pool: Vec<String>,
        veto_mode: VetoMode,
        server: Option<ServerTarget>,
        connect_password: Option<String>,
    },
    JoinLobby {
        lobby: LobbyId,
        name: String,
        skill: SkillRating,
    },
    LeaveLobby {
        lobby: LobbyId,
    },
    MovePlayer {
        lobby: LobbyId,
        user_id: UserId,
        assignment: Assignment,
    },
    Balance {
        lobby: LobbyId,
        mode: BalanceMode,
    },
    Subscribe {
        lobby: LobbyId,
    },
    StartMatch {
        lobby: LobbyId,
    },
    Ban {
        lobby: LobbyId,
        map: String,
    },
    Vote {
        lobby: LobbyId,
        maps: Vec<String>,
    },
    Ping,
    Disconnect,

    Connected {
        client_id: u32,
    },
    LobbyCreated {
        lobby: LobbyId,
    },
    LobbyUpdated {
        lobby: LobbyId,
        updated_at: u64,
        veto: VetoState,
        players: Vec<Player>,
    },
    Heartbeat {
        timestamp: u64,
    },
    Rejected {
        reason: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
