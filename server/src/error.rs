use crate::store::StoreError;
use shared::{VetoError, VetoMode};
use thiserror::Error;

/// Reasons a lobby or veto request is refused.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Veto(#[from] VetoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored veto state is corrupt: {0}")]
    CorruptState(#[from] serde_json::Error),
    #[error("only the lobby creator can do that")]
    NotCreator,
    #[error("you are not in this lobby")]
    NotInLobby,
    #[error("you are not on a team")]
    NotOnTeam,
    #[error("only your team's captain can ban")]
    NotCaptain,
    #[error("you are not eligible to vote this turn")]
    NotEligibleVoter,
    #[error("this lobby uses {0:?} veto mode")]
    WrongVetoMode(VetoMode),
    #[error("both teams need at least one player")]
    TeamsIncomplete,
    #[error("teams are locked once the veto has started")]
    RosterLocked,
}
