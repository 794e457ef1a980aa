//! Error types for the simulation core.
//!
//! [`StoreError`] is what a [`GameStore`](crate::store::GameStore) backend
//! reports. [`GameError`] is what every core operation returns; its
//! [`kind`](GameError::kind) decides whether the caller sees it, whether the
//! scheduler retries it, and at which level it is logged.

use realm_types::{BattleId, BattleStatus, BuildingType, UnitType, VillageId};

use crate::construction::UnmetRequirement;

/// Failure reported by a store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or timed out. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The backend rejected the operation or returned malformed data.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Classification of a [`GameError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input from the caller. Returned, never retried, never logged as a failure.
    Validation,
    /// Infrastructure hiccup. Retried with bounded backoff by the scheduler.
    Transient,
    /// A defect: the operation would break a game invariant. Logged at error.
    Invariant,
}

/// Errors returned by core operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GameError {
    /// The village does not exist.
    #[error("village {0} not found")]
    VillageNotFound(VillageId),

    /// The battle does not exist.
    #[error("battle {0} not found")]
    BattleNotFound(BattleId),

    /// The principal does not own the village.
    #[error("village {0} is not owned by the requesting player")]
    NotOwner(VillageId),

    /// The principal is not the attacker of the battle.
    #[error("battle {0} was not started by the requesting player")]
    NotAttacker(BattleId),

    /// The building type has no catalog entry.
    #[error("building type {0} is not in the catalog")]
    UnknownBuilding(BuildingType),

    /// The unit type has no catalog entry.
    #[error("unit type {0} is not in the catalog")]
    UnknownUnit(UnitType),

    /// An upgrade is already in flight for this building.
    #[error("{0} is already upgrading")]
    AlreadyUpgrading(BuildingType),

    /// The building has no due upgrade to complete.
    #[error("{0} has no upgrade due")]
    UpgradeNotDue(BuildingType),

    /// The upgrade cannot be enqueued; every unmet requirement is listed.
    #[error("requirements not met: {}", summarize(.0))]
    RequirementsNotMet(Vec<UnmetRequirement>),

    /// The attack request is malformed.
    #[error("invalid army: {0}")]
    InvalidArmy(String),

    /// The attacker garrison does not hold enough units of a type.
    #[error("not enough {unit_type}: requested {requested}, available {available}")]
    InsufficientUnits {
        /// The unit type.
        unit_type: UnitType,
        /// Units requested.
        requested: u64,
        /// Units in the garrison.
        available: u64,
    },

    /// The battle is no longer pending and cannot be cancelled.
    #[error("battle {id} is {status} and can no longer be cancelled")]
    BattleNotPending {
        /// The battle.
        id: BattleId,
        /// Its current status.
        status: BattleStatus,
    },

    /// A concurrent writer changed the row between check and commit.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    /// The battle already reached a terminal state.
    #[error("battle {0} is already resolved")]
    AlreadyResolved(BattleId),

    /// A computation produced a value that would break a ledger invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GameError {
    /// Classify the error for propagation and logging.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyResolved(_) | Self::Invariant(_) => ErrorKind::Invariant,
            Self::Store(StoreError::Transient(_)) => ErrorKind::Transient,
            Self::Store(StoreError::Backend(_)) => ErrorKind::Invariant,
            _ => ErrorKind::Validation,
        }
    }

    /// Whether the scheduler should retry the item.
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

fn summarize(unmet: &[UnmetRequirement]) -> String {
    unmet
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
