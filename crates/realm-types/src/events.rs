//! Domain events emitted by the simulation core.
//!
//! Events are fanned out by the messaging hub to the private `player:<id>`
//! channel of every participant.

use serde::{Deserialize, Serialize};

use crate::ids::{BattleId, PlayerId, VillageId};
use crate::structs::{BattleResult, CompletionRecord};

/// A state change worth telling connected players about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A battle was resolved.
    BattleResolved {
        /// The battle.
        battle_id: BattleId,
        /// Attacking player.
        attacker: PlayerId,
        /// Defending player.
        defender: PlayerId,
        /// The committed result.
        result: BattleResult,
    },
    /// A pending battle was withdrawn by the attacker.
    BattleCancelled {
        /// The battle.
        battle_id: BattleId,
        /// Attacking player.
        attacker: PlayerId,
        /// Defending player.
        defender: PlayerId,
    },
    /// A building upgrade finished.
    UpgradeCompleted {
        /// Village owner.
        owner: PlayerId,
        /// The village.
        village_id: VillageId,
        /// Completion details.
        record: CompletionRecord,
    },
}

impl DomainEvent {
    /// Every player the event concerns, without duplicates.
    pub fn recipients(&self) -> Vec<PlayerId> {
        match self {
            Self::BattleResolved {
                attacker, defender, ..
            }
            | Self::BattleCancelled {
                attacker, defender, ..
            } => {
                if attacker == defender {
                    vec![*attacker]
                } else {
                    vec![*attacker, *defender]
                }
            }
            Self::UpgradeCompleted { owner, .. } => vec![*owner],
        }
    }

    /// Short machine-readable name, used as a log field.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BattleResolved { .. } => "battle_resolved",
            Self::BattleCancelled { .. } => "battle_cancelled",
            Self::UpgradeCompleted { .. } => "upgrade_completed",
        }
    }
}

/// Name of the private notification channel of a player.
pub fn player_channel(player: PlayerId) -> String {
    format!("player:{player}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_battle_notifies_both_sides() {
        let a = PlayerId::new();
        let d = PlayerId::new();
        let event = DomainEvent::BattleCancelled {
            battle_id: BattleId::new(),
            attacker: a,
            defender: d,
        };
        assert_eq!(event.recipients(), vec![a, d]);
        assert_eq!(event.kind(), "battle_cancelled");
    }

    #[test]
    fn player_channel_name() {
        let p = PlayerId::new();
        assert_eq!(player_channel(p), format!("player:{}", p.into_inner()));
    }
}
