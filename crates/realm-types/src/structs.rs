//! Core entity structs for the Realm simulation engine.
//!
//! Villages and buildings are owned by the relational store; the engine only
//! holds copies of them for the duration of a single processing pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{BattleOutcome, BattleStatus, BuildingType, Resource, Terrain, UnitType, Weather};
use crate::ids::{AllianceId, BattleId, HeroId, PlayerId, VillageId, WorldEventId};

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// The authenticated identity performing an operation.
///
/// Supplied by the request layer and passed explicitly into every core
/// operation; never read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// The player account.
    pub player_id: PlayerId,
    /// Display name, also the membership key in chat channels.
    pub username: String,
}

impl Principal {
    /// Build a principal from its parts.
    pub fn new(player_id: PlayerId, username: impl Into<String>) -> Self {
        Self {
            player_id,
            username: username.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource ledger
// ---------------------------------------------------------------------------

/// Quantities of the four village resources.
///
/// Unsigned by construction: a ledger can never hold a negative amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLedger {
    /// Wood amount.
    pub wood: u64,
    /// Stone amount.
    pub stone: u64,
    /// Food amount.
    pub food: u64,
    /// Gold amount.
    pub gold: u64,
}

impl ResourceLedger {
    /// A ledger with every resource at zero.
    pub const ZERO: Self = Self {
        wood: 0,
        stone: 0,
        food: 0,
        gold: 0,
    };

    /// Build a ledger from the four amounts.
    pub const fn new(wood: u64, stone: u64, food: u64, gold: u64) -> Self {
        Self {
            wood,
            stone,
            food,
            gold,
        }
    }

    /// Amount of a single resource.
    pub const fn get(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Wood => self.wood,
            Resource::Stone => self.stone,
            Resource::Food => self.food,
            Resource::Gold => self.gold,
        }
    }

    /// Overwrite the amount of a single resource.
    pub const fn set(&mut self, resource: Resource, amount: u64) {
        match resource {
            Resource::Wood => self.wood = amount,
            Resource::Stone => self.stone = amount,
            Resource::Food => self.food = amount,
            Resource::Gold => self.gold = amount,
        }
    }

    /// Per-resource saturating addition.
    #[must_use]
    pub const fn saturating_add(&self, other: &Self) -> Self {
        Self {
            wood: self.wood.saturating_add(other.wood),
            stone: self.stone.saturating_add(other.stone),
            food: self.food.saturating_add(other.food),
            gold: self.gold.saturating_add(other.gold),
        }
    }

    /// Per-resource subtraction; `None` if any resource would go negative.
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        Some(Self {
            wood: self.wood.checked_sub(other.wood)?,
            stone: self.stone.checked_sub(other.stone)?,
            food: self.food.checked_sub(other.food)?,
            gold: self.gold.checked_sub(other.gold)?,
        })
    }

    /// Whether every resource in `self` is at least the amount in `cost`.
    pub const fn covers(&self, cost: &Self) -> bool {
        self.wood >= cost.wood
            && self.stone >= cost.stone
            && self.food >= cost.food
            && self.gold >= cost.gold
    }

    /// Whether every resource is zero.
    pub const fn is_zero(&self) -> bool {
        self.wood == 0 && self.stone == 0 && self.food == 0 && self.gold == 0
    }

    /// Iterate `(resource, amount)` pairs in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = (Resource, u64)> + '_ {
        Resource::ALL.iter().map(|r| (*r, self.get(*r)))
    }
}

// ---------------------------------------------------------------------------
// Village and buildings
// ---------------------------------------------------------------------------

/// A player-owned settlement; the unit of resource and building state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Village {
    /// Unique identifier.
    pub id: VillageId,
    /// Owning player.
    pub owner: PlayerId,
    /// Display name.
    pub name: String,
    /// Map x coordinate.
    pub x: i32,
    /// Map y coordinate.
    pub y: i32,
    /// Current resource stock.
    pub resources: ResourceLedger,
    /// Instant up to which production has been credited.
    pub last_accrual_time: DateTime<Utc>,
    /// When the village was founded.
    pub created_at: DateTime<Utc>,
}

impl Village {
    /// Euclidean distance in map tiles to another village.
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        dx.hypot(dy)
    }
}

/// A building in a village. `(village_id, building_type)` is unique.
///
/// Invariant: `is_upgrading` is true exactly when `upgrade_completion_time`
/// is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    /// The village this building belongs to.
    pub village_id: VillageId,
    /// The building type.
    pub building_type: BuildingType,
    /// Current completed level (0 = not yet built).
    pub level: u32,
    /// Whether an upgrade is in flight.
    pub is_upgrading: bool,
    /// When the in-flight upgrade finishes.
    pub upgrade_completion_time: Option<DateTime<Utc>>,
}

impl Building {
    /// A fresh, idle building at the given level.
    pub const fn idle(village_id: VillageId, building_type: BuildingType, level: u32) -> Self {
        Self {
            village_id,
            building_type,
            level,
            is_upgrading: false,
            upgrade_completion_time: None,
        }
    }

    /// Whether the in-flight upgrade is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_upgrading && self.upgrade_completion_time.is_some_and(|t| t <= now)
    }
}

/// Record returned when a queued upgrade is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// The village.
    pub village_id: VillageId,
    /// The building that finished.
    pub building_type: BuildingType,
    /// Level before completion.
    pub old_level: u32,
    /// Level after completion.
    pub new_level: u32,
    /// Cost that was deducted when the upgrade was enqueued.
    pub resources_spent: ResourceLedger,
    /// When the completion was committed.
    pub completed_at: DateTime<Utc>,
}

/// Per-resource production, in units per accrual period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRates {
    /// Base rate per resource (sum of level x per-level rate).
    pub base: BTreeMap<Resource, f64>,
    /// Bonus multiplier per resource (`1 + sum of bonus percentages`).
    pub multiplier: BTreeMap<Resource, f64>,
    /// Effective rate per resource (`base x multiplier`).
    pub effective: BTreeMap<Resource, f64>,
    /// Length of one accrual period in seconds.
    pub period_secs: u64,
}

// ---------------------------------------------------------------------------
// Bonus inputs
// ---------------------------------------------------------------------------

/// An active world-wide event granting a production bonus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
    /// Unique identifier.
    pub id: WorldEventId,
    /// Display name.
    pub name: String,
    /// Resource the bonus applies to; `None` applies to all.
    pub resource: Option<Resource>,
    /// Additive bonus fraction (0.10 = +10%).
    pub bonus_pct: f64,
    /// Start of the event window.
    pub starts_at: DateTime<Utc>,
    /// End of the event window (exclusive).
    pub ends_at: DateTime<Utc>,
}

impl WorldEvent {
    /// Whether the event is running at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }
}

/// An alliance's progression, read by the accrual bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllianceStanding {
    /// The alliance.
    pub alliance_id: AllianceId,
    /// Alliance level.
    pub level: u32,
    /// Accumulated alliance experience.
    pub experience: u64,
}

// ---------------------------------------------------------------------------
// Armies and battles
// ---------------------------------------------------------------------------

/// A count of one unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStack {
    /// The unit type.
    pub unit_type: UnitType,
    /// Number of units.
    pub count: u32,
}

/// A hero accompanying an army.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeroSnapshot {
    /// The hero.
    pub hero_id: HeroId,
    /// Hero level at snapshot time.
    pub level: u32,
}

/// Units and heroes stationed in a village.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Garrison {
    /// Unit counts.
    pub units: Vec<UnitStack>,
    /// Heroes present.
    pub heroes: Vec<HeroSnapshot>,
}

impl Garrison {
    /// Total count of one unit type.
    pub fn count_of(&self, unit_type: UnitType) -> u64 {
        self.units
            .iter()
            .filter(|s| s.unit_type == unit_type)
            .map(|s| u64::from(s.count))
            .sum()
    }
}

/// One side of a battle, frozen when the attack was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmySnapshot {
    /// Unit counts.
    pub units: Vec<UnitStack>,
    /// Heroes leading the army.
    pub heroes: Vec<HeroSnapshot>,
    /// Technology levels of the owning player, keyed by technology name.
    pub technologies: BTreeMap<String, u32>,
}

/// Multipliers applied to attack power, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppliedModifiers {
    /// Terrain multiplier.
    pub terrain: f64,
    /// Weather multiplier.
    pub weather: f64,
    /// Hero multiplier.
    pub hero: f64,
    /// Technology multiplier.
    pub technology: f64,
}

/// The committed outcome of a battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleResult {
    /// Outcome class.
    pub outcome: BattleOutcome,
    /// Raw attack power before modifiers.
    pub raw_attack_power: f64,
    /// Attack power after modifiers.
    pub attack_power: f64,
    /// Defense power.
    pub defense_power: f64,
    /// Modifiers applied to attack power.
    pub modifiers: AppliedModifiers,
    /// Number of rounds fought (3--10).
    pub rounds: u32,
    /// Aggregate attacker losses in power units.
    pub attacker_losses: f64,
    /// Aggregate defender losses in power units.
    pub defender_losses: f64,
    /// Experience awarded to the attacker.
    pub experience: u32,
    /// Resources carried off by the attacker (zero on defeat).
    pub plunder: ResourceLedger,
    /// When the result was computed.
    pub resolved_at: DateTime<Utc>,
}

/// A battle between two villages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battle {
    /// Unique identifier.
    pub id: BattleId,
    /// Attacking village.
    pub attacker_village: VillageId,
    /// Defending village.
    pub defender_village: VillageId,
    /// Attacking player.
    pub attacker_player: PlayerId,
    /// Defending player.
    pub defender_player: PlayerId,
    /// Attacker army snapshot.
    pub attacker: ArmySnapshot,
    /// Defender army snapshot.
    pub defender: ArmySnapshot,
    /// Terrain of the battlefield.
    pub terrain: Terrain,
    /// Weather during the battle.
    pub weather: Weather,
    /// Lifecycle status.
    pub status: BattleStatus,
    /// Outcome payload, present once resolved.
    pub result: Option<BattleResult>,
    /// When the attack was requested.
    pub created_at: DateTime<Utc>,
    /// When the armies meet and the battle becomes due for resolution.
    pub scheduled_at: DateTime<Utc>,
    /// When the battle reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Public summary of a village, used in battle details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VillageSummary {
    /// Village identifier.
    pub id: VillageId,
    /// Owner.
    pub owner: PlayerId,
    /// Display name.
    pub name: String,
    /// Map x coordinate.
    pub x: i32,
    /// Map y coordinate.
    pub y: i32,
}

impl From<&Village> for VillageSummary {
    fn from(v: &Village) -> Self {
        Self {
            id: v.id,
            owner: v.owner,
            name: v.name.clone(),
            x: v.x,
            y: v.y,
        }
    }
}

/// A battle joined with both village summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleDetails {
    /// The battle row.
    pub battle: Battle,
    /// Attacker village, if it still exists.
    pub attacker_village: Option<VillageSummary>,
    /// Defender village, if it still exists.
    pub defender_village: Option<VillageSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_checked_sub_rejects_negative() {
        let have = ResourceLedger::new(100, 50, 10, 0);
        assert_eq!(
            have.checked_sub(&ResourceLedger::new(40, 50, 0, 0)),
            Some(ResourceLedger::new(60, 0, 10, 0))
        );
        assert_eq!(have.checked_sub(&ResourceLedger::new(0, 0, 0, 1)), None);
    }

    #[test]
    fn ledger_covers() {
        let have = ResourceLedger::new(10, 10, 10, 10);
        assert!(have.covers(&ResourceLedger::new(10, 0, 5, 10)));
        assert!(!have.covers(&ResourceLedger::new(11, 0, 0, 0)));
    }

    #[test]
    fn building_due_only_when_upgrading() {
        let now = Utc::now();
        let mut b = Building::idle(VillageId::new(), BuildingType::Farm, 1);
        assert!(!b.is_due(now));
        b.is_upgrading = true;
        b.upgrade_completion_time = Some(now);
        assert!(b.is_due(now));
        b.upgrade_completion_time = Some(now + chrono::Duration::seconds(1));
        assert!(!b.is_due(now));
    }
}
