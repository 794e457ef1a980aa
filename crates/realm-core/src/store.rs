//! The relational store seam.
//!
//! [`GameStore`] is the only way the core reads or writes villages,
//! buildings and battles. Every mutating method is a single-entity
//! compare-and-swap: it commits only if the row still holds the expected
//! prior state and reports whether it did. This is what makes accrual,
//! upgrade completion and battle resolution exactly-once under overlapping
//! sweeps or multiple scheduler instances.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use realm_types::{
    AllianceStanding, Battle, BattleId, BattleResult, BattleStatus, Building, BuildingType,
    Garrison, PlayerId, ResourceLedger, Village, VillageId, WorldEvent,
};

use crate::error::StoreError;

/// An accrual commit: credit `delta` and advance the accrual timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualCommit {
    /// The village.
    pub village_id: VillageId,
    /// `last_accrual_time` the delta was computed from.
    pub expected_last_accrual: DateTime<Utc>,
    /// Resources to credit.
    pub delta: ResourceLedger,
    /// New `last_accrual_time`.
    pub accrued_until: DateTime<Utc>,
}

/// An upgrade enqueue: deduct `cost` and mark the building as upgrading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeOrder {
    /// The village.
    pub village_id: VillageId,
    /// The building; created at level 0 if the village lacks it.
    pub building_type: BuildingType,
    /// Level the building must currently be at.
    pub from_level: u32,
    /// Resources to deduct.
    pub cost: ResourceLedger,
    /// When the upgrade finishes.
    pub completes_at: DateTime<Utc>,
}

/// A battle status change.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleTransition {
    /// The battle.
    pub battle_id: BattleId,
    /// Status the row must currently hold.
    pub from: BattleStatus,
    /// Status to write.
    pub to: BattleStatus,
    /// Result payload, written with `Resolved`.
    pub result: Option<BattleResult>,
    /// Terminal timestamp, written with `Resolved` and `Cancelled`.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Entity access used by the simulation core.
///
/// Reads return `Ok(None)` / empty collections for missing rows. Mutations
/// return `Ok(false)` when the expected prior state no longer holds.
pub trait GameStore: Send + Sync + 'static {
    /// Every village in the world.
    fn list_village_ids(&self) -> impl Future<Output = Result<Vec<VillageId>, StoreError>> + Send;

    /// One village.
    fn get_village(
        &self,
        id: VillageId,
    ) -> impl Future<Output = Result<Option<Village>, StoreError>> + Send;

    /// Every building of a village.
    fn get_buildings(
        &self,
        village_id: VillageId,
    ) -> impl Future<Output = Result<Vec<Building>, StoreError>> + Send;

    /// Credit an accrual if `last_accrual_time` still equals the expected value.
    fn commit_accrual(
        &self,
        commit: AccrualCommit,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Buildings of a village with `is_upgrading` and completion time `<= now`.
    fn get_due_upgrades(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Building>, StoreError>> + Send;

    /// Deduct the cost and start the upgrade, if the building is idle at
    /// `from_level` and the ledger still covers the cost.
    fn begin_upgrade(
        &self,
        order: UpgradeOrder,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Increment the level and clear the upgrade flag, if the building is
    /// still upgrading from `from_level` and is due at `now`.
    fn complete_upgrade(
        &self,
        village_id: VillageId,
        building_type: BuildingType,
        from_level: u32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Units and heroes stationed in a village.
    fn get_garrison(
        &self,
        village_id: VillageId,
    ) -> impl Future<Output = Result<Garrison, StoreError>> + Send;

    /// Persist a newly created battle.
    fn insert_battle(&self, battle: &Battle) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// One battle.
    fn get_battle(
        &self,
        id: BattleId,
    ) -> impl Future<Output = Result<Option<Battle>, StoreError>> + Send;

    /// Apply a status change if the row still holds `transition.from`.
    fn transition_battle(
        &self,
        transition: BattleTransition,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Non-terminal battles whose `scheduled_at <= now`, oldest first.
    fn get_due_battles(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<BattleId>, StoreError>> + Send;

    /// World events whose window contains `now`.
    fn get_active_events(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<WorldEvent>, StoreError>> + Send;

    /// Researched technology levels of a player, keyed by name.
    fn get_technology_levels(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<BTreeMap<String, u32>, StoreError>> + Send;

    /// The alliance a player belongs to, if any.
    fn get_alliance_standing(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<Option<AllianceStanding>, StoreError>> + Send;
}
