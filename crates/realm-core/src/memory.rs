//! In-memory [`GameStore`] for tests and single-process demos.
//!
//! Compare-and-swap semantics match the `PostgreSQL` store: every mutation
//! checks the expected prior state under one lock. Fault injection hooks
//! let tests exercise the scheduler's retry and skip paths.

use std::collections::{BTreeMap, HashMap};
use std::future::{Future, ready};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use realm_types::{
    AllianceStanding, Battle, BattleId, Building, BuildingType, Garrison, PlayerId, Village,
    VillageId, WorldEvent,
};

use crate::error::StoreError;
use crate::store::{AccrualCommit, BattleTransition, GameStore, UpgradeOrder};

#[derive(Debug, Default)]
struct Inner {
    villages: BTreeMap<VillageId, Village>,
    buildings: BTreeMap<(VillageId, BuildingType), Building>,
    garrisons: HashMap<VillageId, Garrison>,
    battles: BTreeMap<BattleId, Battle>,
    events: Vec<WorldEvent>,
    technologies: HashMap<PlayerId, BTreeMap<String, u32>>,
    alliances: HashMap<PlayerId, AllianceStanding>,
    broken_villages: Vec<VillageId>,
}

/// A [`GameStore`] held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    transient_failures: AtomicU32,
    interleave_reads: AtomicBool,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume one injected transient failure, if any remain.
    fn check_transient(&self) -> Result<(), StoreError> {
        let taken = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(StoreError::Transient(String::from("injected timeout")));
        }
        Ok(())
    }

    fn check_village(&self, id: VillageId) -> Result<(), StoreError> {
        self.check_transient()?;
        if self.lock().broken_villages.contains(&id) {
            return Err(StoreError::Backend(format!("village {id} row is corrupt")));
        }
        Ok(())
    }

    // -- seeding ------------------------------------------------------------

    /// Insert or replace a village.
    pub fn insert_village(&self, village: Village) {
        self.lock().villages.insert(village.id, village);
    }

    /// Insert or replace a building.
    pub fn insert_building(&self, building: Building) {
        self.lock()
            .buildings
            .insert((building.village_id, building.building_type), building);
    }

    /// Replace a village's garrison.
    pub fn set_garrison(&self, village_id: VillageId, garrison: Garrison) {
        self.lock().garrisons.insert(village_id, garrison);
    }

    /// Add a world event.
    pub fn insert_event(&self, event: WorldEvent) {
        self.lock().events.push(event);
    }

    /// Replace a player's technology levels.
    pub fn set_technologies(&self, player: PlayerId, levels: BTreeMap<String, u32>) {
        self.lock().technologies.insert(player, levels);
    }

    /// Put a player in an alliance.
    pub fn set_alliance(&self, player: PlayerId, standing: AllianceStanding) {
        self.lock().alliances.insert(player, standing);
    }

    // -- fault injection ----------------------------------------------------

    /// Make the next `count` store calls fail with [`StoreError::Transient`].
    pub fn fail_transiently(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make village reads yield to the runtime after taking their snapshot,
    /// so callers joined on one task all read before any of them commits.
    pub fn interleave_reads(&self, on: bool) {
        self.interleave_reads.store(on, Ordering::SeqCst);
    }

    /// Make every read of a village fail with [`StoreError::Backend`].
    pub fn break_village(&self, id: VillageId) {
        self.lock().broken_villages.push(id);
    }

    // -- inspection ---------------------------------------------------------

    /// Current copy of a village.
    pub fn village(&self, id: VillageId) -> Option<Village> {
        self.lock().villages.get(&id).cloned()
    }

    /// Current copy of a building.
    pub fn building(&self, village_id: VillageId, building_type: BuildingType) -> Option<Building> {
        self.lock()
            .buildings
            .get(&(village_id, building_type))
            .cloned()
    }

    /// Current copy of a battle.
    pub fn battle(&self, id: BattleId) -> Option<Battle> {
        self.lock().battles.get(&id).cloned()
    }
}

impl GameStore for MemoryStore {
    fn list_village_ids(&self) -> impl Future<Output = Result<Vec<VillageId>, StoreError>> + Send {
        let result = self
            .check_transient()
            .map(|()| self.lock().villages.keys().copied().collect());
        ready(result)
    }

    fn get_village(
        &self,
        id: VillageId,
    ) -> impl Future<Output = Result<Option<Village>, StoreError>> + Send {
        let result = self
            .check_village(id)
            .map(|()| self.lock().villages.get(&id).cloned());
        let interleave = self.interleave_reads.load(Ordering::SeqCst);
        async move {
            if interleave {
                tokio::task::yield_now().await;
            }
            result
        }
    }

    fn get_buildings(
        &self,
        village_id: VillageId,
    ) -> impl Future<Output = Result<Vec<Building>, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            self.lock()
                .buildings
                .range((village_id, BuildingType::TownHall)..=(village_id, BuildingType::Wall))
                .map(|(_, b)| b.clone())
                .collect()
        });
        ready(result)
    }

    fn commit_accrual(
        &self,
        commit: AccrualCommit,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            let mut inner = self.lock();
            match inner.villages.get_mut(&commit.village_id) {
                Some(v) if v.last_accrual_time == commit.expected_last_accrual => {
                    v.resources = v.resources.saturating_add(&commit.delta);
                    v.last_accrual_time = commit.accrued_until;
                    true
                }
                _ => false,
            }
        });
        ready(result)
    }

    fn get_due_upgrades(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Building>, StoreError>> + Send {
        let result = self.check_village(village_id).map(|()| {
            self.lock()
                .buildings
                .values()
                .filter(|b| b.village_id == village_id && b.is_due(now))
                .cloned()
                .collect()
        });
        ready(result)
    }

    fn begin_upgrade(
        &self,
        order: UpgradeOrder,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            let mut inner = self.lock();
            let key = (order.village_id, order.building_type);
            let idle_at_level = inner
                .buildings
                .get(&key)
                .map_or(order.from_level == 0, |b| {
                    !b.is_upgrading && b.level == order.from_level
                });
            if !idle_at_level {
                return false;
            }
            let Some(village) = inner.villages.get_mut(&order.village_id) else {
                return false;
            };
            let Some(remaining) = village.resources.checked_sub(&order.cost) else {
                return false;
            };
            village.resources = remaining;
            let building = inner.buildings.entry(key).or_insert_with(|| {
                Building::idle(order.village_id, order.building_type, order.from_level)
            });
            building.is_upgrading = true;
            building.upgrade_completion_time = Some(order.completes_at);
            true
        });
        ready(result)
    }

    fn complete_upgrade(
        &self,
        village_id: VillageId,
        building_type: BuildingType,
        from_level: u32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            let mut inner = self.lock();
            match inner.buildings.get_mut(&(village_id, building_type)) {
                Some(b) if b.level == from_level && b.is_due(now) => {
                    b.level = b.level.saturating_add(1);
                    b.is_upgrading = false;
                    b.upgrade_completion_time = None;
                    true
                }
                _ => false,
            }
        });
        ready(result)
    }

    fn get_garrison(
        &self,
        village_id: VillageId,
    ) -> impl Future<Output = Result<Garrison, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            self.lock()
                .garrisons
                .get(&village_id)
                .cloned()
                .unwrap_or_default()
        });
        ready(result)
    }

    fn insert_battle(&self, battle: &Battle) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            self.lock().battles.insert(battle.id, battle.clone());
        });
        ready(result)
    }

    fn get_battle(
        &self,
        id: BattleId,
    ) -> impl Future<Output = Result<Option<Battle>, StoreError>> + Send {
        let result = self
            .check_transient()
            .map(|()| self.lock().battles.get(&id).cloned());
        ready(result)
    }

    fn transition_battle(
        &self,
        transition: BattleTransition,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            let mut inner = self.lock();
            match inner.battles.get_mut(&transition.battle_id) {
                Some(b) if b.status == transition.from => {
                    b.status = transition.to;
                    if transition.result.is_some() {
                        b.result = transition.result;
                    }
                    if transition.finished_at.is_some() {
                        b.finished_at = transition.finished_at;
                    }
                    true
                }
                _ => false,
            }
        });
        ready(result)
    }

    fn get_due_battles(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<BattleId>, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            let inner = self.lock();
            let mut due: Vec<&Battle> = inner
                .battles
                .values()
                .filter(|b| !b.status.is_terminal() && b.scheduled_at <= now)
                .collect();
            due.sort_by_key(|b| b.scheduled_at);
            due.iter().map(|b| b.id).collect()
        });
        ready(result)
    }

    fn get_active_events(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<WorldEvent>, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            self.lock()
                .events
                .iter()
                .filter(|e| e.is_active(now))
                .cloned()
                .collect()
        });
        ready(result)
    }

    fn get_technology_levels(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<BTreeMap<String, u32>, StoreError>> + Send {
        let result = self.check_transient().map(|()| {
            self.lock()
                .technologies
                .get(&player)
                .cloned()
                .unwrap_or_default()
        });
        ready(result)
    }

    fn get_alliance_standing(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<Option<AllianceStanding>, StoreError>> + Send {
        let result = self
            .check_transient()
            .map(|()| self.lock().alliances.get(&player).copied());
        ready(result)
    }
}
