//! Construction Queue Processor.
//!
//! Upgrades go through three steps:
//!
//! 1. [`check_requirements`] is a side-effect-free predicate that lists every
//!    unmet requirement (town hall level, prerequisite buildings,
//!    technologies, resources, level cap).
//! 2. [`ConstructionQueue::enqueue_upgrade`] re-runs the check and then
//!    atomically deducts the cost and marks the building as upgrading.
//! 3. [`ConstructionQueue::process_queue`] (driven by the tick scheduler) or
//!    [`ConstructionQueue::complete_upgrade_now`] (explicit client request)
//!    finalizes due upgrades. Production up to the completion instant is
//!    settled at the old levels first; the completion itself never
//!    touches the ledger.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use realm_types::{
    Building, BuildingType, CompletionRecord, DomainEvent, Principal, Resource, ResourceLedger,
    Village, VillageId,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::accrual::ResourceAccrual;
use crate::config::{BuildingSpec, GameConfig};
use crate::error::GameError;
use crate::events::EventSink;
use crate::store::{GameStore, UpgradeOrder};

/// One requirement an upgrade does not meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "requirement", rename_all = "snake_case")]
pub enum UnmetRequirement {
    /// The target level is above the catalog cap.
    MaxLevel {
        /// Highest reachable level.
        max: u32,
    },
    /// The target level is not the next level of the building.
    NotNextLevel {
        /// The only level that can be enqueued.
        next: u32,
    },
    /// The town hall is too low.
    TownHallLevel {
        /// Required town hall level.
        required: u32,
        /// Current town hall level.
        current: u32,
    },
    /// A prerequisite building is missing or too low.
    Building {
        /// The prerequisite.
        building_type: BuildingType,
        /// Required level.
        required: u32,
        /// Current level.
        current: u32,
    },
    /// A technology is not researched far enough.
    Technology {
        /// Technology name.
        name: String,
        /// Required level.
        required: u32,
        /// Researched level.
        current: u32,
    },
    /// The ledger does not cover the cost.
    Resources {
        /// The short resource.
        resource: Resource,
        /// Amount needed.
        required: u64,
        /// Amount held.
        available: u64,
    },
}

impl fmt::Display for UnmetRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxLevel { max } => write!(f, "maximum level is {max}"),
            Self::NotNextLevel { next } => write!(f, "only level {next} can be built next"),
            Self::TownHallLevel { required, current } => {
                write!(f, "town hall level {required} required (have {current})")
            }
            Self::Building {
                building_type,
                required,
                current,
            } => write!(f, "{building_type} level {required} required (have {current})"),
            Self::Technology {
                name,
                required,
                current,
            } => write!(f, "technology {name} level {required} required (have {current})"),
            Self::Resources {
                resource,
                required,
                available,
            } => write!(f, "{required} {resource} required (have {available})"),
        }
    }
}

/// Outcome of a requirement check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequirementCheck {
    /// Whether every requirement is met.
    pub satisfied: bool,
    /// Every unmet requirement, in a stable order.
    pub unmet: Vec<UnmetRequirement>,
    /// Cost of the target level.
    pub cost: ResourceLedger,
}

/// An accepted upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpgradeTicket {
    /// The village.
    pub village_id: VillageId,
    /// The building.
    pub building_type: BuildingType,
    /// Level being built.
    pub target_level: u32,
    /// Resources deducted.
    pub cost: ResourceLedger,
    /// When the upgrade becomes due.
    pub completes_at: DateTime<Utc>,
}

fn level_of(buildings: &[Building], building_type: BuildingType) -> u32 {
    buildings
        .iter()
        .find(|b| b.building_type == building_type)
        .map_or(0, |b| b.level)
}

/// Evaluate every requirement of upgrading `building_type` to `target_level`.
///
/// Pure: reads only its arguments.
pub fn check_requirements(
    spec: &BuildingSpec,
    building_type: BuildingType,
    target_level: u32,
    buildings: &[Building],
    technologies: &BTreeMap<String, u32>,
    resources: &ResourceLedger,
) -> RequirementCheck {
    let mut unmet = Vec::new();

    let next = level_of(buildings, building_type).saturating_add(1);
    if target_level != next {
        unmet.push(UnmetRequirement::NotNextLevel { next });
    }
    if target_level > spec.max_level {
        unmet.push(UnmetRequirement::MaxLevel {
            max: spec.max_level,
        });
    }

    if building_type != BuildingType::TownHall {
        let current = level_of(buildings, BuildingType::TownHall);
        if current < spec.min_town_hall_level {
            unmet.push(UnmetRequirement::TownHallLevel {
                required: spec.min_town_hall_level,
                current,
            });
        }
    }

    for (prerequisite, required) in &spec.prerequisites {
        let current = level_of(buildings, *prerequisite);
        if current < *required {
            unmet.push(UnmetRequirement::Building {
                building_type: *prerequisite,
                required: *required,
                current,
            });
        }
    }

    for (name, required) in &spec.technologies {
        let current = technologies.get(name).copied().unwrap_or(0);
        if current < *required {
            unmet.push(UnmetRequirement::Technology {
                name: name.clone(),
                required: *required,
                current,
            });
        }
    }

    let cost = spec.cost_for_level(target_level);
    for (resource, required) in cost.iter() {
        let available = resources.get(resource);
        if available < required {
            unmet.push(UnmetRequirement::Resources {
                resource,
                required,
                available,
            });
        }
    }

    RequirementCheck {
        satisfied: unmet.is_empty(),
        unmet,
        cost,
    }
}

/// Validates, enqueues and completes building upgrades.
pub struct ConstructionQueue<S> {
    store: Arc<S>,
    config: Arc<GameConfig>,
    events: Arc<dyn EventSink>,
    accrual: ResourceAccrual<S>,
}

impl<S> fmt::Debug for ConstructionQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructionQueue").finish_non_exhaustive()
    }
}

impl<S: GameStore> ConstructionQueue<S> {
    /// Create a processor over a store.
    pub fn new(store: Arc<S>, config: Arc<GameConfig>, events: Arc<dyn EventSink>) -> Self {
        let accrual = ResourceAccrual::new(Arc::clone(&store), Arc::clone(&config));
        Self {
            store,
            config,
            events,
            accrual,
        }
    }

    async fn load_village(&self, village_id: VillageId) -> Result<Village, GameError> {
        self.store
            .get_village(village_id)
            .await?
            .ok_or(GameError::VillageNotFound(village_id))
    }

    async fn load_owned(
        &self,
        principal: &Principal,
        village_id: VillageId,
    ) -> Result<Village, GameError> {
        let village = self.load_village(village_id).await?;
        if village.owner != principal.player_id {
            debug!(%village_id, player = %principal.player_id, "not the village owner");
            return Err(GameError::NotOwner(village_id));
        }
        Ok(village)
    }

    fn spec(&self, building_type: BuildingType) -> Result<&BuildingSpec, GameError> {
        self.config
            .economy
            .building(building_type)
            .ok_or(GameError::UnknownBuilding(building_type))
    }

    /// Side-effect-free check of upgrading a building to `target_level`.
    pub async fn check_requirements(
        &self,
        village_id: VillageId,
        building_type: BuildingType,
        target_level: u32,
    ) -> Result<RequirementCheck, GameError> {
        let spec = self.spec(building_type)?;
        let village = self.load_village(village_id).await?;
        let buildings = self.store.get_buildings(village_id).await?;
        let technologies = self.store.get_technology_levels(village.owner).await?;
        Ok(check_requirements(
            spec,
            building_type,
            target_level,
            &buildings,
            &technologies,
            &village.resources,
        ))
    }

    /// Start upgrading a building to its next level.
    ///
    /// Deducts the level cost and sets the completion time in one
    /// store commit. A building the village lacks is created at level 0.
    pub async fn enqueue_upgrade(
        &self,
        principal: &Principal,
        village_id: VillageId,
        building_type: BuildingType,
        now: DateTime<Utc>,
    ) -> Result<UpgradeTicket, GameError> {
        let spec = self.spec(building_type)?;
        let village = self.load_owned(principal, village_id).await?;
        let buildings = self.store.get_buildings(village_id).await?;
        if buildings
            .iter()
            .any(|b| b.building_type == building_type && b.is_upgrading)
        {
            return Err(GameError::AlreadyUpgrading(building_type));
        }

        let from_level = level_of(&buildings, building_type);
        let target_level = from_level.saturating_add(1);
        let technologies = self.store.get_technology_levels(village.owner).await?;
        let check = check_requirements(
            spec,
            building_type,
            target_level,
            &buildings,
            &technologies,
            &village.resources,
        );
        if !check.satisfied {
            debug!(%village_id, building = %building_type, unmet = check.unmet.len(), "upgrade rejected");
            return Err(GameError::RequirementsNotMet(check.unmet));
        }

        let build_secs = i64::try_from(spec.build_secs_for_level(target_level)).unwrap_or(i64::MAX);
        let completes_at = now
            .checked_add_signed(chrono::Duration::seconds(build_secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let order = UpgradeOrder {
            village_id,
            building_type,
            from_level,
            cost: check.cost,
            completes_at,
        };
        if !self.store.begin_upgrade(order).await? {
            return Err(GameError::Conflict(format!(
                "{building_type} in village {village_id} changed during enqueue"
            )));
        }

        info!(
            %village_id,
            building = %building_type,
            target_level,
            %completes_at,
            "upgrade enqueued"
        );
        Ok(UpgradeTicket {
            village_id,
            building_type,
            target_level,
            cost: check.cost,
            completes_at,
        })
    }

    /// Commit one due upgrade; `None` if another writer completed it first.
    async fn complete(
        &self,
        village: &Village,
        building: &Building,
        now: DateTime<Utc>,
    ) -> Result<Option<CompletionRecord>, GameError> {
        let done = self
            .store
            .complete_upgrade(village.id, building.building_type, building.level, now)
            .await?;
        if !done {
            return Ok(None);
        }
        let new_level = building.level.saturating_add(1);
        let resources_spent = self
            .config
            .economy
            .building(building.building_type)
            .map_or(ResourceLedger::ZERO, |spec| spec.cost_for_level(new_level));
        let record = CompletionRecord {
            village_id: village.id,
            building_type: building.building_type,
            old_level: building.level,
            new_level,
            resources_spent,
            completed_at: now,
        };
        info!(
            village_id = %village.id,
            building = %building.building_type,
            new_level,
            "upgrade completed"
        );
        self.events.emit(DomainEvent::UpgradeCompleted {
            owner: village.owner,
            village_id: village.id,
            record: record.clone(),
        });
        Ok(Some(record))
    }

    /// Finalize every due upgrade of one village.
    ///
    /// A village with nothing due yields an empty list.
    pub async fn process_queue(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompletionRecord>, GameError> {
        let due = self.store.get_due_upgrades(village_id, now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        self.accrual.settle(village_id, now).await?;
        let village = self.load_village(village_id).await?;
        let mut records = Vec::with_capacity(due.len());
        for building in due.iter().filter(|b| b.is_due(now)) {
            if let Some(record) = self.complete(&village, building, now).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Complete one building on explicit request, if its upgrade is due.
    pub async fn complete_upgrade_now(
        &self,
        principal: &Principal,
        village_id: VillageId,
        building_type: BuildingType,
        now: DateTime<Utc>,
    ) -> Result<CompletionRecord, GameError> {
        let village = self.load_owned(principal, village_id).await?;
        let buildings = self.store.get_buildings(village_id).await?;
        let building = buildings
            .iter()
            .find(|b| b.building_type == building_type && b.is_due(now))
            .ok_or(GameError::UpgradeNotDue(building_type))?;
        self.accrual.settle(village_id, now).await?;
        self.complete(&village, building, now)
            .await?
            .ok_or(GameError::UpgradeNotDue(building_type))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::arithmetic_side_effects)]

    use super::*;
    use crate::events::RecordingSink;
    use crate::memory::MemoryStore;
    use realm_types::PlayerId;

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        queue: ConstructionQueue<MemoryStore>,
        village: Village,
        owner: Principal,
    }

    fn fixture(resources: ResourceLedger) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let owner = Principal::new(PlayerId::new(), "alice");
        let now = Utc::now();
        let village = Village {
            id: VillageId::new(),
            owner: owner.player_id,
            name: String::from("Stonebridge"),
            x: 0,
            y: 0,
            resources,
            last_accrual_time: now,
            created_at: now,
        };
        store.insert_village(village.clone());
        store.insert_building(Building::idle(village.id, BuildingType::TownHall, 1));
        let queue = ConstructionQueue::new(
            Arc::clone(&store),
            Arc::new(GameConfig::default()),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        Fixture {
            store,
            sink,
            queue,
            village,
            owner,
        }
    }

    fn upgrading(village_id: VillageId, building_type: BuildingType, level: u32, at: DateTime<Utc>) -> Building {
        Building {
            village_id,
            building_type,
            level,
            is_upgrading: true,
            upgrade_completion_time: Some(at),
        }
    }

    #[test]
    fn check_lists_every_unmet_requirement() {
        let config = GameConfig::default();
        let spec = config.economy.building(BuildingType::Stable).unwrap();
        let vid = VillageId::new();
        let buildings = [Building::idle(vid, BuildingType::TownHall, 2)];
        let check = check_requirements(
            spec,
            BuildingType::Stable,
            1,
            &buildings,
            &BTreeMap::new(),
            &ResourceLedger::ZERO,
        );
        assert!(!check.satisfied);
        assert!(check.unmet.contains(&UnmetRequirement::TownHallLevel {
            required: 5,
            current: 2
        }));
        assert!(check.unmet.contains(&UnmetRequirement::Building {
            building_type: BuildingType::Barracks,
            required: 3,
            current: 0
        }));
        assert!(check.unmet.contains(&UnmetRequirement::Technology {
            name: String::from("horse_breeding"),
            required: 1,
            current: 0
        }));
        assert!(check
            .unmet
            .iter()
            .any(|u| matches!(u, UnmetRequirement::Resources { .. })));
    }

    #[test]
    fn check_passes_when_everything_is_met() {
        let config = GameConfig::default();
        let spec = config.economy.building(BuildingType::Farm).unwrap();
        let vid = VillageId::new();
        let buildings = [Building::idle(vid, BuildingType::TownHall, 1)];
        let check = check_requirements(
            spec,
            BuildingType::Farm,
            1,
            &buildings,
            &BTreeMap::new(),
            &ResourceLedger::new(1000, 1000, 1000, 1000),
        );
        assert!(check.satisfied, "{:?}", check.unmet);
        assert_eq!(check.cost, ResourceLedger::new(40, 40, 0, 0));
    }

    #[test]
    fn check_rejects_skipping_levels_and_cap() {
        let mut config = GameConfig::default();
        if let Some(farm) = config.economy.buildings.get_mut(&BuildingType::Farm) {
            farm.max_level = 1;
        }
        let spec = config.economy.building(BuildingType::Farm).unwrap();
        let vid = VillageId::new();
        let buildings = [
            Building::idle(vid, BuildingType::TownHall, 1),
            Building::idle(vid, BuildingType::Farm, 1),
        ];
        let rich = ResourceLedger::new(u64::MAX, u64::MAX, u64::MAX, u64::MAX);
        let check = check_requirements(spec, BuildingType::Farm, 3, &buildings, &BTreeMap::new(), &rich);
        assert!(check.unmet.contains(&UnmetRequirement::NotNextLevel { next: 2 }));
        assert!(check.unmet.contains(&UnmetRequirement::MaxLevel { max: 1 }));
    }

    #[tokio::test]
    async fn enqueue_deducts_cost_and_sets_flag() {
        let f = fixture(ResourceLedger::new(100, 100, 100, 100));
        let now = Utc::now();
        let ticket = f
            .queue
            .enqueue_upgrade(&f.owner, f.village.id, BuildingType::Farm, now)
            .await
            .unwrap();
        assert_eq!(ticket.target_level, 1);
        assert_eq!(ticket.completes_at, now + chrono::Duration::seconds(60));

        let village = f.store.village(f.village.id).unwrap();
        assert_eq!(village.resources, ResourceLedger::new(60, 60, 100, 100));
        let farm = f.store.building(f.village.id, BuildingType::Farm).unwrap();
        assert!(farm.is_upgrading);
        assert_eq!(farm.upgrade_completion_time, Some(ticket.completes_at));

        let again = f
            .queue
            .enqueue_upgrade(&f.owner, f.village.id, BuildingType::Farm, now)
            .await;
        assert!(matches!(again, Err(GameError::AlreadyUpgrading(BuildingType::Farm))));
    }

    #[tokio::test]
    async fn enqueue_rejects_strangers_and_poor_villages() {
        let f = fixture(ResourceLedger::ZERO);
        let stranger = Principal::new(PlayerId::new(), "mallory");
        let err = f
            .queue
            .enqueue_upgrade(&stranger, f.village.id, BuildingType::Farm, Utc::now())
            .await;
        assert!(matches!(err, Err(GameError::NotOwner(_))));

        let err = f
            .queue
            .enqueue_upgrade(&f.owner, f.village.id, BuildingType::Farm, Utc::now())
            .await;
        assert!(matches!(err, Err(GameError::RequirementsNotMet(_))));
        assert_eq!(f.store.village(f.village.id).unwrap().resources, ResourceLedger::ZERO);
    }

    #[tokio::test]
    async fn process_queue_completes_only_due_upgrades() {
        let f = fixture(ResourceLedger::ZERO);
        let now = Utc::now();
        let vid = f.village.id;
        f.store.insert_building(upgrading(vid, BuildingType::Farm, 2, now - chrono::Duration::seconds(1)));
        f.store.insert_building(upgrading(vid, BuildingType::Quarry, 0, now + chrono::Duration::seconds(30)));

        let records = f.queue.process_queue(vid, now).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].building_type, BuildingType::Farm);
        assert_eq!((records[0].old_level, records[0].new_level), (2, 3));

        let farm = f.store.building(vid, BuildingType::Farm).unwrap();
        assert_eq!(farm.level, 3);
        assert!(!farm.is_upgrading);
        assert!(farm.upgrade_completion_time.is_none());

        let quarry = f.store.building(vid, BuildingType::Quarry).unwrap();
        assert!(quarry.is_upgrading);
        assert_eq!(quarry.level, 0);

        // Ledger untouched by completion.
        assert_eq!(f.store.village(vid).unwrap().resources, ResourceLedger::ZERO);
        assert_eq!(f.sink.events().len(), 1);

        // Re-invocation with nothing due is a no-op.
        assert!(f.queue.process_queue(vid, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_now_requires_due_upgrade() {
        let f = fixture(ResourceLedger::ZERO);
        let now = Utc::now();
        let vid = f.village.id;
        f.store.insert_building(upgrading(vid, BuildingType::Wall, 1, now + chrono::Duration::minutes(5)));

        let early = f
            .queue
            .complete_upgrade_now(&f.owner, vid, BuildingType::Wall, now)
            .await;
        assert!(matches!(early, Err(GameError::UpgradeNotDue(BuildingType::Wall))));

        let later = now + chrono::Duration::minutes(5);
        let record = f
            .queue
            .complete_upgrade_now(&f.owner, vid, BuildingType::Wall, later)
            .await
            .unwrap();
        assert_eq!(record.new_level, 2);
        assert!(matches!(
            f.sink.events().first(),
            Some(DomainEvent::UpgradeCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_completion_pays_elapsed_time_at_the_old_level() {
        let f = fixture(ResourceLedger::ZERO);
        let vid = f.village.id;
        let t0 = f.village.last_accrual_time;
        let done = t0 + chrono::Duration::minutes(10);
        f.store.insert_building(upgrading(vid, BuildingType::WoodCutter, 1, done));

        let records = f.queue.process_queue(vid, done).await.unwrap();
        assert_eq!(records.len(), 1);
        let village = f.store.village(vid).unwrap();
        assert_eq!(village.resources.wood, 100);
        assert_eq!(village.last_accrual_time, done);

        let accrual = ResourceAccrual::new(Arc::clone(&f.store), Arc::new(GameConfig::default()));
        let outcome = accrual
            .accrue(vid, done + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(outcome.delta.wood, 20);
    }

    #[tokio::test]
    async fn complete_now_does_not_backdate_a_new_producer() {
        let f = fixture(ResourceLedger::ZERO);
        let vid = f.village.id;
        let t0 = f.village.last_accrual_time;
        let done = t0 + chrono::Duration::hours(1);
        f.store.insert_building(upgrading(vid, BuildingType::Farm, 0, done));

        f.queue
            .complete_upgrade_now(&f.owner, vid, BuildingType::Farm, done)
            .await
            .unwrap();
        let village = f.store.village(vid).unwrap();
        assert_eq!(village.resources.food, 0);
        assert_eq!(village.last_accrual_time, done);

        let accrual = ResourceAccrual::new(Arc::clone(&f.store), Arc::new(GameConfig::default()));
        let outcome = accrual
            .accrue(vid, done + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(outcome.delta.food, 60);
    }
}
