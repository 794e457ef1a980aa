//! `PostgreSQL` implementation of the simulation core's [`GameStore`].
//!
//! Every mutation is a single guarded `UPDATE ... WHERE <expected state>`:
//! the affected-row count tells the caller whether its compare-and-swap
//! won. Upgrade enqueue touches two rows (the village ledger and the
//! building) and runs both in one transaction.
//!
//! # Tables
//!
//! | Table | Used by |
//! |-------|---------|
//! | `villages` | accrual, upgrade enqueue, battle targeting |
//! | `buildings` | production rates, construction queue |
//! | `garrisons`, `heroes` | attack snapshots |
//! | `battles` | battle lifecycle |
//! | `technologies`, `alliance_members`, `alliances`, `world_events` | bonus inputs |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use realm_core::StoreError;
use realm_core::store::{AccrualCommit, BattleTransition, GameStore, UpgradeOrder};
use realm_types::{
    AllianceStanding, ArmySnapshot, Battle, BattleId, BattleResult, BattleStatus, Building,
    BuildingType, Garrison, HeroSnapshot, PlayerId, ResourceLedger, UnitStack, UnitType, Village,
    VillageId, WorldEvent,
};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::DbError;
use crate::postgres::PostgresPool;

// =============================================================================
// Column conversions
// =============================================================================

/// Ledger amounts are `u64` in memory and `BIGINT` (with a `>= 0` check) on disk.
fn amount_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn amount_from_db(column: &str, value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|e| DbError::Corrupt(format!("{column} = {value}: {e}")))
}

fn level_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn level_from_db(column: &str, value: i32) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|e| DbError::Corrupt(format!("{column} = {value}: {e}")))
}

fn parse_column<T>(column: &str, value: &str) -> Result<T, DbError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value
        .parse()
        .map_err(|e| DbError::Corrupt(format!("{column}: {e}")))
}

// =============================================================================
// Row types
// =============================================================================

#[derive(sqlx::FromRow)]
struct VillageRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    x: i32,
    y: i32,
    wood: i64,
    stone: i64,
    food: i64,
    gold: i64,
    last_accrual_time: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<VillageRow> for Village {
    type Error = DbError;

    fn try_from(row: VillageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: VillageId(row.id),
            owner: PlayerId(row.owner_id),
            name: row.name,
            x: row.x,
            y: row.y,
            resources: ResourceLedger::new(
                amount_from_db("wood", row.wood)?,
                amount_from_db("stone", row.stone)?,
                amount_from_db("food", row.food)?,
                amount_from_db("gold", row.gold)?,
            ),
            last_accrual_time: row.last_accrual_time,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BuildingRow {
    village_id: Uuid,
    building_type: String,
    level: i32,
    is_upgrading: bool,
    upgrade_completion_time: Option<DateTime<Utc>>,
}

impl TryFrom<BuildingRow> for Building {
    type Error = DbError;

    fn try_from(row: BuildingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            village_id: VillageId(row.village_id),
            building_type: parse_column("building_type", &row.building_type)?,
            level: level_from_db("level", row.level)?,
            is_upgrading: row.is_upgrading,
            upgrade_completion_time: row.upgrade_completion_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BattleRow {
    id: Uuid,
    attacker_village: Uuid,
    defender_village: Uuid,
    attacker_player: Uuid,
    defender_player: Uuid,
    attacker_army: Json<ArmySnapshot>,
    defender_army: Json<ArmySnapshot>,
    terrain: String,
    weather: String,
    status: String,
    result: Option<Json<BattleResult>>,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BattleRow> for Battle {
    type Error = DbError;

    fn try_from(row: BattleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: BattleId(row.id),
            attacker_village: VillageId(row.attacker_village),
            defender_village: VillageId(row.defender_village),
            attacker_player: PlayerId(row.attacker_player),
            defender_player: PlayerId(row.defender_player),
            attacker: row.attacker_army.0,
            defender: row.defender_army.0,
            terrain: parse_column("terrain", &row.terrain)?,
            weather: parse_column("weather", &row.weather)?,
            status: parse_column("status", &row.status)?,
            result: row.result.map(|j| j.0),
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorldEventRow {
    id: Uuid,
    name: String,
    resource: Option<String>,
    bonus_pct: f64,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
}

impl TryFrom<WorldEventRow> for WorldEvent {
    type Error = DbError;

    fn try_from(row: WorldEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: realm_types::WorldEventId(row.id),
            name: row.name,
            resource: row
                .resource
                .as_deref()
                .map(|r| parse_column("resource", r))
                .transpose()?,
            bonus_pct: row.bonus_pct,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Queries over the game tables, returning [`DbError`].
///
/// [`PostgresPool`]'s [`GameStore`] implementation delegates here and
/// converts the error. The seeding methods (`insert_*`, `set_*`) are used
/// by seeding tools and the integration tests.
pub struct GameRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> GameRepository<'a> {
    /// Create a repository bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Insert a player row (idempotent on id).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_player(&self, id: PlayerId, username: &str) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO players (id, username) VALUES ($1, $2)
              ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.into_inner())
        .bind(username)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Insert a village row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_village(&self, village: &Village) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO villages
              (id, owner_id, name, x, y, wood, stone, food, gold, last_accrual_time, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(village.id.into_inner())
        .bind(village.owner.into_inner())
        .bind(&village.name)
        .bind(village.x)
        .bind(village.y)
        .bind(amount_to_db(village.resources.wood))
        .bind(amount_to_db(village.resources.stone))
        .bind(amount_to_db(village.resources.food))
        .bind(amount_to_db(village.resources.gold))
        .bind(village.last_accrual_time)
        .bind(village.created_at)
        .execute(self.pool)
        .await?;
        tracing::debug!(village_id = %village.id, "Inserted village");
        Ok(())
    }

    /// Insert or overwrite a building row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert_building(&self, building: &Building) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO buildings
              (village_id, building_type, level, is_upgrading, upgrade_completion_time)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (village_id, building_type) DO UPDATE SET
                level = EXCLUDED.level,
                is_upgrading = EXCLUDED.is_upgrading,
                upgrade_completion_time = EXCLUDED.upgrade_completion_time",
        )
        .bind(building.village_id.into_inner())
        .bind(building.building_type.as_str())
        .bind(level_to_db(building.level))
        .bind(building.is_upgrading)
        .bind(building.upgrade_completion_time)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Replace the unit counts stationed in a village.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn set_garrison_units(
        &self,
        village_id: VillageId,
        units: &[UnitStack],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM garrisons WHERE village_id = $1")
            .bind(village_id.into_inner())
            .execute(&mut *tx)
            .await?;
        for stack in units {
            sqlx::query(
                r"INSERT INTO garrisons (village_id, unit_type, count) VALUES ($1, $2, $3)
                  ON CONFLICT (village_id, unit_type) DO UPDATE SET
                    count = garrisons.count + EXCLUDED.count",
            )
            .bind(village_id.into_inner())
            .bind(stack.unit_type.as_str())
            .bind(level_to_db(stack.count))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Insert a world event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_world_event(&self, event: &WorldEvent) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO world_events (id, name, resource, bonus_pct, starts_at, ends_at)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id.into_inner())
        .bind(&event.name)
        .bind(event.resource.map(realm_types::Resource::as_str))
        .bind(event.bonus_pct)
        .bind(event.starts_at)
        .bind(event.ends_at)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Villages and buildings
    // =========================================================================

    /// Every village id, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_village_ids(&self) -> Result<Vec<VillageId>, DbError> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM villages ORDER BY created_at, id")
            .fetch_all(self.pool)
            .await?;
        Ok(ids.into_iter().map(VillageId).collect())
    }

    /// One village.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn get_village(&self, id: VillageId) -> Result<Option<Village>, DbError> {
        let row = sqlx::query_as::<_, VillageRow>(
            r"SELECT id, owner_id, name, x, y, wood, stone, food, gold,
                     last_accrual_time, created_at
              FROM villages
              WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(Village::try_from).transpose()
    }

    /// Every building of a village.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is corrupt.
    pub async fn get_buildings(&self, village_id: VillageId) -> Result<Vec<Building>, DbError> {
        let rows = sqlx::query_as::<_, BuildingRow>(
            r"SELECT village_id, building_type, level, is_upgrading, upgrade_completion_time
              FROM buildings
              WHERE village_id = $1
              ORDER BY building_type",
        )
        .bind(village_id.into_inner())
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(Building::try_from).collect()
    }

    /// Credit an accrual if `last_accrual_time` is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn commit_accrual(&self, commit: &AccrualCommit) -> Result<bool, DbError> {
        let done = sqlx::query(
            r"UPDATE villages SET
                wood = wood + $2,
                stone = stone + $3,
                food = food + $4,
                gold = gold + $5,
                last_accrual_time = $6
              WHERE id = $1 AND last_accrual_time = $7",
        )
        .bind(commit.village_id.into_inner())
        .bind(amount_to_db(commit.delta.wood))
        .bind(amount_to_db(commit.delta.stone))
        .bind(amount_to_db(commit.delta.food))
        .bind(amount_to_db(commit.delta.gold))
        .bind(commit.accrued_until)
        .bind(commit.expected_last_accrual)
        .execute(self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Buildings of a village whose upgrade is due at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is corrupt.
    pub async fn get_due_upgrades(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Building>, DbError> {
        let rows = sqlx::query_as::<_, BuildingRow>(
            r"SELECT village_id, building_type, level, is_upgrading, upgrade_completion_time
              FROM buildings
              WHERE village_id = $1 AND is_upgrading AND upgrade_completion_time <= $2
              ORDER BY upgrade_completion_time",
        )
        .bind(village_id.into_inner())
        .bind(now)
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(Building::try_from).collect()
    }

    /// Deduct the cost and start the upgrade in one transaction.
    ///
    /// Rolls back (returning `false`) if the ledger no longer covers the
    /// cost or the building is not idle at `from_level`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn begin_upgrade(&self, order: &UpgradeOrder) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        if order.from_level == 0 {
            sqlx::query(
                r"INSERT INTO buildings (village_id, building_type, level)
                  VALUES ($1, $2, 0)
                  ON CONFLICT (village_id, building_type) DO NOTHING",
            )
            .bind(order.village_id.into_inner())
            .bind(order.building_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let debited = sqlx::query(
            r"UPDATE villages SET
                wood = wood - $2,
                stone = stone - $3,
                food = food - $4,
                gold = gold - $5
              WHERE id = $1 AND wood >= $2 AND stone >= $3 AND food >= $4 AND gold >= $5",
        )
        .bind(order.village_id.into_inner())
        .bind(amount_to_db(order.cost.wood))
        .bind(amount_to_db(order.cost.stone))
        .bind(amount_to_db(order.cost.food))
        .bind(amount_to_db(order.cost.gold))
        .execute(&mut *tx)
        .await?;
        if debited.rows_affected() != 1 {
            return Ok(false);
        }

        let started = sqlx::query(
            r"UPDATE buildings SET
                is_upgrading = TRUE,
                upgrade_completion_time = $4
              WHERE village_id = $1 AND building_type = $2 AND level = $3 AND NOT is_upgrading",
        )
        .bind(order.village_id.into_inner())
        .bind(order.building_type.as_str())
        .bind(level_to_db(order.from_level))
        .bind(order.completes_at)
        .execute(&mut *tx)
        .await?;
        if started.rows_affected() != 1 {
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Finalize an upgrade if it is still in flight from `from_level` and due.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn complete_upgrade(
        &self,
        village_id: VillageId,
        building_type: BuildingType,
        from_level: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let done = sqlx::query(
            r"UPDATE buildings SET
                level = level + 1,
                is_upgrading = FALSE,
                upgrade_completion_time = NULL
              WHERE village_id = $1 AND building_type = $2 AND level = $3
                AND is_upgrading AND upgrade_completion_time <= $4",
        )
        .bind(village_id.into_inner())
        .bind(building_type.as_str())
        .bind(level_to_db(from_level))
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Units and heroes stationed in a village.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a query fails or a row is corrupt.
    pub async fn get_garrison(&self, village_id: VillageId) -> Result<Garrison, DbError> {
        let unit_rows: Vec<(String, i32)> = sqlx::query_as(
            r"SELECT unit_type, count FROM garrisons
              WHERE village_id = $1
              ORDER BY unit_type",
        )
        .bind(village_id.into_inner())
        .fetch_all(self.pool)
        .await?;

        let hero_rows: Vec<(Uuid, i32)> = sqlx::query_as(
            r"SELECT id, level FROM heroes
              WHERE village_id = $1
              ORDER BY id",
        )
        .bind(village_id.into_inner())
        .fetch_all(self.pool)
        .await?;

        let units = unit_rows
            .into_iter()
            .map(|(unit_type, count)| {
                Ok(UnitStack {
                    unit_type: parse_column::<UnitType>("unit_type", &unit_type)?,
                    count: level_from_db("count", count)?,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;
        let heroes = hero_rows
            .into_iter()
            .map(|(id, level)| {
                Ok(HeroSnapshot {
                    hero_id: realm_types::HeroId(id),
                    level: level_from_db("hero level", level)?,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;

        Ok(Garrison { units, heroes })
    }

    // =========================================================================
    // Battles
    // =========================================================================

    /// Insert a newly created battle.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_battle(&self, battle: &Battle) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO battles
              (id, attacker_village, defender_village, attacker_player, defender_player,
               attacker_army, defender_army, terrain, weather, status, result,
               created_at, scheduled_at, finished_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(battle.id.into_inner())
        .bind(battle.attacker_village.into_inner())
        .bind(battle.defender_village.into_inner())
        .bind(battle.attacker_player.into_inner())
        .bind(battle.defender_player.into_inner())
        .bind(Json(&battle.attacker))
        .bind(Json(&battle.defender))
        .bind(battle.terrain.as_str())
        .bind(battle.weather.as_str())
        .bind(battle.status.as_str())
        .bind(battle.result.as_ref().map(Json))
        .bind(battle.created_at)
        .bind(battle.scheduled_at)
        .bind(battle.finished_at)
        .execute(self.pool)
        .await?;
        tracing::debug!(battle_id = %battle.id, "Inserted battle");
        Ok(())
    }

    /// One battle.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn get_battle(&self, id: BattleId) -> Result<Option<Battle>, DbError> {
        let row = sqlx::query_as::<_, BattleRow>(
            r"SELECT id, attacker_village, defender_village, attacker_player, defender_player,
                     attacker_army, defender_army, terrain, weather, status, result,
                     created_at, scheduled_at, finished_at
              FROM battles
              WHERE id = $1",
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(Battle::try_from).transpose()
    }

    /// Move a battle from `transition.from` to `transition.to`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the update fails.
    pub async fn transition_battle(&self, transition: &BattleTransition) -> Result<bool, DbError> {
        let done = sqlx::query(
            r"UPDATE battles SET
                status = $2,
                result = COALESCE($3, result),
                finished_at = COALESCE($4, finished_at)
              WHERE id = $1 AND status = $5",
        )
        .bind(transition.battle_id.into_inner())
        .bind(transition.to.as_str())
        .bind(transition.result.as_ref().map(Json))
        .bind(transition.finished_at)
        .bind(transition.from.as_str())
        .execute(self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Non-terminal battles due at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn get_due_battles(&self, now: DateTime<Utc>) -> Result<Vec<BattleId>, DbError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"SELECT id FROM battles
              WHERE status IN ($1, $2) AND scheduled_at <= $3
              ORDER BY scheduled_at, id",
        )
        .bind(BattleStatus::Pending.as_str())
        .bind(BattleStatus::Active.as_str())
        .bind(now)
        .fetch_all(self.pool)
        .await?;
        Ok(ids.into_iter().map(BattleId).collect())
    }

    // =========================================================================
    // Bonus inputs
    // =========================================================================

    /// World events whose window contains `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is corrupt.
    pub async fn get_active_events(&self, now: DateTime<Utc>) -> Result<Vec<WorldEvent>, DbError> {
        let rows = sqlx::query_as::<_, WorldEventRow>(
            r"SELECT id, name, resource, bonus_pct, starts_at, ends_at
              FROM world_events
              WHERE starts_at <= $1 AND $1 < ends_at
              ORDER BY starts_at",
        )
        .bind(now)
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(WorldEvent::try_from).collect()
    }

    /// Researched technology levels of a player.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is corrupt.
    pub async fn get_technology_levels(
        &self,
        player: PlayerId,
    ) -> Result<BTreeMap<String, u32>, DbError> {
        let rows: Vec<(String, i32)> =
            sqlx::query_as("SELECT name, level FROM technologies WHERE player_id = $1")
                .bind(player.into_inner())
                .fetch_all(self.pool)
                .await?;
        rows.into_iter()
            .map(|(name, level)| Ok((name, level_from_db("technology level", level)?)))
            .collect()
    }

    /// The alliance a player belongs to, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is corrupt.
    pub async fn get_alliance_standing(
        &self,
        player: PlayerId,
    ) -> Result<Option<AllianceStanding>, DbError> {
        let row: Option<(Uuid, i32, i64)> = sqlx::query_as(
            r"SELECT a.id, a.level, a.experience
              FROM alliance_members m
              JOIN alliances a ON a.id = m.alliance_id
              WHERE m.player_id = $1",
        )
        .bind(player.into_inner())
        .fetch_optional(self.pool)
        .await?;
        row.map(|(id, level, experience)| {
            Ok(AllianceStanding {
                alliance_id: realm_types::AllianceId(id),
                level: level_from_db("alliance level", level)?,
                experience: amount_from_db("alliance experience", experience)?,
            })
        })
        .transpose()
    }
}

// =============================================================================
// GameStore
// =============================================================================

impl PostgresPool {
    fn repository(&self) -> GameRepository<'_> {
        GameRepository::new(self.pool())
    }
}

impl GameStore for PostgresPool {
    async fn list_village_ids(&self) -> Result<Vec<VillageId>, StoreError> {
        Ok(self.repository().list_village_ids().await?)
    }

    async fn get_village(&self, id: VillageId) -> Result<Option<Village>, StoreError> {
        Ok(self.repository().get_village(id).await?)
    }

    async fn get_buildings(&self, village_id: VillageId) -> Result<Vec<Building>, StoreError> {
        Ok(self.repository().get_buildings(village_id).await?)
    }

    async fn commit_accrual(&self, commit: AccrualCommit) -> Result<bool, StoreError> {
        Ok(self.repository().commit_accrual(&commit).await?)
    }

    async fn get_due_upgrades(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Building>, StoreError> {
        Ok(self.repository().get_due_upgrades(village_id, now).await?)
    }

    async fn begin_upgrade(&self, order: UpgradeOrder) -> Result<bool, StoreError> {
        Ok(self.repository().begin_upgrade(&order).await?)
    }

    async fn complete_upgrade(
        &self,
        village_id: VillageId,
        building_type: BuildingType,
        from_level: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .repository()
            .complete_upgrade(village_id, building_type, from_level, now)
            .await?)
    }

    async fn get_garrison(&self, village_id: VillageId) -> Result<Garrison, StoreError> {
        Ok(self.repository().get_garrison(village_id).await?)
    }

    async fn insert_battle(&self, battle: &Battle) -> Result<(), StoreError> {
        Ok(self.repository().insert_battle(battle).await?)
    }

    async fn get_battle(&self, id: BattleId) -> Result<Option<Battle>, StoreError> {
        Ok(self.repository().get_battle(id).await?)
    }

    async fn transition_battle(&self, transition: BattleTransition) -> Result<bool, StoreError> {
        Ok(self.repository().transition_battle(&transition).await?)
    }

    async fn get_due_battles(&self, now: DateTime<Utc>) -> Result<Vec<BattleId>, StoreError> {
        Ok(self.repository().get_due_battles(now).await?)
    }

    async fn get_active_events(&self, now: DateTime<Utc>) -> Result<Vec<WorldEvent>, StoreError> {
        Ok(self.repository().get_active_events(now).await?)
    }

    async fn get_technology_levels(
        &self,
        player: PlayerId,
    ) -> Result<BTreeMap<String, u32>, StoreError> {
        Ok(self.repository().get_technology_levels(player).await?)
    }

    async fn get_alliance_standing(
        &self,
        player: PlayerId,
    ) -> Result<Option<AllianceStanding>, StoreError> {
        Ok(self.repository().get_alliance_standing(player).await?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn amounts_saturate_into_bigint() {
        assert_eq!(amount_to_db(u64::MAX), i64::MAX);
        assert_eq!(amount_to_db(300), 300);
    }

    #[test]
    fn negative_amount_is_corrupt() {
        assert!(matches!(amount_from_db("wood", -1), Err(DbError::Corrupt(_))));
        assert_eq!(amount_from_db("wood", 42).ok(), Some(42));
    }

    #[test]
    fn unknown_building_type_is_corrupt() {
        let row = BuildingRow {
            village_id: Uuid::nil(),
            building_type: String::from("lighthouse"),
            level: 1,
            is_upgrading: false,
            upgrade_completion_time: None,
        };
        assert!(matches!(Building::try_from(row), Err(DbError::Corrupt(_))));
    }

    #[test]
    fn village_row_decodes() {
        let now = Utc::now();
        let row = VillageRow {
            id: Uuid::nil(),
            owner_id: Uuid::nil(),
            name: String::from("Highfield"),
            x: 3,
            y: -4,
            wood: 10,
            stone: 20,
            food: 30,
            gold: 40,
            last_accrual_time: now,
            created_at: now,
        };
        let village = Village::try_from(row).unwrap();
        assert_eq!(village.resources, ResourceLedger::new(10, 20, 30, 40));
        assert_eq!(village.y, -4);
    }
}
