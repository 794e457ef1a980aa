//! Resource Accrual Calculator.
//!
//! Production is a pure function of building levels, the catalog and the
//! bonus set:
//!
//! ```text
//! base[r]      = Σ level_i × rate_per_level(type_i)   over producers of r
//! multiplier   = 1 + Σ bonus fractions                (summed once)
//! delta[r]     = floor(base[r] × multiplier × elapsed / period)
//! ```
//!
//! The commit is a compare-and-swap on the village's `last_accrual_time`, so
//! two overlapping sweeps cannot credit the same interval twice: the loser
//! sees a stale timestamp and commits nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use realm_types::{Building, ProductionRates, Resource, ResourceLedger, Village, VillageId};
use tracing::{debug, warn};

use crate::bonus::BonusSet;
use crate::config::{EconomyConfig, GameConfig};
use crate::error::GameError;
use crate::numeric;
use crate::store::{AccrualCommit, GameStore};

/// Result of one accrual attempt for one village.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualOutcome {
    /// The village.
    pub village_id: VillageId,
    /// Resources credited (zero when nothing was committed).
    pub delta: ResourceLedger,
    /// `last_accrual_time` after the attempt.
    pub accrued_until: DateTime<Utc>,
    /// Whether the ledger was written.
    pub committed: bool,
}

/// Base production per resource, per accrual period.
///
/// Buildings without a catalog entry, without a produced resource, or with a
/// non-finite or negative rate contribute nothing.
pub fn base_rates(buildings: &[Building], economy: &EconomyConfig) -> BTreeMap<Resource, f64> {
    let mut base: BTreeMap<Resource, f64> = Resource::ALL.iter().map(|r| (*r, 0.0)).collect();
    for building in buildings {
        let Some(spec) = economy.building(building.building_type) else {
            debug!(
                building = %building.building_type,
                village_id = %building.village_id,
                "no catalog entry, skipping production"
            );
            continue;
        };
        let Some(resource) = spec.produces else {
            continue;
        };
        if !spec.rate_per_level.is_finite() || spec.rate_per_level < 0.0 {
            warn!(
                building = %building.building_type,
                rate = spec.rate_per_level,
                "invalid production rate in catalog, skipping"
            );
            continue;
        }
        let contribution = f64::from(building.level) * spec.rate_per_level;
        if let Some(slot) = base.get_mut(&resource) {
            *slot += contribution;
        }
    }
    base
}

/// Combine base rates with the bonus set into [`ProductionRates`].
pub fn production_rates(
    buildings: &[Building],
    bonuses: &BonusSet,
    economy: &EconomyConfig,
    period_secs: u64,
) -> ProductionRates {
    let base = base_rates(buildings, economy);
    let multiplier: BTreeMap<Resource, f64> = Resource::ALL
        .iter()
        .map(|r| (*r, bonuses.multiplier(*r)))
        .collect();
    let effective = base
        .iter()
        .map(|(r, b)| (*r, b * multiplier.get(r).copied().unwrap_or(1.0)))
        .collect();
    ProductionRates {
        base,
        multiplier,
        effective,
        period_secs,
    }
}

/// Resources earned over `elapsed_ms` milliseconds at the given rates.
///
/// Zero for non-positive elapsed time or a zero-length period.
pub fn accrued_delta(rates: &ProductionRates, elapsed_ms: i64) -> ResourceLedger {
    let mut delta = ResourceLedger::ZERO;
    if elapsed_ms <= 0 || rates.period_secs == 0 {
        return delta;
    }
    let elapsed = numeric::to_f64(elapsed_ms.unsigned_abs());
    let period_ms = numeric::to_f64(rates.period_secs.saturating_mul(1000));
    for (resource, rate) in &rates.effective {
        delta.set(*resource, numeric::floor_to_u64(rate * elapsed / period_ms));
    }
    delta
}

/// Whether any resource has a positive effective rate.
fn produces_anything(rates: &ProductionRates) -> bool {
    rates.effective.values().any(|rate| *rate > 0.0)
}

/// Applies accrual to villages held in a [`GameStore`].
#[derive(Debug)]
pub struct ResourceAccrual<S> {
    store: Arc<S>,
    config: Arc<GameConfig>,
}

impl<S: GameStore> ResourceAccrual<S> {
    /// Create a calculator over a store.
    pub const fn new(store: Arc<S>, config: Arc<GameConfig>) -> Self {
        Self { store, config }
    }

    async fn load_village(&self, village_id: VillageId) -> Result<Village, GameError> {
        self.store
            .get_village(village_id)
            .await?
            .ok_or(GameError::VillageNotFound(village_id))
    }

    async fn rates_for(
        &self,
        village: &Village,
        now: DateTime<Utc>,
    ) -> Result<ProductionRates, GameError> {
        let buildings = self.store.get_buildings(village.id).await?;
        let technologies = self.store.get_technology_levels(village.owner).await?;
        let alliance = self.store.get_alliance_standing(village.owner).await?;
        let events = self.store.get_active_events(now).await?;
        let bonuses = BonusSet::gather(
            &self.config.economy,
            &technologies,
            alliance.as_ref(),
            &events,
            self.config.world.world_type,
            now,
        );
        Ok(production_rates(
            &buildings,
            &bonuses,
            &self.config.economy,
            self.config.tick.accrual_period_secs,
        ))
    }

    /// Current production rates of a village.
    pub async fn calculate_production(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> Result<ProductionRates, GameError> {
        let village = self.load_village(village_id).await?;
        self.rates_for(&village, now).await
    }

    /// Credit everything produced since `last_accrual_time`.
    ///
    /// Nothing is written when no time has passed, when the clock reads
    /// earlier than the stored timestamp, or when a positive rate still
    /// rounds down to zero (the partial production keeps accumulating). A
    /// village that produces nothing has its timestamp advanced with a zero
    /// delta, so a producer built later is not paid for the idle interval.
    /// A lost compare-and-swap is not an error; the outcome reports
    /// `committed: false`.
    pub async fn accrue(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> Result<AccrualOutcome, GameError> {
        self.accrue_at(village_id, now, false).await
    }

    /// Credit production up to `now` and always advance the timestamp.
    ///
    /// Called before a building level changes so the elapsed interval is
    /// paid at the old rates. A fractional remainder below one unit is
    /// dropped.
    pub async fn settle(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
    ) -> Result<AccrualOutcome, GameError> {
        self.accrue_at(village_id, now, true).await
    }

    async fn accrue_at(
        &self,
        village_id: VillageId,
        now: DateTime<Utc>,
        settle: bool,
    ) -> Result<AccrualOutcome, GameError> {
        let village = self.load_village(village_id).await?;
        let unchanged = AccrualOutcome {
            village_id,
            delta: ResourceLedger::ZERO,
            accrued_until: village.last_accrual_time,
            committed: false,
        };

        let elapsed_ms = (now - village.last_accrual_time).num_milliseconds();
        if elapsed_ms <= 0 {
            if elapsed_ms < 0 {
                debug!(%village_id, elapsed_ms, "accrual clock behind stored timestamp");
            }
            return Ok(unchanged);
        }

        let rates = self.rates_for(&village, now).await?;
        let delta = accrued_delta(&rates, elapsed_ms);
        if delta.is_zero() && produces_anything(&rates) && !settle {
            return Ok(unchanged);
        }

        let committed = self
            .store
            .commit_accrual(AccrualCommit {
                village_id,
                expected_last_accrual: village.last_accrual_time,
                delta,
                accrued_until: now,
            })
            .await?;
        if !committed {
            debug!(%village_id, "accrual lost compare-and-swap, already credited");
            return Ok(unchanged);
        }

        debug!(
            %village_id,
            wood = delta.wood,
            stone = delta.stone,
            food = delta.food,
            gold = delta.gold,
            "resources accrued"
        );
        Ok(AccrualOutcome {
            village_id,
            delta,
            accrued_until: now,
            committed: true,
        })
    }
}
