//! Production bonus providers.
//!
//! Every source of a production bonus implements [`BonusProvider`]. The
//! accrual calculator gathers them into a [`BonusSet`], which sums the
//! percentages of all sources once and applies the sum as a single
//! multiplier: `1 + tech + alliance + event + world_type`. Sources never
//! compound with each other.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use realm_types::{AllianceStanding, Resource, WorldEvent, WorldType};

use crate::config::{EconomyConfig, TechnologySpec};

/// The category a bonus comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BonusSource {
    /// A researched technology.
    Technology,
    /// The owner's alliance level.
    Alliance,
    /// A running world event.
    Event,
    /// The world ruleset.
    WorldType,
}

/// A source of additive production bonus.
pub trait BonusProvider: Send + Sync {
    /// The category of this provider.
    fn source(&self) -> BonusSource;

    /// Additive bonus fraction for `resource` (0.10 = +10%).
    fn bonus_for(&self, resource: Resource) -> f64;
}

/// Bonus from one researched technology.
#[derive(Debug, Clone)]
pub struct TechnologyBonus {
    /// Researched level.
    pub level: u32,
    /// Catalog entry of the technology.
    pub spec: TechnologySpec,
}

impl BonusProvider for TechnologyBonus {
    fn source(&self) -> BonusSource {
        BonusSource::Technology
    }

    fn bonus_for(&self, resource: Resource) -> f64 {
        if self.spec.resource.is_none_or(|r| r == resource) {
            f64::from(self.level) * self.spec.bonus_per_level
        } else {
            0.0
        }
    }
}

/// Bonus from the owner's alliance level; applies to every resource.
#[derive(Debug, Clone, Copy)]
pub struct AllianceBonus {
    /// Alliance level.
    pub level: u32,
    /// Bonus fraction per level.
    pub per_level: f64,
}

impl BonusProvider for AllianceBonus {
    fn source(&self) -> BonusSource {
        BonusSource::Alliance
    }

    fn bonus_for(&self, _resource: Resource) -> f64 {
        f64::from(self.level) * self.per_level
    }
}

/// Bonus from a running world event.
#[derive(Debug, Clone)]
pub struct EventBonus(pub WorldEvent);

impl BonusProvider for EventBonus {
    fn source(&self) -> BonusSource {
        BonusSource::Event
    }

    fn bonus_for(&self, resource: Resource) -> f64 {
        if self.0.resource.is_none_or(|r| r == resource) {
            self.0.bonus_pct
        } else {
            0.0
        }
    }
}

/// Flat bonus of the world ruleset; applies to every resource.
#[derive(Debug, Clone, Copy)]
pub struct WorldTypeBonus {
    /// The ruleset.
    pub world_type: WorldType,
    /// Its bonus fraction.
    pub pct: f64,
}

impl BonusProvider for WorldTypeBonus {
    fn source(&self) -> BonusSource {
        BonusSource::WorldType
    }

    fn bonus_for(&self, _resource: Resource) -> f64 {
        self.pct
    }
}

/// All bonus providers applying to one village.
#[derive(Default)]
pub struct BonusSet {
    providers: Vec<Box<dyn BonusProvider>>,
}

impl core::fmt::Debug for BonusSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BonusSet")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl BonusSet {
    /// An empty set (multiplier 1.0 for every resource).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider.
    pub fn push(&mut self, provider: impl BonusProvider + 'static) {
        self.providers.push(Box::new(provider));
    }

    /// Number of providers in the set.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the set has no providers.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Gather every provider that applies to a village owner.
    ///
    /// Technologies missing from the catalog and events outside their
    /// window contribute nothing.
    pub fn gather(
        economy: &EconomyConfig,
        technologies: &BTreeMap<String, u32>,
        alliance: Option<&AllianceStanding>,
        events: &[WorldEvent],
        world_type: WorldType,
        now: DateTime<Utc>,
    ) -> Self {
        let mut set = Self::new();
        for (name, level) in technologies {
            if let Some(spec) = economy.technologies.get(name) {
                set.push(TechnologyBonus {
                    level: *level,
                    spec: spec.clone(),
                });
            }
        }
        if let Some(standing) = alliance {
            set.push(AllianceBonus {
                level: standing.level,
                per_level: economy.alliance_bonus_per_level,
            });
        }
        for event in events.iter().filter(|e| e.is_active(now)) {
            set.push(EventBonus(event.clone()));
        }
        set.push(WorldTypeBonus {
            world_type,
            pct: economy
                .world_type_bonuses
                .get(&world_type)
                .copied()
                .unwrap_or(0.0),
        });
        set
    }

    /// Sum of bonus fractions of one category for `resource`.
    pub fn total_from(&self, source: BonusSource, resource: Resource) -> f64 {
        self.providers
            .iter()
            .filter(|p| p.source() == source)
            .map(|p| p.bonus_for(resource))
            .sum()
    }

    /// `1 + Σ bonus` for `resource`, floored at zero.
    pub fn multiplier(&self, resource: Resource) -> f64 {
        let sum: f64 = self.providers.iter().map(|p| p.bonus_for(resource)).sum();
        (1.0 + sum).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_types::{AllianceId, WorldEventId};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_set_is_neutral() {
        let set = BonusSet::new();
        for r in Resource::ALL {
            assert!(approx(set.multiplier(*r), 1.0));
        }
    }

    #[test]
    fn sources_add_not_compound() {
        let mut set = BonusSet::new();
        set.push(AllianceBonus {
            level: 10,
            per_level: 0.01,
        });
        set.push(WorldTypeBonus {
            world_type: WorldType::Speed,
            pct: 0.5,
        });
        set.push(TechnologyBonus {
            level: 2,
            spec: TechnologySpec {
                resource: Some(Resource::Wood),
                bonus_per_level: 0.05,
            },
        });
        // 1 + 0.10 + 0.50 + 0.10, not 1.1 * 1.5 * 1.1
        assert!(approx(set.multiplier(Resource::Wood), 1.7));
        assert!(approx(set.multiplier(Resource::Stone), 1.6));
        assert!(approx(set.total_from(BonusSource::Alliance, Resource::Gold), 0.1));
    }

    #[test]
    fn multiplier_never_negative() {
        let mut set = BonusSet::new();
        set.push(WorldTypeBonus {
            world_type: WorldType::Hardcore,
            pct: -2.0,
        });
        assert!(approx(set.multiplier(Resource::Food), 0.0));
    }

    #[test]
    fn gather_skips_unknown_tech_and_expired_events() {
        let now = Utc::now();
        let economy = EconomyConfig::default();
        let techs = BTreeMap::from([
            (String::from("forestry"), 2),
            (String::from("alchemy"), 9),
        ]);
        let live = WorldEvent {
            id: WorldEventId::new(),
            name: String::from("Harvest Festival"),
            resource: Some(Resource::Food),
            bonus_pct: 0.25,
            starts_at: now - chrono::Duration::hours(1),
            ends_at: now + chrono::Duration::hours(1),
        };
        let expired = WorldEvent {
            ends_at: now - chrono::Duration::minutes(1),
            ..live.clone()
        };
        let standing = AllianceStanding {
            alliance_id: AllianceId::new(),
            level: 5,
            experience: 1200,
        };
        let set = BonusSet::gather(
            &economy,
            &techs,
            Some(&standing),
            &[live, expired],
            WorldType::Standard,
            now,
        );
        // forestry, alliance, one live event, world type
        assert_eq!(set.len(), 4);
        assert!(approx(set.multiplier(Resource::Wood), 1.0 + 0.10 + 0.05));
        assert!(approx(set.multiplier(Resource::Food), 1.0 + 0.05 + 0.25));
    }
}
