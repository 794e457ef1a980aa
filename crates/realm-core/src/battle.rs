//! Battle Resolution Engine.
//!
//! ```text
//! pending --> active --> resolved
//!    |
//!    +------> cancelled          (attacker only, before resolution)
//! ```
//!
//! Every transition is a compare-and-swap on `status`, so a battle is
//! resolved at most once even when several sweeps race for it. Resolution is
//! deterministic given the snapshots, terrain and weather, except for the
//! plunder draw.

use core::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use realm_types::{
    AppliedModifiers, ArmySnapshot, Battle, BattleDetails, BattleId, BattleOutcome, BattleResult,
    BattleStatus, DomainEvent, HeroId, HeroSnapshot, Principal, ResourceLedger, Terrain, UnitStack,
    VillageId, VillageSummary, Weather,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{CombatConfig, GameConfig, UnitSpec};
use crate::error::GameError;
use crate::events::EventSink;
use crate::numeric;
use crate::store::{BattleTransition, GameStore};

/// Attack bonus per hero level.
pub const HERO_BONUS_PER_LEVEL: f64 = 0.05;

/// Attack bonus per technology level.
pub const TECH_BONUS_PER_LEVEL: f64 = 0.02;

/// Attack above this multiple of defense is a decisive win.
const DECISIVE_RATIO: f64 = 1.5;

/// A request to attack another village.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackOrder {
    /// Village the army marches from.
    pub attacker_village: VillageId,
    /// Village under attack.
    pub defender_village: VillageId,
    /// Units sent.
    pub units: Vec<UnitStack>,
    /// Heroes leading the army; each must be in the attacker's garrison.
    #[serde(default)]
    pub heroes: Vec<HeroId>,
    /// Battlefield terrain.
    #[serde(default)]
    pub terrain: Terrain,
    /// Weather at the battlefield.
    #[serde(default)]
    pub weather: Weather,
}

/// The deterministic part of a battle outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    /// Outcome class.
    pub outcome: BattleOutcome,
    /// Attack power before modifiers.
    pub raw_attack_power: f64,
    /// Attack power after modifiers.
    pub attack_power: f64,
    /// Defense power.
    pub defense_power: f64,
    /// Modifiers in application order.
    pub modifiers: AppliedModifiers,
    /// Rounds fought.
    pub rounds: u32,
    /// Attacker losses in power units.
    pub attacker_losses: f64,
    /// Defender losses in power units.
    pub defender_losses: f64,
    /// Attacker experience.
    pub experience: u32,
}

fn army_power(units: &[UnitStack], combat: &CombatConfig, stat: fn(&UnitSpec) -> f64) -> f64 {
    units
        .iter()
        .map(|stack| match combat.unit(stack.unit_type) {
            Some(spec) if stat(spec).is_finite() && stat(spec) >= 0.0 => {
                f64::from(stack.count) * stat(spec)
            }
            _ => {
                warn!(unit = %stack.unit_type, "unit missing or invalid in catalog, counts as zero");
                0.0
            }
        })
        .sum()
}

/// `1 + Σ hero_level × 0.05`.
pub fn hero_multiplier(heroes: &[HeroSnapshot]) -> f64 {
    1.0 + heroes
        .iter()
        .map(|h| f64::from(h.level) * HERO_BONUS_PER_LEVEL)
        .sum::<f64>()
}

/// `1 + Σ tech_level × 0.02`.
pub fn technology_multiplier(army: &ArmySnapshot) -> f64 {
    1.0 + army
        .technologies
        .values()
        .map(|level| f64::from(*level) * TECH_BONUS_PER_LEVEL)
        .sum::<f64>()
}

/// Compute everything about a battle except the plunder draw.
pub fn assess(battle: &Battle, combat: &CombatConfig) -> Assessment {
    let raw_attack_power = army_power(&battle.attacker.units, combat, |u| u.attack);
    let defense_power = army_power(&battle.defender.units, combat, |u| u.defense);

    let modifiers = AppliedModifiers {
        terrain: battle.terrain.attack_modifier(),
        weather: battle.weather.attack_modifier(),
        hero: hero_multiplier(&battle.attacker.heroes),
        technology: technology_multiplier(&battle.attacker),
    };
    let attack_power =
        raw_attack_power * modifiers.terrain * modifiers.weather * modifiers.hero * modifiers.technology;

    let rounds = numeric::clamp_to_u32(attack_power.max(defense_power) / 100.0, 3, 10);

    let (outcome, attacker_loss, defender_loss) = if attack_power > DECISIVE_RATIO * defense_power {
        (BattleOutcome::DecisiveWin, 0.10, 0.80)
    } else if attack_power > defense_power {
        (BattleOutcome::MarginalWin, 0.30, 0.60)
    } else {
        (BattleOutcome::Defeat, 0.70, 0.20)
    };

    let experience = if outcome.is_win() {
        numeric::clamp_to_u32(defense_power / 10.0, 10, 100)
    } else {
        numeric::clamp_to_u32(attack_power / 20.0, 5, 50)
    };

    Assessment {
        outcome,
        raw_attack_power,
        attack_power,
        defense_power,
        modifiers,
        rounds,
        attacker_losses: attack_power * attacker_loss,
        defender_losses: defense_power * defender_loss,
        experience,
    }
}

/// Draw plunder for a won battle: wood 50..150, stone 40..120, food 30..90,
/// gold 10..30.
pub fn draw_plunder<R: Rng + ?Sized>(rng: &mut R) -> ResourceLedger {
    ResourceLedger::new(
        rng.random_range(50..150),
        rng.random_range(40..120),
        rng.random_range(30..90),
        rng.random_range(10..30),
    )
}

/// Creates, cancels and resolves battles.
pub struct BattleEngine<S> {
    store: Arc<S>,
    config: Arc<GameConfig>,
    events: Arc<dyn EventSink>,
    plunder_rng: Mutex<StdRng>,
}

impl<S> fmt::Debug for BattleEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BattleEngine").finish_non_exhaustive()
    }
}

impl<S: GameStore> BattleEngine<S> {
    /// Create an engine. Plunder is seeded from `combat.plunder_seed` when set.
    pub fn new(store: Arc<S>, config: Arc<GameConfig>, events: Arc<dyn EventSink>) -> Self {
        let rng = config
            .combat
            .plunder_seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self {
            store,
            config,
            events,
            plunder_rng: Mutex::new(rng),
        }
    }

    async fn load_battle(&self, battle_id: BattleId) -> Result<Battle, GameError> {
        self.store
            .get_battle(battle_id)
            .await?
            .ok_or(GameError::BattleNotFound(battle_id))
    }

    fn march_secs(&self, distance: f64) -> i64 {
        let travel = numeric::floor_to_u64((distance * self.config.combat.secs_per_tile).ceil());
        let secs = travel.max(self.config.combat.min_march_secs);
        i64::try_from(secs).unwrap_or(i64::MAX)
    }

    /// Validate an attack and create a pending battle.
    ///
    /// Both armies, the attacker's heroes and technology levels are
    /// snapshotted now; the battle becomes due once the march completes.
    pub async fn attack(
        &self,
        principal: &Principal,
        order: AttackOrder,
        now: DateTime<Utc>,
    ) -> Result<Battle, GameError> {
        if order.attacker_village == order.defender_village {
            return Err(GameError::InvalidArmy(String::from(
                "a village cannot attack itself",
            )));
        }
        if order.units.iter().all(|s| s.count == 0) {
            return Err(GameError::InvalidArmy(String::from("no units sent")));
        }

        let attacker = self
            .store
            .get_village(order.attacker_village)
            .await?
            .ok_or(GameError::VillageNotFound(order.attacker_village))?;
        if attacker.owner != principal.player_id {
            return Err(GameError::NotOwner(order.attacker_village));
        }
        let defender = self
            .store
            .get_village(order.defender_village)
            .await?
            .ok_or(GameError::VillageNotFound(order.defender_village))?;

        let garrison = self.store.get_garrison(attacker.id).await?;
        let mut units: Vec<UnitStack> = Vec::new();
        for stack in order.units.iter().filter(|s| s.count > 0) {
            if self.config.combat.unit(stack.unit_type).is_none() {
                return Err(GameError::UnknownUnit(stack.unit_type));
            }
            match units.iter_mut().find(|u| u.unit_type == stack.unit_type) {
                Some(existing) => existing.count = existing.count.saturating_add(stack.count),
                None => units.push(*stack),
            }
        }
        for stack in &units {
            let available = garrison.count_of(stack.unit_type);
            if u64::from(stack.count) > available {
                return Err(GameError::InsufficientUnits {
                    unit_type: stack.unit_type,
                    requested: u64::from(stack.count),
                    available,
                });
            }
        }

        let mut heroes = Vec::with_capacity(order.heroes.len());
        for hero_id in &order.heroes {
            let hero = garrison
                .heroes
                .iter()
                .find(|h| h.hero_id == *hero_id)
                .ok_or_else(|| {
                    GameError::InvalidArmy(format!("hero {hero_id} is not in the attacking village"))
                })?;
            if !heroes.contains(hero) {
                heroes.push(*hero);
            }
        }

        let technologies = self.store.get_technology_levels(attacker.owner).await?;
        let defender_garrison = self.store.get_garrison(defender.id).await?;
        let defender_technologies = self.store.get_technology_levels(defender.owner).await?;

        let march = chrono::Duration::seconds(self.march_secs(attacker.distance_to(&defender)));
        let battle = Battle {
            id: BattleId::new(),
            attacker_village: attacker.id,
            defender_village: defender.id,
            attacker_player: attacker.owner,
            defender_player: defender.owner,
            attacker: ArmySnapshot {
                units,
                heroes,
                technologies,
            },
            defender: ArmySnapshot {
                units: defender_garrison.units,
                heroes: defender_garrison.heroes,
                technologies: defender_technologies,
            },
            terrain: order.terrain,
            weather: order.weather,
            status: BattleStatus::Pending,
            result: None,
            created_at: now,
            scheduled_at: now.checked_add_signed(march).unwrap_or(DateTime::<Utc>::MAX_UTC),
            finished_at: None,
        };
        self.store.insert_battle(&battle).await?;

        info!(
            battle_id = %battle.id,
            attacker = %battle.attacker_village,
            defender = %battle.defender_village,
            units = unit_total(&battle.attacker.units),
            scheduled_at = %battle.scheduled_at,
            "attack launched"
        );
        Ok(battle)
    }

    /// Withdraw a pending battle. Only its attacker may cancel it.
    pub async fn cancel_battle(
        &self,
        principal: &Principal,
        battle_id: BattleId,
        now: DateTime<Utc>,
    ) -> Result<Battle, GameError> {
        let battle = self.load_battle(battle_id).await?;
        if battle.attacker_player != principal.player_id {
            return Err(GameError::NotAttacker(battle_id));
        }
        if battle.status != BattleStatus::Pending {
            return Err(GameError::BattleNotPending {
                id: battle_id,
                status: battle.status,
            });
        }

        let cancelled = self
            .store
            .transition_battle(BattleTransition {
                battle_id,
                from: BattleStatus::Pending,
                to: BattleStatus::Cancelled,
                result: None,
                finished_at: Some(now),
            })
            .await?;
        if !cancelled {
            let current = self.load_battle(battle_id).await?;
            return Err(GameError::BattleNotPending {
                id: battle_id,
                status: current.status,
            });
        }

        info!(%battle_id, "battle cancelled");
        self.events.emit(DomainEvent::BattleCancelled {
            battle_id,
            attacker: battle.attacker_player,
            defender: battle.defender_player,
        });
        Ok(Battle {
            status: BattleStatus::Cancelled,
            finished_at: Some(now),
            ..battle
        })
    }

    /// Resolve a battle and commit its result.
    ///
    /// A pending battle is first claimed (`pending -> active`); an active one
    /// left behind by an interrupted resolver is picked up as is. A terminal
    /// battle is rejected with [`GameError::AlreadyResolved`].
    pub async fn resolve_battle(
        &self,
        battle_id: BattleId,
        now: DateTime<Utc>,
    ) -> Result<BattleResult, GameError> {
        let battle = self.load_battle(battle_id).await?;
        match battle.status {
            BattleStatus::Resolved | BattleStatus::Cancelled => {
                error!(%battle_id, status = %battle.status, "refusing to resolve terminal battle");
                return Err(GameError::AlreadyResolved(battle_id));
            }
            BattleStatus::Pending => {
                let claimed = self
                    .store
                    .transition_battle(BattleTransition {
                        battle_id,
                        from: BattleStatus::Pending,
                        to: BattleStatus::Active,
                        result: None,
                        finished_at: None,
                    })
                    .await?;
                if !claimed {
                    return Err(self.lost_race(battle_id).await);
                }
            }
            BattleStatus::Active => {
                debug!(%battle_id, "resuming active battle");
            }
        }

        let assessment = assess(&battle, &self.config.combat);
        let plunder = if assessment.outcome.is_win() {
            let mut rng = self.plunder_rng.lock().unwrap_or_else(PoisonError::into_inner);
            draw_plunder(&mut *rng)
        } else {
            ResourceLedger::ZERO
        };
        let result = BattleResult {
            outcome: assessment.outcome,
            raw_attack_power: assessment.raw_attack_power,
            attack_power: assessment.attack_power,
            defense_power: assessment.defense_power,
            modifiers: assessment.modifiers,
            rounds: assessment.rounds,
            attacker_losses: assessment.attacker_losses,
            defender_losses: assessment.defender_losses,
            experience: assessment.experience,
            plunder,
            resolved_at: now,
        };

        let committed = self
            .store
            .transition_battle(BattleTransition {
                battle_id,
                from: BattleStatus::Active,
                to: BattleStatus::Resolved,
                result: Some(result.clone()),
                finished_at: Some(now),
            })
            .await?;
        if !committed {
            return Err(self.lost_race(battle_id).await);
        }

        info!(
            %battle_id,
            outcome = %result.outcome,
            attack_power = result.attack_power,
            defense_power = result.defense_power,
            rounds = result.rounds,
            "battle resolved"
        );
        self.events.emit(DomainEvent::BattleResolved {
            battle_id,
            attacker: battle.attacker_player,
            defender: battle.defender_player,
            result: result.clone(),
        });
        Ok(result)
    }

    /// Explain a lost compare-and-swap by re-reading the row.
    async fn lost_race(&self, battle_id: BattleId) -> GameError {
        match self.store.get_battle(battle_id).await {
            Ok(Some(b)) if b.status.is_terminal() => GameError::AlreadyResolved(battle_id),
            Ok(Some(b)) => GameError::Conflict(format!("battle {battle_id} is {}", b.status)),
            Ok(None) => GameError::BattleNotFound(battle_id),
            Err(e) => GameError::Store(e),
        }
    }

    /// A battle together with summaries of both villages.
    pub async fn get_battle_with_details(
        &self,
        battle_id: BattleId,
    ) -> Result<BattleDetails, GameError> {
        let battle = self.load_battle(battle_id).await?;
        let attacker_village = self
            .store
            .get_village(battle.attacker_village)
            .await?
            .as_ref()
            .map(VillageSummary::from);
        let defender_village = self
            .store
            .get_village(battle.defender_village)
            .await?
            .as_ref()
            .map(VillageSummary::from);
        Ok(BattleDetails {
            battle,
            attacker_village,
            defender_village,
        })
    }
}

/// Total units in an army.
pub fn unit_total(units: &[UnitStack]) -> u64 {
    units.iter().map(|s| u64::from(s.count)).sum()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::arithmetic_side_effects)]

    use std::collections::BTreeMap;

    use super::*;
    use crate::events::RecordingSink;
    use crate::memory::MemoryStore;
    use realm_types::{Garrison, PlayerId, UnitType, Village};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// Combat catalog where one infantry is worth exactly one power point.
    fn unit_combat() -> CombatConfig {
        CombatConfig {
            units: BTreeMap::from([(
                UnitType::Infantry,
                UnitSpec {
                    attack: 1.0,
                    defense: 1.0,
                },
            )]),
            ..CombatConfig::default()
        }
    }

    fn battle_with(attack: u32, defense: u32, terrain: Terrain, weather: Weather) -> Battle {
        let now = Utc::now();
        Battle {
            id: BattleId::new(),
            attacker_village: VillageId::new(),
            defender_village: VillageId::new(),
            attacker_player: PlayerId::new(),
            defender_player: PlayerId::new(),
            attacker: ArmySnapshot {
                units: vec![UnitStack {
                    unit_type: UnitType::Infantry,
                    count: attack,
                }],
                ..ArmySnapshot::default()
            },
            defender: ArmySnapshot {
                units: vec![UnitStack {
                    unit_type: UnitType::Infantry,
                    count: defense,
                }],
                ..ArmySnapshot::default()
            },
            terrain,
            weather,
            status: BattleStatus::Pending,
            result: None,
            created_at: now,
            scheduled_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn decisive_win_example() {
        let battle = battle_with(1000, 600, Terrain::Plains, Weather::Clear);
        let a = assess(&battle, &unit_combat());
        assert_eq!(a.outcome, BattleOutcome::DecisiveWin);
        assert!(approx(a.attacker_losses, 100.0));
        assert!(approx(a.defender_losses, 480.0));
        assert_eq!(a.experience, 60);
        assert_eq!(a.rounds, 10);
    }

    #[test]
    fn forest_modifier_example() {
        let battle = battle_with(100, 1000, Terrain::Forest, Weather::Clear);
        let a = assess(&battle, &unit_combat());
        assert!(approx(a.attack_power, 110.0));
        assert!(approx(a.raw_attack_power, 100.0));
        assert_eq!(a.outcome, BattleOutcome::Defeat);
        // 110 / 20 = 5.5 -> 5
        assert_eq!(a.experience, 5);
    }

    #[test]
    fn marginal_win_and_defeat_thresholds() {
        let marginal = assess(&battle_with(700, 600, Terrain::Plains, Weather::Clear), &unit_combat());
        assert_eq!(marginal.outcome, BattleOutcome::MarginalWin);
        assert!(approx(marginal.attacker_losses, 210.0));
        assert!(approx(marginal.defender_losses, 360.0));

        let tie = assess(&battle_with(600, 600, Terrain::Plains, Weather::Clear), &unit_combat());
        assert_eq!(tie.outcome, BattleOutcome::Defeat);
        assert!(approx(tie.attacker_losses, 420.0));
        assert!(approx(tie.defender_losses, 120.0));
        assert_eq!(tie.experience, 30);
    }

    #[test]
    fn rounds_are_clamped() {
        let small = assess(&battle_with(10, 10, Terrain::Plains, Weather::Clear), &unit_combat());
        assert_eq!(small.rounds, 3);
        let mid = assess(&battle_with(650, 10, Terrain::Plains, Weather::Clear), &unit_combat());
        assert_eq!(mid.rounds, 6);
    }

    #[test]
    fn hero_and_technology_modifiers_compose_in_order() {
        let mut battle = battle_with(100, 1, Terrain::Mountain, Weather::Rain);
        battle.attacker.heroes = vec![HeroSnapshot {
            hero_id: HeroId::new(),
            level: 4,
        }];
        battle.attacker.technologies = BTreeMap::from([(String::from("tactics"), 5)]);
        let a = assess(&battle, &unit_combat());
        assert!(approx(a.modifiers.hero, 1.2));
        assert!(approx(a.modifiers.technology, 1.1));
        assert!(approx(a.attack_power, 100.0 * 1.15 * 0.90 * 1.2 * 1.1));
    }

    #[test]
    fn unknown_units_contribute_zero() {
        let mut battle = battle_with(100, 50, Terrain::Plains, Weather::Clear);
        battle.attacker.units.push(UnitStack {
            unit_type: UnitType::Siege,
            count: 1000,
        });
        let a = assess(&battle, &unit_combat());
        assert!(approx(a.raw_attack_power, 100.0));
    }

    #[test]
    fn plunder_stays_in_range_and_is_seedable() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let p = draw_plunder(&mut a);
            assert!((50..150).contains(&p.wood));
            assert!((40..120).contains(&p.stone));
            assert!((30..90).contains(&p.food));
            assert!((10..30).contains(&p.gold));
            assert_eq!(p, draw_plunder(&mut b));
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        engine: BattleEngine<MemoryStore>,
        attacker: Principal,
        home: Village,
        target: Village,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let attacker = Principal::new(PlayerId::new(), "alice");
        let now = Utc::now();
        let village = |owner: PlayerId, name: &str, x: i32, y: i32| Village {
            id: VillageId::new(),
            owner,
            name: name.to_owned(),
            x,
            y,
            resources: ResourceLedger::ZERO,
            last_accrual_time: now,
            created_at: now,
        };
        let home = village(attacker.player_id, "Redhold", 0, 0);
        let target = village(PlayerId::new(), "Greywater", 3, 4);
        store.insert_village(home.clone());
        store.insert_village(target.clone());
        store.set_garrison(
            home.id,
            Garrison {
                units: vec![UnitStack {
                    unit_type: UnitType::Cavalry,
                    count: 100,
                }],
                heroes: vec![HeroSnapshot {
                    hero_id: HeroId::new(),
                    level: 3,
                }],
            },
        );
        store.set_garrison(
            target.id,
            Garrison {
                units: vec![UnitStack {
                    unit_type: UnitType::Infantry,
                    count: 20,
                }],
                heroes: Vec::new(),
            },
        );
        let mut config = GameConfig::default();
        config.combat.plunder_seed = Some(42);
        let engine = BattleEngine::new(
            Arc::clone(&store),
            Arc::new(config),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        Fixture {
            store,
            sink,
            engine,
            attacker,
            home,
            target,
        }
    }

    fn order(f: &Fixture, count: u32) -> AttackOrder {
        AttackOrder {
            attacker_village: f.home.id,
            defender_village: f.target.id,
            units: vec![UnitStack {
                unit_type: UnitType::Cavalry,
                count,
            }],
            heroes: Vec::new(),
            terrain: Terrain::Plains,
            weather: Weather::Clear,
        }
    }

    #[tokio::test]
    async fn attack_snapshots_and_schedules() {
        let f = fixture();
        let now = Utc::now();
        let battle = f.engine.attack(&f.attacker, order(&f, 40), now).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Pending);
        assert_eq!(unit_total(&battle.attacker.units), 40);
        assert_eq!(unit_total(&battle.defender.units), 20);
        // distance 5 tiles × 30 s = 150 s, above the 60 s floor
        assert_eq!(battle.scheduled_at, now + chrono::Duration::seconds(150));
        assert!(f.store.battle(battle.id).is_some());
    }

    #[tokio::test]
    async fn attack_validation() {
        let f = fixture();
        let now = Utc::now();

        let stranger = Principal::new(PlayerId::new(), "mallory");
        let err = f.engine.attack(&stranger, order(&f, 1), now).await;
        assert!(matches!(err, Err(GameError::NotOwner(_))));

        let err = f.engine.attack(&f.attacker, order(&f, 101), now).await;
        assert!(matches!(err, Err(GameError::InsufficientUnits { available: 100, .. })));

        let err = f.engine.attack(&f.attacker, order(&f, 0), now).await;
        assert!(matches!(err, Err(GameError::InvalidArmy(_))));

        let mut self_attack = order(&f, 1);
        self_attack.defender_village = f.home.id;
        let err = f.engine.attack(&f.attacker, self_attack, now).await;
        assert!(matches!(err, Err(GameError::InvalidArmy(_))));

        let mut ghost_hero = order(&f, 1);
        ghost_hero.heroes.push(HeroId::new());
        let err = f.engine.attack(&f.attacker, ghost_hero, now).await;
        assert!(matches!(err, Err(GameError::InvalidArmy(_))));
    }

    #[tokio::test]
    async fn resolve_once_then_reject() {
        let f = fixture();
        let now = Utc::now();
        let battle = f.engine.attack(&f.attacker, order(&f, 40), now).await.unwrap();

        // 40 cavalry × 25 = 1000 vs 20 infantry × 15 = 300
        let result = f.engine.resolve_battle(battle.id, now).await.unwrap();
        assert_eq!(result.outcome, BattleOutcome::DecisiveWin);
        assert!(!result.plunder.is_zero());

        let stored = f.store.battle(battle.id).unwrap();
        assert_eq!(stored.status, BattleStatus::Resolved);
        assert_eq!(stored.result.as_ref(), Some(&result));

        let again = f.engine.resolve_battle(battle.id, now).await;
        assert!(matches!(again, Err(GameError::AlreadyResolved(_))));
        assert_eq!(f.sink.events().len(), 1);
        assert_eq!(f.sink.events()[0].recipients().len(), 2);
    }

    #[tokio::test]
    async fn cancel_only_by_attacker_while_pending() {
        let f = fixture();
        let now = Utc::now();
        let battle = f.engine.attack(&f.attacker, order(&f, 5), now).await.unwrap();

        let defender = Principal::new(f.target.owner, "bob");
        let err = f.engine.cancel_battle(&defender, battle.id, now).await;
        assert!(matches!(err, Err(GameError::NotAttacker(_))));

        let cancelled = f.engine.cancel_battle(&f.attacker, battle.id, now).await.unwrap();
        assert_eq!(cancelled.status, BattleStatus::Cancelled);

        let err = f.engine.cancel_battle(&f.attacker, battle.id, now).await;
        assert!(matches!(
            err,
            Err(GameError::BattleNotPending {
                status: BattleStatus::Cancelled,
                ..
            })
        ));
        let err = f.engine.resolve_battle(battle.id, now).await;
        assert!(matches!(err, Err(GameError::AlreadyResolved(_))));
    }

    #[tokio::test]
    async fn details_include_both_villages() {
        let f = fixture();
        let battle = f
            .engine
            .attack(&f.attacker, order(&f, 1), Utc::now())
            .await
            .unwrap();
        let details = f.engine.get_battle_with_details(battle.id).await.unwrap();
        assert_eq!(details.attacker_village.map(|v| v.name), Some(String::from("Redhold")));
        assert_eq!(details.defender_village.map(|v| v.name), Some(String::from("Greywater")));
    }
}
