//! Tick Scheduler.
//!
//! Two fixed-interval loops drive every time-based transition:
//!
//! - the **village sweep** credits accrual and finalizes due upgrades for
//!   every village;
//! - the **battle sweep** resolves every battle whose march has ended.
//!
//! Each sweep type holds its own lease (a `try_lock` on a per-sweep mutex),
//! so a sweep never overlaps with itself; a tick that finds the lease taken
//! is skipped. A failing item is logged and skipped without aborting the
//! rest of the sweep. Transient store errors are retried with doubling
//! backoff up to `tick.retry_attempts`.
//!
//! Shutdown is cooperative: [`TickScheduler::stop`] makes both loops finish
//! the item in hand and return.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use realm_types::{BattleId, ResourceLedger, VillageId};
use tokio::sync::{Mutex, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::accrual::ResourceAccrual;
use crate::battle::BattleEngine;
use crate::config::{GameConfig, TickConfig};
use crate::construction::ConstructionQueue;
use crate::error::{ErrorKind, GameError};
use crate::events::EventSink;
use crate::store::GameStore;

/// Which sweep produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Accrual and construction over all villages.
    Villages,
    /// Resolution of due battles.
    Battles,
}

/// Summary of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// The sweep type.
    pub kind: SweepKind,
    /// Items attempted.
    pub items: usize,
    /// Items that finished without error.
    pub succeeded: usize,
    /// Items that failed after retries.
    pub failed: usize,
    /// Items another writer handled first.
    pub skipped: usize,
    /// Retries spent on transient errors.
    pub retries: u32,
    /// Resources credited by accrual.
    pub credited: ResourceLedger,
    /// Upgrades finalized.
    pub upgrades_completed: usize,
    /// Battles resolved.
    pub battles_resolved: usize,
    /// Whether shutdown cut the sweep short.
    pub interrupted: bool,
}

impl SweepReport {
    const fn new(kind: SweepKind) -> Self {
        Self {
            kind,
            items: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            retries: 0,
            credited: ResourceLedger::ZERO,
            upgrades_completed: 0,
            battles_resolved: 0,
            interrupted: false,
        }
    }
}

/// Log a failed sweep item at the level its classification calls for.
fn log_item_failure(item: &str, id: &dyn core::fmt::Display, err: &GameError) {
    match err.kind() {
        ErrorKind::Validation => debug!(item, %id, error = %err, "sweep item rejected"),
        ErrorKind::Transient => warn!(item, %id, error = %err, "sweep item failed after retries"),
        ErrorKind::Invariant => error!(item, %id, error = %err, "sweep item violated an invariant"),
    }
}

/// Owns the periodic sweeps and the engines they drive.
pub struct TickScheduler<S> {
    store: Arc<S>,
    accrual: Arc<ResourceAccrual<S>>,
    construction: Arc<ConstructionQueue<S>>,
    battles: Arc<BattleEngine<S>>,
    tick: TickConfig,
    village_lease: Mutex<()>,
    battle_lease: Mutex<()>,
    stop_tx: watch::Sender<bool>,
}

impl<S> core::fmt::Debug for TickScheduler<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TickScheduler")
            .field("tick", &self.tick)
            .field("stopping", &*self.stop_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: GameStore> TickScheduler<S> {
    /// Build the engines over a store and wrap them in a scheduler.
    pub fn new(store: Arc<S>, config: Arc<GameConfig>, events: Arc<dyn EventSink>) -> Self {
        let accrual = Arc::new(ResourceAccrual::new(Arc::clone(&store), Arc::clone(&config)));
        let construction = Arc::new(ConstructionQueue::new(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&events),
        ));
        let battles = Arc::new(BattleEngine::new(
            Arc::clone(&store),
            Arc::clone(&config),
            events,
        ));
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            accrual,
            construction,
            battles,
            tick: config.tick.clone(),
            village_lease: Mutex::new(()),
            battle_lease: Mutex::new(()),
            stop_tx,
        }
    }

    /// The accrual calculator the village sweep uses.
    pub const fn accrual(&self) -> &Arc<ResourceAccrual<S>> {
        &self.accrual
    }

    /// The construction queue the village sweep uses.
    pub const fn construction(&self) -> &Arc<ConstructionQueue<S>> {
        &self.construction
    }

    /// The battle engine the battle sweep uses.
    pub const fn battles(&self) -> &Arc<BattleEngine<S>> {
        &self.battles
    }

    /// Ask both loops to finish their current item and return.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Run both sweep loops until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        info!(
            sweep_interval_secs = self.tick.sweep_interval_secs,
            battle_interval_secs = self.tick.battle_interval_secs,
            "tick scheduler started"
        );
        tokio::join!(
            self.sweep_loop(SweepKind::Villages, self.tick.sweep_interval_secs),
            self.sweep_loop(SweepKind::Battles, self.tick.battle_interval_secs),
        );
        info!("tick scheduler stopped");
    }

    async fn sweep_loop(&self, kind: SweepKind, every_secs: u64) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = interval(Duration::from_secs(every_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match kind {
                        SweepKind::Villages => {
                            self.run_village_sweep(now).await;
                        }
                        SweepKind::Battles => {
                            self.run_battle_sweep(now).await;
                        }
                    }
                }
            }
        }
    }

    /// Run `op`, retrying transient failures with doubling backoff.
    async fn with_retry<T, F, Fut>(&self, retries: &mut u32, mut op: F) -> Result<T, GameError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GameError>>,
    {
        let attempts = self.tick.retry_attempts.max(1);
        let mut backoff = Duration::from_millis(self.tick.retry_backoff_ms);
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %err, "transient failure, retrying");
                    *retries = retries.saturating_add(1);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt = attempt.saturating_add(1);
                }
                other => return other,
            }
        }
    }

    /// Accrue and process construction for every village.
    ///
    /// Returns `None` when another village sweep holds the lease.
    pub async fn run_village_sweep(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let Ok(_lease) = self.village_lease.try_lock() else {
            debug!("village sweep already running, skipping tick");
            return None;
        };
        let mut report = SweepReport::new(SweepKind::Villages);

        let ids = self
            .with_retry(&mut report.retries, || async {
                self.store.list_village_ids().await.map_err(GameError::from)
            })
            .await;
        let ids: Vec<VillageId> = match ids {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "village sweep could not list villages");
                report.failed = 1;
                return Some(report);
            }
        };

        for village_id in ids {
            if self.is_stopping() {
                report.interrupted = true;
                break;
            }
            report.items = report.items.saturating_add(1);
            let mut ok = true;

            match self
                .with_retry(&mut report.retries, || self.accrual.accrue(village_id, now))
                .await
            {
                Ok(outcome) => report.credited = report.credited.saturating_add(&outcome.delta),
                Err(err) => {
                    ok = false;
                    log_item_failure("accrual", &village_id, &err);
                }
            }

            match self
                .with_retry(&mut report.retries, || {
                    self.construction.process_queue(village_id, now)
                })
                .await
            {
                Ok(records) => {
                    report.upgrades_completed = report.upgrades_completed.saturating_add(records.len());
                }
                Err(err) => {
                    ok = false;
                    log_item_failure("construction", &village_id, &err);
                }
            }

            if ok {
                report.succeeded = report.succeeded.saturating_add(1);
            } else {
                report.failed = report.failed.saturating_add(1);
            }
        }

        info!(
            villages = report.items,
            failed = report.failed,
            retries = report.retries,
            upgrades = report.upgrades_completed,
            wood = report.credited.wood,
            stone = report.credited.stone,
            food = report.credited.food,
            gold = report.credited.gold,
            interrupted = report.interrupted,
            "village sweep finished"
        );
        Some(report)
    }

    /// Resolve every battle whose scheduled time has passed.
    ///
    /// Returns `None` when another battle sweep holds the lease.
    pub async fn run_battle_sweep(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let Ok(_lease) = self.battle_lease.try_lock() else {
            debug!("battle sweep already running, skipping tick");
            return None;
        };
        let mut report = SweepReport::new(SweepKind::Battles);

        let due = self
            .with_retry(&mut report.retries, || async {
                self.store.get_due_battles(now).await.map_err(GameError::from)
            })
            .await;
        let due: Vec<BattleId> = match due {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "battle sweep could not list due battles");
                report.failed = 1;
                return Some(report);
            }
        };

        for battle_id in due {
            if self.is_stopping() {
                report.interrupted = true;
                break;
            }
            report.items = report.items.saturating_add(1);
            match self
                .with_retry(&mut report.retries, || self.battles.resolve_battle(battle_id, now))
                .await
            {
                Ok(_) => {
                    report.succeeded = report.succeeded.saturating_add(1);
                    report.battles_resolved = report.battles_resolved.saturating_add(1);
                }
                Err(GameError::AlreadyResolved(_) | GameError::Conflict(_)) => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(err) => {
                    report.failed = report.failed.saturating_add(1);
                    log_item_failure("battle", &battle_id, &err);
                }
            }
        }

        info!(
            battles = report.items,
            resolved = report.battles_resolved,
            skipped = report.skipped,
            failed = report.failed,
            retries = report.retries,
            interrupted = report.interrupted,
            "battle sweep finished"
        );
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

    use super::*;
    use crate::battle::AttackOrder;
    use crate::events::RecordingSink;
    use crate::memory::MemoryStore;
    use realm_types::{
        BattleStatus, Building, BuildingType, Garrison, PlayerId, Principal, Terrain, UnitStack,
        UnitType, Village, Weather,
    };

    fn config() -> Arc<GameConfig> {
        let mut config = GameConfig::default();
        config.tick.retry_backoff_ms = 1;
        config.combat.plunder_seed = Some(1);
        Arc::new(config)
    }

    fn village(owner: PlayerId, t0: DateTime<Utc>) -> Village {
        Village {
            id: VillageId::new(),
            owner,
            name: String::from("Oakvale"),
            x: 0,
            y: 0,
            resources: ResourceLedger::ZERO,
            last_accrual_time: t0,
            created_at: t0,
        }
    }

    fn scheduler(store: &Arc<MemoryStore>) -> (TickScheduler<MemoryStore>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let scheduler = TickScheduler::new(
            Arc::clone(store),
            config(),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        (scheduler, sink)
    }

    #[tokio::test]
    async fn village_sweep_accrues_and_completes() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        let v = village(PlayerId::new(), t0);
        store.insert_village(v.clone());
        store.insert_building(Building::idle(v.id, BuildingType::WoodCutter, 3));
        store.insert_building(Building {
            village_id: v.id,
            building_type: BuildingType::Farm,
            level: 1,
            is_upgrading: true,
            upgrade_completion_time: Some(t0),
        });
        let (scheduler, sink) = scheduler(&store);

        let now = t0 + chrono::Duration::seconds(600);
        let report = scheduler.run_village_sweep(now).await.unwrap();
        assert_eq!(report.items, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.credited.wood, 300);
        assert_eq!(report.upgrades_completed, 1);
        assert_eq!(sink.events().len(), 1);

        // Overlapping re-run at the same instant credits nothing.
        let again = scheduler.run_village_sweep(now).await.unwrap();
        assert!(again.credited.is_zero());
        assert_eq!(again.upgrades_completed, 0);
        assert_eq!(store.village(v.id).unwrap().resources.wood, 300);
    }

    #[tokio::test]
    async fn sweep_skips_when_lease_is_held() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _sink) = scheduler(&store);
        let _held = scheduler.village_lease.lock().await;
        assert!(scheduler.run_village_sweep(Utc::now()).await.is_none());
        assert!(scheduler.run_battle_sweep(Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn failing_village_does_not_abort_sweep() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        let good = village(PlayerId::new(), t0);
        let bad = village(PlayerId::new(), t0);
        store.insert_village(good.clone());
        store.insert_village(bad.clone());
        store.insert_building(Building::idle(good.id, BuildingType::Farm, 1));
        store.break_village(bad.id);
        let (scheduler, _sink) = scheduler(&store);

        let report = scheduler
            .run_village_sweep(t0 + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(report.items, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.village(good.id).unwrap().resources.food, 12);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _sink) = scheduler(&store);
        store.fail_transiently(2);
        let report = scheduler.run_village_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_sweep_listing() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _sink) = scheduler(&store);
        store.fail_transiently(10);
        let report = scheduler.run_battle_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retries, 2);
    }

    #[tokio::test]
    async fn battle_sweep_resolves_only_due_battles() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        let alice = Principal::new(PlayerId::new(), "alice");
        let home = village(alice.player_id, t0);
        let mut near = village(PlayerId::new(), t0);
        near.x = 1;
        let mut far = village(PlayerId::new(), t0);
        far.x = 100;
        for v in [&home, &near, &far] {
            store.insert_village(v.clone());
        }
        store.set_garrison(
            home.id,
            Garrison {
                units: vec![UnitStack {
                    unit_type: UnitType::Infantry,
                    count: 50,
                }],
                heroes: Vec::new(),
            },
        );
        let (scheduler, sink) = scheduler(&store);
        let order = |target: VillageId| AttackOrder {
            attacker_village: home.id,
            defender_village: target,
            units: vec![UnitStack {
                unit_type: UnitType::Infantry,
                count: 10,
            }],
            heroes: Vec::new(),
            terrain: Terrain::Plains,
            weather: Weather::Clear,
        };
        let soon = scheduler.battles().attack(&alice, order(near.id), t0).await.unwrap();
        let late = scheduler.battles().attack(&alice, order(far.id), t0).await.unwrap();

        // near: 60 s floor; far: 100 tiles × 30 s
        let report = scheduler
            .run_battle_sweep(t0 + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(report.battles_resolved, 1);
        assert_eq!(store.battle(soon.id).unwrap().status, BattleStatus::Resolved);
        assert_eq!(store.battle(late.id).unwrap().status, BattleStatus::Pending);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn stop_ends_run() {
        let store = Arc::new(MemoryStore::new());
        let (scheduler, _sink) = scheduler(&store);
        let scheduler = Arc::new(scheduler);
        let handle = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop();
        let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(finished.is_ok());
        assert!(scheduler.is_stopping());
    }
}
