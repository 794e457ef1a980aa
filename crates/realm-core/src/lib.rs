//! Simulation core for the Realm engine.
//!
//! This crate advances game state over time and resolves battles. It never
//! talks to a database or a broker directly: all persistence goes through
//! the [`GameStore`] trait and all notifications through [`EventSink`].
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `realm-config.yaml` into
//!   strongly-typed structs, including the building and unit catalogs.
//! - [`bonus`] -- [`BonusProvider`] trait and the additive [`BonusSet`].
//! - [`accrual`] -- Resource Accrual Calculator.
//! - [`construction`] -- Requirement checks, upgrade enqueue and the
//!   Construction Queue Processor.
//! - [`battle`] -- Battle Resolution Engine.
//! - [`scheduler`] -- Tick Scheduler driving the periodic sweeps.
//! - [`store`] -- [`GameStore`] trait.
//! - [`memory`] -- In-memory [`GameStore`] for tests.
//! - [`events`] -- [`EventSink`] trait.
//! - [`error`] -- [`GameError`] and [`StoreError`].
//!
//! [`GameStore`]: store::GameStore
//! [`EventSink`]: events::EventSink
//! [`BonusProvider`]: bonus::BonusProvider
//! [`BonusSet`]: bonus::BonusSet
//! [`GameError`]: error::GameError
//! [`StoreError`]: error::StoreError

pub mod accrual;
pub mod battle;
pub mod bonus;
pub mod config;
pub mod construction;
pub mod error;
pub mod events;
pub mod memory;
mod numeric;
pub mod scheduler;
pub mod store;

pub use error::{ErrorKind, GameError, StoreError};
