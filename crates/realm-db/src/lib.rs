//! Data layer for the Realm engine (`PostgreSQL` + `Dragonfly`).
//!
//! `PostgreSQL` is the relational store behind the simulation core's
//! [`GameStore`](realm_core::store::GameStore) trait. `Dragonfly` holds the
//! messaging hub's channel journal.
//!
//! # Architecture
//!
//! ```text
//! Tick Scheduler / request handlers
//!     |
//!     +-- GameStore ----------> PostgreSQL (PostgresPool)
//!                                 |-- villages, buildings, garrisons
//!                                 |-- battles
//!                                 +-- technologies, alliances, world_events
//!
//! Messaging Hub / Sync Manager
//!     |
//!     +-- channel journal ----> Dragonfly (DragonflyPool)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`game_store`] -- [`GameRepository`] queries and the `GameStore` impl
//! - [`dragonfly`] -- Channel membership, ban and history journal
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod game_store;
pub mod postgres;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use game_store::GameRepository;
pub use postgres::{PoolSettings, PostgresPool};
