//! Shared type definitions for the Realm simulation engine.
//!
//! This crate is the single source of truth for all types used across the
//! Realm workspace: the simulation core, the data layer, the messaging hub
//! and the server binary.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for all entity identifiers
//! - [`enums`] -- Resources, buildings, units, terrain, weather, statuses
//! - [`structs`] -- Villages, buildings, battles, ledgers, principals
//! - [`events`] -- Domain events fanned out to players
//! - [`chat`] -- Chat messages, bans and channel snapshots

pub mod chat;
pub mod enums;
pub mod events;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use chat::{BanEntry, ChannelSnapshot, ChatMessage};
pub use enums::{
    BattleOutcome, BattleStatus, BuildingType, ChannelType, Resource, Terrain, UnitType,
    UnknownVariant, Weather, WorldType,
};
pub use events::{DomainEvent, player_channel};
pub use ids::{AllianceId, BattleId, HeroId, HubId, MessageId, PlayerId, VillageId, WorldEventId};
pub use structs::{
    AllianceStanding, AppliedModifiers, ArmySnapshot, Battle, BattleDetails, BattleResult,
    Building, CompletionRecord, Garrison, HeroSnapshot, Principal, ProductionRates,
    ResourceLedger, UnitStack, Village, VillageSummary, WorldEvent,
};
