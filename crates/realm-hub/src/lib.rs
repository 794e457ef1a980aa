//! Presence and messaging for the Realm engine.
//!
//! # Architecture
//!
//! ```text
//! clients ──► MessagingHub ──► outbound envelopes ──► SyncManager ──► broker
//!                 ▲                                      │    │
//!                 └────────── apply_remote ◄─────────────┘    └──► channel journal
//! ```
//!
//! - [`hub`] -- channel membership, bans, history and local fan-out
//! - [`channel`] -- per-channel state
//! - [`envelope`] -- replication wire format
//! - [`broker`] -- NATS and in-process pub/sub
//! - [`store`] -- channel journal used for rehydration
//! - [`sync`] -- broker connection lifecycle
//! - [`error`] -- hub errors

pub mod broker;
pub mod channel;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod store;
pub mod sync;

pub use broker::{Broker, BrokerConnector, LocalBus, NatsConnector};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::HubError;
pub use hub::{Connection, ConnectionId, Delivery, MessagingHub};
pub use store::{ChannelSnapshotStore, MemorySnapshotStore, NoSnapshotStore};
pub use sync::{SyncManager, SyncOptions, SyncState};
