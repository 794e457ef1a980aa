//! Replication envelopes exchanged between hub instances over the broker.
//!
//! Every local change a hub makes (a chat message, a join, a leave, a ban,
//! a domain event for a player) is wrapped in an [`Envelope`] and
//! published on the broker subject of its channel. Receiving hubs drop
//! envelopes they originated themselves and envelopes whose id they have
//! already applied, so at-least-once broker delivery is applied at most
//! once per hub.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use realm_types::{BanEntry, ChatMessage, DomainEvent, HubId, MessageId};
use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// One replicated change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id of this change.
    pub id: MessageId,
    /// Hub that made the change.
    pub origin: HubId,
    /// Channel the change belongs to.
    pub channel: String,
    /// The change itself.
    pub kind: EnvelopeKind,
}

/// What an [`Envelope`] carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A chat message was accepted.
    Chat {
        /// The message.
        message: ChatMessage,
    },
    /// A user joined the channel.
    Joined {
        /// The user.
        username: String,
        /// Join time.
        at: DateTime<Utc>,
    },
    /// A user left the channel.
    Left {
        /// The user.
        username: String,
        /// `true` when the user left because their last connection to the
        /// originating hub closed, `false` for an explicit leave.
        #[serde(default)]
        disconnected: bool,
    },
    /// A user was banned (and removed) from the channel.
    Banned {
        /// The ban.
        ban: BanEntry,
    },
    /// A domain event for the player owning this `player:<id>` channel.
    Event {
        /// The event.
        event: DomainEvent,
    },
}

impl EnvelopeKind {
    /// Short name, used as a log field.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Joined { .. } => "joined",
            Self::Left { .. } => "left",
            Self::Banned { .. } => "banned",
            Self::Event { .. } => "event",
        }
    }

    /// Whether the change alters channel membership.
    pub const fn changes_membership(&self) -> bool {
        matches!(self, Self::Joined { .. } | Self::Left { .. } | Self::Banned { .. })
    }
}

impl Envelope {
    /// Wrap a change made by hub `origin`.
    pub fn new(origin: HubId, channel: impl Into<String>, kind: EnvelopeKind) -> Self {
        Self {
            id: MessageId::new(),
            origin,
            channel: channel.into(),
            kind,
        }
    }

    /// Encode for the broker.
    pub fn encode(&self) -> Result<Vec<u8>, HubError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a broker payload.
    pub fn decode(payload: &[u8]) -> Result<Self, HubError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Bounded set of recently applied envelope ids.
///
/// Once `capacity` ids are held the oldest is forgotten.
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
    capacity: usize,
}

impl RecentIds {
    /// An empty set remembering at most `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remember `id`. Returns `false` if it was already remembered.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}
