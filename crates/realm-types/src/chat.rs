//! Chat message, ban, and channel snapshot types.
//!
//! These are the units the messaging hub keeps in memory, replicates over
//! the broker, and journals to the channel snapshot store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::ChannelType;
use crate::ids::MessageId;

/// A chat message posted to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier; used to drop broker redeliveries.
    pub id: MessageId,
    /// Channel name.
    pub channel: String,
    /// Sender username.
    pub sender: String,
    /// Message body.
    pub text: String,
    /// When the message was accepted by the originating hub.
    pub sent_at: DateTime<Utc>,
}

/// A ban on one username in one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    /// Banned username.
    pub username: String,
    /// Expiry; `None` is permanent.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BanEntry {
    /// Whether the ban is in force at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

/// Persistable state of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Channel name.
    pub name: String,
    /// Routing class.
    pub channel_type: ChannelType,
    /// Members keyed by username, with join time.
    pub members: BTreeMap<String, DateTime<Utc>>,
    /// Bans in force when the snapshot was taken.
    pub bans: Vec<BanEntry>,
    /// Recent history, oldest first.
    pub recent: Vec<ChatMessage>,
}
