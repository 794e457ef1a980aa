//! Channel journal used to rehydrate hub state across restarts.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use realm_db::DragonflyPool;
use realm_types::ChannelSnapshot;

use crate::channel::Channel;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::HubError;

/// Durable record of channel membership, bans and recent history.
pub trait ChannelSnapshotStore: Send + Sync + 'static {
    /// Every journaled channel.
    fn load(&self) -> impl Future<Output = Result<Vec<ChannelSnapshot>, HubError>> + Send;

    /// Journal one locally originated change. Domain events are not
    /// journaled.
    fn record(
        &self,
        envelope: &Envelope,
        history_limit: usize,
    ) -> impl Future<Output = Result<(), HubError>> + Send;
}

impl ChannelSnapshotStore for DragonflyPool {
    async fn load(&self) -> Result<Vec<ChannelSnapshot>, HubError> {
        Ok(self.load_channels().await?)
    }

    async fn record(&self, envelope: &Envelope, history_limit: usize) -> Result<(), HubError> {
        let channel = envelope.channel.as_str();
        match &envelope.kind {
            EnvelopeKind::Chat { message } => self.record_message(message, history_limit).await?,
            EnvelopeKind::Joined { username, at } => self.record_join(channel, username, *at).await?,
            EnvelopeKind::Left { username, .. } => self.record_leave(channel, username).await?,
            EnvelopeKind::Banned { ban } => {
                self.record_ban(channel, ban).await?;
                self.record_leave(channel, &ban.username).await?;
            }
            EnvelopeKind::Event { .. } => {}
        }
        Ok(())
    }
}

/// A journal that remembers nothing. The hub starts empty every time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshotStore;

impl ChannelSnapshotStore for NoSnapshotStore {
    async fn load(&self) -> Result<Vec<ChannelSnapshot>, HubError> {
        Ok(Vec::new())
    }

    async fn record(&self, _envelope: &Envelope, _history_limit: usize) -> Result<(), HubError> {
        Ok(())
    }
}

/// In-memory journal, for tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    channels: Mutex<BTreeMap<String, Channel>>,
}

impl MemorySnapshotStore {
    /// An empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// A journal pre-loaded with `snapshots`.
    pub fn with_snapshots(snapshots: Vec<ChannelSnapshot>, history_limit: usize) -> Self {
        let now = Utc::now();
        let mut channels = BTreeMap::new();
        for snapshot in snapshots {
            if let Ok(mut channel) = Channel::new(&snapshot.name) {
                let name = snapshot.name.clone();
                channel.merge(snapshot, history_limit, now);
                channels.insert(name, channel);
            }
        }
        Self {
            channels: Mutex::new(channels),
        }
    }

    /// Current journal contents.
    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        let now = Utc::now();
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|ch| ch.snapshot(now))
            .collect()
    }

    fn apply(&self, envelope: &Envelope, history_limit: usize) -> Result<(), HubError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(envelope.kind, EnvelopeKind::Event { .. }) {
            return Ok(());
        }
        if !channels.contains_key(&envelope.channel) {
            channels.insert(envelope.channel.clone(), Channel::new(&envelope.channel)?);
        }
        let Some(channel) = channels.get_mut(&envelope.channel) else {
            return Ok(());
        };
        match &envelope.kind {
            EnvelopeKind::Chat { message } => {
                channel.push_message(message.clone(), history_limit);
            }
            EnvelopeKind::Joined { username, at } => {
                channel.join(username, *at);
            }
            EnvelopeKind::Left { username, .. } => {
                channel.leave(username);
            }
            EnvelopeKind::Banned { ban } => {
                channel.ban(ban.clone());
            }
            EnvelopeKind::Event { .. } => {}
        }
        Ok(())
    }
}

impl ChannelSnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Vec<ChannelSnapshot>, HubError> {
        Ok(self.snapshots())
    }

    async fn record(&self, envelope: &Envelope, history_limit: usize) -> Result<(), HubError> {
        self.apply(envelope, history_limit)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing)]

    use realm_types::{BanEntry, HubId};

    use super::*;

    #[tokio::test]
    async fn memory_journal_tracks_membership_and_bans() {
        let store = MemorySnapshotStore::new();
        let hub = HubId::new();
        let now = Utc::now();
        for kind in [
            EnvelopeKind::Joined {
                username: String::from("alice"),
                at: now,
            },
            EnvelopeKind::Joined {
                username: String::from("mallory"),
                at: now,
            },
            EnvelopeKind::Banned {
                ban: BanEntry {
                    username: String::from("mallory"),
                    expires_at: None,
                },
            },
        ] {
            store.record(&Envelope::new(hub, "global", kind), 10).await.unwrap();
        }

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].members.keys().collect::<Vec<_>>(), vec!["alice"]);
        assert_eq!(loaded[0].bans.len(), 1);
    }

    #[tokio::test]
    async fn memory_journal_rejects_unknown_channels() {
        let store = MemorySnapshotStore::new();
        let envelope = Envelope::new(
            HubId::new(),
            "tavern",
            EnvelopeKind::Left {
                username: String::from("alice"),
                disconnected: false,
            },
        );
        assert!(matches!(
            store.record(&envelope, 10).await,
            Err(HubError::UnknownChannel(_))
        ));
        assert!(NoSnapshotStore.load().await.unwrap().is_empty());
    }
}
