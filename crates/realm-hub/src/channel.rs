//! Per-channel state: members, bans and bounded recent history.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use realm_types::{BanEntry, ChannelSnapshot, ChannelType, ChatMessage};

use crate::error::HubError;

/// One chat channel.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    channel_type: ChannelType,
    members: BTreeMap<String, DateTime<Utc>>,
    /// Members restored from a snapshot that no hub has vouched for since.
    unconfirmed: BTreeSet<String>,
    bans: BTreeMap<String, BanEntry>,
    recent: VecDeque<ChatMessage>,
}

impl Channel {
    /// An empty channel. Fails if `name` matches no routing convention.
    pub fn new(name: &str) -> Result<Self, HubError> {
        let channel_type =
            ChannelType::of_channel(name).ok_or_else(|| HubError::UnknownChannel(name.to_owned()))?;
        Ok(Self {
            name: name.to_owned(),
            channel_type,
            members: BTreeMap::new(),
            unconfirmed: BTreeSet::new(),
            bans: BTreeMap::new(),
            recent: VecDeque::new(),
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routing class.
    pub const fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Whether `username` is currently a member.
    pub fn is_member(&self, username: &str) -> bool {
        self.members.contains_key(username)
    }

    /// Member usernames, sorted.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Whether `username` is banned at `now`. Expired bans are forgotten.
    pub fn is_banned(&mut self, username: &str, now: DateTime<Utc>) -> bool {
        match self.bans.get(username) {
            Some(ban) if ban.is_active(now) => true,
            Some(_) => {
                self.bans.remove(username);
                false
            }
            None => false,
        }
    }

    /// Add a member. Returns `false` if already a member.
    ///
    /// Joining again confirms a restored member.
    pub fn join(&mut self, username: &str, at: DateTime<Utc>) -> bool {
        if self.members.contains_key(username) {
            self.unconfirmed.remove(username);
            return false;
        }
        self.members.insert(username.to_owned(), at);
        true
    }

    /// Remove a member. Returns `false` if not a member.
    pub fn leave(&mut self, username: &str) -> bool {
        self.unconfirmed.remove(username);
        self.members.remove(username).is_some()
    }

    /// Mark a restored member as live. Returns `false` if `username` was
    /// not awaiting confirmation.
    pub fn confirm(&mut self, username: &str) -> bool {
        self.unconfirmed.remove(username)
    }

    /// Whether `username` was restored and not yet confirmed.
    pub fn is_unconfirmed(&self, username: &str) -> bool {
        self.unconfirmed.contains(username)
    }

    /// Remove every restored member nobody confirmed and return them, sorted.
    pub fn take_unconfirmed(&mut self) -> Vec<String> {
        let stale = std::mem::take(&mut self.unconfirmed);
        stale
            .into_iter()
            .filter(|username| self.members.remove(username).is_some())
            .collect()
    }

    /// Record a ban and remove the user from the member set.
    ///
    /// Returns whether the user was a member.
    pub fn ban(&mut self, ban: BanEntry) -> bool {
        let was_member = self.leave(&ban.username);
        self.bans.insert(ban.username.clone(), ban);
        was_member
    }

    /// Append to history, keeping the newest `limit` messages.
    ///
    /// Returns `false` (and changes nothing) if a message with the same id
    /// is already held.
    pub fn push_message(&mut self, message: ChatMessage, limit: usize) -> bool {
        if self.recent.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.recent.push_back(message);
        while self.recent.len() > limit {
            self.recent.pop_front();
        }
        true
    }

    /// The newest `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let skip = self.recent.len().saturating_sub(limit);
        self.recent.iter().skip(skip).cloned().collect()
    }

    /// Persistable state. Expired bans are left out.
    pub fn snapshot(&self, now: DateTime<Utc>) -> ChannelSnapshot {
        ChannelSnapshot {
            name: self.name.clone(),
            channel_type: self.channel_type,
            members: self.members.clone(),
            bans: self
                .bans
                .values()
                .filter(|b| b.is_active(now))
                .cloned()
                .collect(),
            recent: self.recent.iter().cloned().collect(),
        }
    }

    /// Fold a persisted snapshot into this channel.
    ///
    /// Members and bans are unioned (the snapshot wins on conflicts); history
    /// is merged by message id, ordered by send time and capped at `limit`.
    ///
    /// Members only the snapshot knows about are held as unconfirmed until a
    /// connect, join or message shows they are still online. See
    /// [`take_unconfirmed`](Self::take_unconfirmed).
    pub fn merge(&mut self, snapshot: ChannelSnapshot, limit: usize, now: DateTime<Utc>) {
        for (username, at) in snapshot.members {
            if !self.members.contains_key(&username) {
                self.unconfirmed.insert(username.clone());
                self.members.insert(username, at);
            }
        }
        for ban in snapshot.bans.into_iter().filter(|b| b.is_active(now)) {
            self.leave(&ban.username);
            self.bans.insert(ban.username.clone(), ban);
        }
        let mut history: Vec<ChatMessage> = self.recent.drain(..).collect();
        for message in snapshot.recent {
            if !history.iter().any(|m| m.id == message.id) {
                history.push(message);
            }
        }
        history.sort_by_key(|m| m.sent_at);
        let skip = history.len().saturating_sub(limit);
        self.recent = history.into_iter().skip(skip).collect();
    }
}
