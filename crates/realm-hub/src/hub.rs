//! The Presence & Messaging Hub.
//!
//! The hub owns channel state (members, bans, recent history) and the set
//! of locally connected clients. Every operation is synchronous and holds
//! the state lock only for in-memory work: local delivery uses
//! non-blocking `try_send` into each connection's bounded queue, and every
//! change is pushed onto an outbound broadcast queue as an [`Envelope`]
//! before the lock is released, so envelopes leave in the order the
//! changes were applied.
//! When a [`SyncManager`](crate::sync::SyncManager) is running it drains
//! that queue to the broker and the channel journal; when none is running
//! the hub works local-only.
//!
//! Envelopes from other hubs come back in through
//! [`MessagingHub::apply_remote`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use realm_core::config::ChatConfig;
use realm_core::events::EventSink;
use realm_types::{
    BanEntry, ChannelSnapshot, ChannelType, ChatMessage, DomainEvent, HubId, MessageId, Principal,
    player_channel,
};
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::envelope::{Envelope, EnvelopeKind, RecentIds};
use crate::error::HubError;

/// Capacity of the outbound envelope queue.
const OUTBOUND_CAPACITY: usize = 1024;

/// Remote envelope ids remembered for duplicate suppression.
const APPLIED_ID_CAPACITY: usize = 4096;

/// Identifier of one local client connection.
pub type ConnectionId = u64;

/// Something pushed to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    /// A chat message in a channel the client's user belongs to.
    Message {
        /// The message.
        message: ChatMessage,
    },
    /// A user joined or left a channel the client's user belongs to.
    Presence {
        /// The channel.
        channel: String,
        /// The user.
        username: String,
        /// `true` on join, `false` on leave or ban.
        online: bool,
    },
    /// A domain event concerning the client's player.
    Event {
        /// The event.
        event: DomainEvent,
    },
}

/// A registered client connection. Dropping the receiver does not
/// unregister it; call [`MessagingHub::disconnect`].
#[derive(Debug)]
pub struct Connection {
    /// Connection id, passed back to [`MessagingHub::disconnect`].
    pub id: ConnectionId,
    /// Who is connected.
    pub principal: Principal,
    /// Deliveries for this client, in order.
    pub deliveries: mpsc::Receiver<Delivery>,
}

#[derive(Debug)]
struct LocalConnection {
    principal: Principal,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Debug)]
struct HubState {
    channels: BTreeMap<String, Channel>,
    connections: BTreeMap<ConnectionId, LocalConnection>,
    applied: RecentIds,
}

/// Channel membership, bans, history and local fan-out for one process.
pub struct MessagingHub {
    id: HubId,
    config: ChatConfig,
    state: Mutex<HubState>,
    outbound: broadcast::Sender<Envelope>,
    connections_changed: Notify,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for MessagingHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingHub")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Push `delivery` to every local connection whose user is a member of `channel`.
fn deliver(
    connections: &BTreeMap<ConnectionId, LocalConnection>,
    channel: &Channel,
    delivery: &Delivery,
) {
    for (id, conn) in connections {
        if !channel.is_member(&conn.principal.username) {
            continue;
        }
        match conn.sender.try_send(delivery.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection = id,
                    channel = channel.name(),
                    "Delivery queue full, dropping"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = id, "Delivery to closed connection skipped");
            }
        }
    }
}

/// Get a channel, creating it if the name is valid.
fn channel_entry<'a>(
    channels: &'a mut BTreeMap<String, Channel>,
    name: &str,
) -> Result<&'a mut Channel, HubError> {
    if !channels.contains_key(name) {
        channels.insert(name.to_owned(), Channel::new(name)?);
    }
    channels
        .get_mut(name)
        .ok_or_else(|| HubError::UnknownChannel(name.to_owned()))
}

fn presence(channel: &Channel, username: &str, online: bool) -> Option<Delivery> {
    (channel.channel_type() != ChannelType::Player).then(|| Delivery::Presence {
        channel: channel.name().to_owned(),
        username: username.to_owned(),
        online,
    })
}

impl MessagingHub {
    /// Create a hub with a fresh [`HubId`].
    pub fn new(config: ChatConfig) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self {
            id: HubId::new(),
            config,
            state: Mutex::new(HubState {
                channels: BTreeMap::new(),
                connections: BTreeMap::new(),
                applied: RecentIds::new(APPLIED_ID_CAPACITY),
            }),
            outbound,
            connections_changed: Notify::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    /// This hub's id, stamped on every envelope it originates.
    pub const fn id(&self) -> HubId {
        self.id
    }

    /// Chat limits this hub enforces.
    pub const fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Subscribe to the envelopes of every local change made from now on.
    pub fn outbound(&self) -> broadcast::Receiver<Envelope> {
        self.outbound.subscribe()
    }

    /// Resolves after a client connects or disconnects.
    ///
    /// A change made while nobody waits is remembered for the next call.
    pub async fn local_connections_changed(&self) {
        self.connections_changed.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, channel: &str, kind: EnvelopeKind) {
        let envelope = Envelope::new(self.id, channel, kind);
        if self.outbound.send(envelope).is_err() {
            debug!(channel, "No sync manager running, change stays local");
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Register a client connection and join its user to their private
    /// `player:<id>` channel.
    ///
    /// Memberships restored for this user are confirmed and re-announced
    /// as joins, so other hubs keep them too.
    pub fn connect(&self, principal: Principal, now: DateTime<Utc>) -> Connection {
        let (sender, deliveries) = mpsc::channel(self.config.connection_buffer.max(1));
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.lock();
            state.connections.insert(
                id,
                LocalConnection {
                    principal: principal.clone(),
                    sender,
                },
            );
            let username = principal.username.as_str();
            for ch in state.channels.values_mut() {
                if ch.confirm(username) {
                    self.publish(
                        ch.name(),
                        EnvelopeKind::Joined {
                            username: username.to_owned(),
                            at: now,
                        },
                    );
                }
            }
        }
        self.connections_changed.notify_one();

        let private = player_channel(principal.player_id);
        if let Err(e) = self.join_channel(&principal, &private, now) {
            warn!(username = %principal.username, error = %e, "Could not join private channel");
        }
        info!(connection = id, username = %principal.username, "Client connected");

        Connection {
            id,
            principal,
            deliveries,
        }
    }

    /// Unregister a connection. When it was the user's last local
    /// connection, the user leaves every channel.
    ///
    /// Returns `false` for an unknown connection id.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        {
            let mut state = self.lock();
            let Some(conn) = state.connections.remove(&id) else {
                return false;
            };
            let username = conn.principal.username;
            let still_connected = state
                .connections
                .values()
                .any(|c| c.principal.username == username);
            let mut channels_left = 0_usize;
            if !still_connected {
                let HubState {
                    channels,
                    connections,
                    ..
                } = &mut *state;
                for channel in channels.values_mut() {
                    if channel.leave(&username) {
                        if let Some(d) = presence(channel, &username, false) {
                            deliver(connections, channel, &d);
                        }
                        self.publish(
                            channel.name(),
                            EnvelopeKind::Left {
                                username: username.clone(),
                                disconnected: true,
                            },
                        );
                        channels_left = channels_left.saturating_add(1);
                    }
                }
            }
            info!(connection = id, username = %username, channels_left, "Client disconnected");
        }
        self.connections_changed.notify_one();
        true
    }

    /// Channels where at least one member is connected to this hub.
    pub fn local_channels(&self) -> BTreeSet<String> {
        let state = self.lock();
        state
            .channels
            .values()
            .filter(|ch| {
                state
                    .connections
                    .values()
                    .any(|c| ch.is_member(&c.principal.username))
            })
            .map(|ch| ch.name().to_owned())
            .collect()
    }

    // =========================================================================
    // Channel operations
    // =========================================================================

    /// Add the principal to a channel.
    ///
    /// Idempotent: returns `Ok(false)` if already a member.
    ///
    /// # Errors
    ///
    /// - [`HubError::UnknownChannel`] for a name with no known prefix.
    /// - [`HubError::Forbidden`] for another player's `player:<id>` channel.
    /// - [`HubError::Banned`] if the principal is banned from the channel.
    pub fn join_channel(
        &self,
        principal: &Principal,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        if ChannelType::of_channel(channel) == Some(ChannelType::Player)
            && channel != player_channel(principal.player_id)
        {
            return Err(HubError::Forbidden(channel.to_owned()));
        }

        let username = principal.username.as_str();
        {
            let mut state = self.lock();
            let HubState {
                channels,
                connections,
                ..
            } = &mut *state;
            let ch = channel_entry(channels, channel)?;
            if ch.is_banned(username, now) {
                return Err(HubError::Banned {
                    channel: channel.to_owned(),
                    username: username.to_owned(),
                });
            }
            if !ch.join(username, now) {
                return Ok(false);
            }
            if let Some(d) = presence(ch, username, true) {
                deliver(connections, ch, &d);
            }
            self.publish(
                channel,
                EnvelopeKind::Joined {
                    username: username.to_owned(),
                    at: now,
                },
            );
        }

        debug!(channel, username, "Joined channel");
        Ok(true)
    }

    /// Remove the principal from a channel. Returns `false` if not a member.
    pub fn leave_channel(&self, principal: &Principal, channel: &str) -> bool {
        let username = principal.username.as_str();
        {
            let mut state = self.lock();
            let HubState {
                channels,
                connections,
                ..
            } = &mut *state;
            let Some(ch) = channels.get_mut(channel) else {
                return false;
            };
            if !ch.leave(username) {
                return false;
            }
            if let Some(d) = presence(ch, username, false) {
                deliver(connections, ch, &d);
            }
            self.publish(
                channel,
                EnvelopeKind::Left {
                    username: username.to_owned(),
                    disconnected: false,
                },
            );
        }

        debug!(channel, username, "Left channel");
        true
    }

    /// Post a message to a channel the principal belongs to.
    ///
    /// The body is trimmed before validation and storage.
    ///
    /// # Errors
    ///
    /// - [`HubError::EmptyMessage`] / [`HubError::MessageTooLong`] for a bad body.
    /// - [`HubError::UnknownChannel`] for a name with no known prefix.
    /// - [`HubError::Banned`] if the sender is banned from the channel.
    /// - [`HubError::NotMember`] if the sender has not joined the channel.
    pub fn send_message(
        &self,
        principal: &Principal,
        channel: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, HubError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(HubError::EmptyMessage);
        }
        let len = body.chars().count();
        if len > self.config.max_message_len {
            return Err(HubError::MessageTooLong {
                len,
                max: self.config.max_message_len,
            });
        }

        let username = principal.username.as_str();
        let message = ChatMessage {
            id: MessageId::new(),
            channel: channel.to_owned(),
            sender: username.to_owned(),
            text: body.to_owned(),
            sent_at: now,
        };
        {
            let mut state = self.lock();
            let HubState {
                channels,
                connections,
                ..
            } = &mut *state;
            let ch = channel_entry(channels, channel)?;
            if ch.is_banned(username, now) {
                return Err(HubError::Banned {
                    channel: channel.to_owned(),
                    username: username.to_owned(),
                });
            }
            if !ch.is_member(username) {
                return Err(HubError::NotMember {
                    channel: channel.to_owned(),
                    username: username.to_owned(),
                });
            }
            ch.push_message(message.clone(), self.config.history_limit);
            deliver(
                connections,
                ch,
                &Delivery::Message {
                    message: message.clone(),
                },
            );
            self.publish(
                channel,
                EnvelopeKind::Chat {
                    message: message.clone(),
                },
            );
        }

        Ok(message)
    }

    /// Ban a user from a channel and remove them from it.
    ///
    /// `duration` of `None` bans permanently. A later ban replaces an
    /// earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownChannel`] for a name with no known prefix.
    pub fn ban_user(
        &self,
        username: &str,
        channel: &str,
        duration: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Result<BanEntry, HubError> {
        let ban = BanEntry {
            username: username.to_owned(),
            expires_at: duration
                .map(|d| now.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)),
        };
        {
            let mut state = self.lock();
            let HubState {
                channels,
                connections,
                ..
            } = &mut *state;
            let ch = channel_entry(channels, channel)?;
            // Members see the departure before the user is removed.
            let notice = ch
                .is_member(username)
                .then(|| presence(ch, username, false))
                .flatten();
            if let Some(d) = notice {
                deliver(connections, ch, &d);
            }
            ch.ban(ban.clone());
            self.publish(channel, EnvelopeKind::Banned { ban: ban.clone() });
        }

        info!(channel, username, expires_at = ?ban.expires_at, "User banned");
        Ok(ban)
    }

    /// Members of a channel, sorted. Empty for an unknown channel.
    pub fn get_online_users(&self, channel: &str) -> Vec<String> {
        self.lock()
            .channels
            .get(channel)
            .map(|ch| ch.members().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// The newest `limit` messages of a channel, oldest first.
    ///
    /// `limit` is capped at the configured history size.
    pub fn get_recent_messages(&self, channel: &str, limit: usize) -> Vec<ChatMessage> {
        let limit = limit.min(self.config.history_limit);
        self.lock()
            .channels
            .get(channel)
            .map(|ch| ch.recent(limit))
            .unwrap_or_default()
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Apply an envelope received from the broker.
    ///
    /// Envelopes this hub originated and envelopes already applied are
    /// ignored. Returns whether the envelope changed anything.
    pub fn apply_remote(&self, envelope: Envelope) -> bool {
        if envelope.origin == self.id {
            return false;
        }
        let limit = self.config.history_limit;
        let mut state = self.lock();
        if !state.applied.insert(envelope.id) {
            debug!(envelope = %envelope.id, "Duplicate envelope dropped");
            return false;
        }
        let HubState {
            channels,
            connections,
            ..
        } = &mut *state;
        let Envelope { channel, kind, .. } = envelope;

        let kind = match kind {
            // Events only matter where the player is connected.
            EnvelopeKind::Event { event } => {
                return channels.get(&channel).is_some_and(|ch| {
                    deliver(connections, ch, &Delivery::Event { event });
                    true
                });
            }
            other => other,
        };

        let ch = match channel_entry(channels, &channel) {
            Ok(ch) => ch,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Remote envelope for unusable channel");
                return false;
            }
        };
        match kind {
            EnvelopeKind::Chat { message } => {
                ch.confirm(&message.sender);
                if !ch.push_message(message.clone(), limit) {
                    return false;
                }
                deliver(connections, ch, &Delivery::Message { message });
            }
            EnvelopeKind::Joined { username, at } => {
                if !ch.join(&username, at) {
                    return false;
                }
                if let Some(d) = presence(ch, &username, true) {
                    deliver(connections, ch, &d);
                }
            }
            EnvelopeKind::Left {
                username,
                disconnected,
            } => {
                // Another hub losing its last connection says nothing about
                // the connections held here.
                if disconnected
                    && connections
                        .values()
                        .any(|c| c.principal.username == username)
                {
                    debug!(channel = %channel, username = %username, "Remote disconnect ignored, user connected locally");
                    return false;
                }
                if !ch.is_member(&username) {
                    return false;
                }
                if let Some(d) = presence(ch, &username, false) {
                    deliver(connections, ch, &d);
                }
                ch.leave(&username);
            }
            EnvelopeKind::Banned { ban } => {
                let notice = ch
                    .is_member(&ban.username)
                    .then(|| presence(ch, &ban.username, false))
                    .flatten();
                if let Some(d) = notice {
                    deliver(connections, ch, &d);
                }
                ch.ban(ban);
            }
            EnvelopeKind::Event { .. } => return false,
        }
        true
    }

    /// Persistable state of every channel.
    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<ChannelSnapshot> {
        self.lock()
            .channels
            .values()
            .map(|ch| ch.snapshot(now))
            .collect()
    }

    /// Fold persisted channel state into the hub (rehydration on start).
    ///
    /// Snapshots with unusable names are skipped. Returns how many
    /// channels were restored.
    ///
    /// Restored members without a connection here stay unconfirmed until
    /// they connect, join again or are heard from through another hub.
    /// [`prune_unconfirmed`](Self::prune_unconfirmed) drops the rest.
    pub fn restore(&self, snapshots: Vec<ChannelSnapshot>, now: DateTime<Utc>) -> usize {
        let limit = self.config.history_limit;
        let mut state = self.lock();
        let HubState {
            channels,
            connections,
            ..
        } = &mut *state;
        let mut restored = 0_usize;
        for snapshot in snapshots {
            match channel_entry(channels, &snapshot.name) {
                Ok(ch) => {
                    ch.merge(snapshot, limit, now);
                    for conn in connections.values() {
                        ch.confirm(&conn.principal.username);
                    }
                    restored = restored.saturating_add(1);
                }
                Err(e) => warn!(channel = %snapshot.name, error = %e, "Skipping snapshot"),
            }
        }
        restored
    }

    /// Remove restored members that were never confirmed.
    ///
    /// Each removal is delivered and replicated like a disconnect. Returns
    /// how many memberships were dropped.
    pub fn prune_unconfirmed(&self) -> usize {
        let mut state = self.lock();
        let HubState {
            channels,
            connections,
            ..
        } = &mut *state;
        let mut pruned = 0_usize;
        for ch in channels.values_mut() {
            for username in ch.take_unconfirmed() {
                if let Some(d) = presence(ch, &username, false) {
                    deliver(connections, ch, &d);
                }
                self.publish(
                    ch.name(),
                    EnvelopeKind::Left {
                        username,
                        disconnected: true,
                    },
                );
                pruned = pruned.saturating_add(1);
            }
        }
        if pruned > 0 {
            info!(pruned, "Dropped restored members that never came back");
        }
        pruned
    }
}

impl EventSink for MessagingHub {
    fn emit(&self, event: DomainEvent) {
        for player in event.recipients() {
            let channel = player_channel(player);
            let state = self.lock();
            if let Some(ch) = state.channels.get(&channel) {
                deliver(
                    &state.connections,
                    ch,
                    &Delivery::Event {
                        event: event.clone(),
                    },
                );
            }
            self.publish(
                &channel,
                EnvelopeKind::Event {
                    event: event.clone(),
                },
            );
        }
        debug!(kind = event.kind(), "Domain event fanned out");
    }
}
