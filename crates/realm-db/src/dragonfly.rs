//! `Dragonfly` (Redis-compatible) channel journal.
//!
//! The messaging hub keeps channel membership, bans and recent history in
//! memory. While the sync manager is running it journals every change
//! here, and on start it rehydrates from here, so a restarted process
//! comes back with the channels it had.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `chat:channels` | Set | Names of every journaled channel |
//! | `chat:channel:{name}:members` | Hash | username -> RFC 3339 join time |
//! | `chat:channel:{name}:bans` | Hash | username -> JSON [`BanEntry`] |
//! | `chat:channel:{name}:history` | List | JSON [`ChatMessage`], oldest first, capped |

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use fred::prelude::*;
use realm_types::{BanEntry, ChannelSnapshot, ChannelType, ChatMessage};

use crate::error::DbError;

/// Set holding every journaled channel name.
const CHANNELS_KEY: &str = "chat:channels";

fn members_key(channel: &str) -> String {
    format!("chat:channel:{channel}:members")
}

fn bans_key(channel: &str) -> String {
    format!("chat:channel:{channel}:bans")
}

fn history_key(channel: &str) -> String {
    format!("chat:channel:{channel}:history")
}

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    // =========================================================================
    // Incremental journal
    // =========================================================================

    /// Record that `username` joined `channel` at `joined_at`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if a write fails.
    pub async fn record_join(
        &self,
        channel: &str,
        username: &str,
        joined_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let _: u32 = self.client.sadd(CHANNELS_KEY, channel).await?;
        let _: u32 = self
            .client
            .hset(
                members_key(channel),
                (username, joined_at.to_rfc3339().as_str()),
            )
            .await?;
        Ok(())
    }

    /// Record that `username` left `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn record_leave(&self, channel: &str, username: &str) -> Result<(), DbError> {
        let _: u32 = self.client.hdel(members_key(channel), username).await?;
        Ok(())
    }

    /// Record a ban (overwriting any earlier ban of the same user).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the ban cannot be encoded.
    /// Returns [`DbError::Dragonfly`] if a write fails.
    pub async fn record_ban(&self, channel: &str, ban: &BanEntry) -> Result<(), DbError> {
        let json = serde_json::to_string(ban)?;
        let _: u32 = self.client.sadd(CHANNELS_KEY, channel).await?;
        let _: u32 = self
            .client
            .hset(bans_key(channel), (ban.username.as_str(), json.as_str()))
            .await?;
        Ok(())
    }

    /// Append a message to the channel history, keeping the newest `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the message cannot be encoded.
    /// Returns [`DbError::Dragonfly`] if a write fails.
    pub async fn record_message(
        &self,
        message: &ChatMessage,
        limit: usize,
    ) -> Result<(), DbError> {
        let json = serde_json::to_string(message)?;
        let key = history_key(&message.channel);
        let keep = i64::try_from(limit).unwrap_or(i64::MAX);
        let _: u32 = self.client.sadd(CHANNELS_KEY, message.channel.as_str()).await?;
        let _: u64 = self.client.rpush(&key, json.as_str()).await?;
        let _: () = self.client.ltrim(&key, 0_i64.saturating_sub(keep), -1).await?;
        Ok(())
    }

    // =========================================================================
    // Whole-channel snapshots
    // =========================================================================

    /// Replace everything journaled for one channel with `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if encoding or any write fails.
    pub async fn save_channel(&self, snapshot: &ChannelSnapshot) -> Result<(), DbError> {
        let name = snapshot.name.as_str();
        self.delete_channel(name).await?;
        let _: u32 = self.client.sadd(CHANNELS_KEY, name).await?;

        for (username, joined_at) in &snapshot.members {
            let _: u32 = self
                .client
                .hset(
                    members_key(name),
                    (username.as_str(), joined_at.to_rfc3339().as_str()),
                )
                .await?;
        }
        for ban in &snapshot.bans {
            let json = serde_json::to_string(ban)?;
            let _: u32 = self
                .client
                .hset(bans_key(name), (ban.username.as_str(), json.as_str()))
                .await?;
        }
        let key = history_key(name);
        for message in &snapshot.recent {
            let json = serde_json::to_string(message)?;
            let _: u64 = self.client.rpush(&key, json.as_str()).await?;
        }
        Ok(())
    }

    /// Load every journaled channel.
    ///
    /// Channels whose name matches no routing convention are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a read fails or a stored value is corrupt.
    pub async fn load_channels(&self) -> Result<Vec<ChannelSnapshot>, DbError> {
        let mut names: Vec<String> = self.client.smembers(CHANNELS_KEY).await?;
        names.sort();

        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            let Some(channel_type) = ChannelType::of_channel(&name) else {
                tracing::warn!(channel = %name, "Skipping journaled channel with unknown prefix");
                continue;
            };

            let raw_members: HashMap<String, String> =
                self.client.hgetall(members_key(&name)).await?;
            let mut members = BTreeMap::new();
            for (username, joined_at) in raw_members {
                let at = DateTime::parse_from_rfc3339(&joined_at)
                    .map_err(|e| DbError::Corrupt(format!("join time of {username}: {e}")))?
                    .with_timezone(&Utc);
                members.insert(username, at);
            }

            let raw_bans: HashMap<String, String> = self.client.hgetall(bans_key(&name)).await?;
            let mut bans = raw_bans
                .values()
                .map(|json| serde_json::from_str::<BanEntry>(json))
                .collect::<Result<Vec<_>, _>>()?;
            bans.sort_by(|a, b| a.username.cmp(&b.username));

            let raw_history: Vec<String> = self.client.lrange(history_key(&name), 0, -1).await?;
            let recent = raw_history
                .iter()
                .map(|json| serde_json::from_str::<ChatMessage>(json))
                .collect::<Result<Vec<_>, _>>()?;

            snapshots.push(ChannelSnapshot {
                name,
                channel_type,
                members,
                bans,
                recent,
            });
        }

        tracing::debug!(channels = snapshots.len(), "Loaded channel journal");
        Ok(snapshots)
    }

    /// Remove everything journaled for one channel.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if a delete fails.
    pub async fn delete_channel(&self, channel: &str) -> Result<(), DbError> {
        let _: u32 = self
            .client
            .del(vec![members_key(channel), bans_key(channel), history_key(channel)])
            .await?;
        let _: u32 = self.client.srem(CHANNELS_KEY, channel).await?;
        Ok(())
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the `QUIT` command fails.
    pub async fn close(&self) -> Result<(), DbError> {
        self.client.quit().await?;
        tracing::info!("Dragonfly connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_patterns() {
        assert_eq!(members_key("global"), "chat:channel:global:members");
        assert_eq!(bans_key("alliance:7"), "chat:channel:alliance:7:bans");
        assert_eq!(history_key("world:1"), "chat:channel:world:1:history");
    }
}
