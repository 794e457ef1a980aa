//! Error types for the messaging hub and synchronization manager.

use std::time::Duration;

use realm_core::ErrorKind;

/// Errors returned by hub operations and the sync manager.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The user is on the channel's active ban list.
    #[error("{username} is banned from {channel}")]
    Banned {
        /// The channel.
        channel: String,
        /// The banned user.
        username: String,
    },

    /// The message body is empty after trimming whitespace.
    #[error("message is empty")]
    EmptyMessage,

    /// The message body exceeds the configured limit.
    #[error("message is {len} characters, limit is {max}")]
    MessageTooLong {
        /// Length of the rejected body in characters.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// The channel name matches no routing convention.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The principal may not join this channel (another player's private channel).
    #[error("channel {0} is private")]
    Forbidden(String),

    /// The principal must join the channel before sending to it.
    #[error("{username} is not a member of {channel}")]
    NotMember {
        /// The channel.
        channel: String,
        /// The sender.
        username: String,
    },

    /// A broker operation failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// A channel journal operation failed.
    #[error("journal error: {0}")]
    Journal(String),

    /// The broker could not be reached within the start timeout.
    #[error("broker unreachable within {0:?}")]
    SyncStartTimeout(Duration),

    /// An envelope could not be encoded or decoded.
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl HubError {
    /// Classify the error the same way core operations are classified.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Banned { .. }
            | Self::EmptyMessage
            | Self::MessageTooLong { .. }
            | Self::UnknownChannel(_)
            | Self::Forbidden(_)
            | Self::NotMember { .. } => ErrorKind::Validation,
            Self::Broker(_) | Self::Journal(_) | Self::SyncStartTimeout(_) => {
                ErrorKind::Transient
            }
            Self::Codec(_) => ErrorKind::Invariant,
        }
    }
}

impl From<realm_db::DbError> for HubError {
    fn from(err: realm_db::DbError) -> Self {
        Self::Journal(err.to_string())
    }
}
