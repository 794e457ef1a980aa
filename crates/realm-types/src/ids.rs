//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every entity in the game has a strongly-typed ID to prevent accidental
//! mixing of identifiers at compile time. All IDs use UUID v7 (time-ordered)
//! for efficient database indexing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl core::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a player account.
    PlayerId
}

define_id! {
    /// Unique identifier for a village (a player-owned settlement).
    VillageId
}

define_id! {
    /// Unique identifier for a battle between two villages.
    BattleId
}

define_id! {
    /// Unique identifier for an alliance of players.
    AllianceId
}

define_id! {
    /// Unique identifier for a hero leading an army.
    HeroId
}

define_id! {
    /// Unique identifier for an active world event (e.g. harvest festival).
    WorldEventId
}

define_id! {
    /// Unique identifier for a chat message or replicated hub envelope.
    MessageId
}

define_id! {
    /// Unique identifier for a messaging hub instance (one per process).
    HubId
}
