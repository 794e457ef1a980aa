//! Enumeration types for the Realm simulation engine.
//!
//! Every enum here has a stable `snake_case` string form shared by serde,
//! the YAML catalog, and the `PostgreSQL` text columns.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    /// The enum that was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Implements `as_str`, `Display`, `FromStr` and `ALL` for a fieldless enum.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The canonical `snake_case` name of this variant.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Economy
// ---------------------------------------------------------------------------

/// A resource held in a village ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Lumber from wood cutters.
    Wood,
    /// Stone from quarries.
    Stone,
    /// Food from farms.
    Food,
    /// Gold from mines.
    Gold,
}

string_enum!(Resource, "resource", {
    Wood => "wood",
    Stone => "stone",
    Food => "food",
    Gold => "gold",
});

/// A building type that can exist once per village.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingType {
    /// Village centre; gates most other upgrades.
    TownHall,
    /// Produces wood.
    WoodCutter,
    /// Produces stone.
    Quarry,
    /// Produces food.
    Farm,
    /// Produces gold.
    GoldMine,
    /// Trains infantry and archers.
    Barracks,
    /// Trains cavalry.
    Stable,
    /// Researches technologies.
    Academy,
    /// Stores resources.
    Warehouse,
    /// Defensive fortification.
    Wall,
}

string_enum!(BuildingType, "building type", {
    TownHall => "town_hall",
    WoodCutter => "wood_cutter",
    Quarry => "quarry",
    Farm => "farm",
    GoldMine => "gold_mine",
    Barracks => "barracks",
    Stable => "stable",
    Academy => "academy",
    Warehouse => "warehouse",
    Wall => "wall",
});

/// The ruleset flavour of the game world. Feeds a flat production bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldType {
    /// Default ruleset.
    #[default]
    Standard,
    /// Accelerated economy.
    Speed,
    /// No-war world with production emphasis.
    Peaceful,
    /// Harsh world with reduced production.
    Hardcore,
}

string_enum!(WorldType, "world type", {
    Standard => "standard",
    Speed => "speed",
    Peaceful => "peaceful",
    Hardcore => "hardcore",
});

// ---------------------------------------------------------------------------
// Combat
// ---------------------------------------------------------------------------

/// A trainable unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    /// Cheap melee line unit.
    Infantry,
    /// Ranged support unit.
    Archer,
    /// Fast mounted unit.
    Cavalry,
    /// Heavy siege engine.
    Siege,
    /// Reconnaissance unit.
    Scout,
}

string_enum!(UnitType, "unit type", {
    Infantry => "infantry",
    Archer => "archer",
    Cavalry => "cavalry",
    Siege => "siege",
    Scout => "scout",
});

/// Terrain at the defender's village, modifying attack power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terrain {
    /// Open ground, no modifier.
    #[default]
    Plains,
    /// Cover favours the attacker.
    Forest,
    /// High ground favours the attacker.
    Mountain,
    /// Amphibious assault penalty.
    Water,
    /// Heat and attrition penalty.
    Desert,
}

string_enum!(Terrain, "terrain", {
    Plains => "plains",
    Forest => "forest",
    Mountain => "mountain",
    Water => "water",
    Desert => "desert",
});

impl Terrain {
    /// Multiplier applied to attack power.
    pub const fn attack_modifier(self) -> f64 {
        match self {
            Self::Plains => 1.00,
            Self::Forest => 1.10,
            Self::Mountain => 1.15,
            Self::Water => 0.90,
            Self::Desert => 0.85,
        }
    }
}

/// Weather during a battle, modifying attack power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    /// No modifier.
    #[default]
    Clear,
    /// Slippery ground.
    Rain,
    /// Severe disruption.
    Storm,
    /// Reduced visibility.
    Fog,
}

string_enum!(Weather, "weather", {
    Clear => "clear",
    Rain => "rain",
    Storm => "storm",
    Fog => "fog",
});

impl Weather {
    /// Multiplier applied to attack power.
    pub const fn attack_modifier(self) -> f64 {
        match self {
            Self::Clear => 1.00,
            Self::Rain => 0.90,
            Self::Storm => 0.80,
            Self::Fog => 0.95,
        }
    }
}

/// Lifecycle status of a battle.
///
/// ```text
/// pending --> active --> resolved
///    |
///    +------> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    /// Created by an attack request, marching.
    Pending,
    /// Claimed by the resolution engine.
    Active,
    /// Outcome computed and committed. Terminal.
    Resolved,
    /// Withdrawn by the attacker before resolution. Terminal.
    Cancelled,
}

string_enum!(BattleStatus, "battle status", {
    Pending => "pending",
    Active => "active",
    Resolved => "resolved",
    Cancelled => "cancelled",
});

impl BattleStatus {
    /// Whether the status is terminal (immutable once reached).
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active | Self::Resolved | Self::Cancelled)
                | (Self::Active, Self::Resolved)
        )
    }
}

/// Outcome of a resolved battle, from the attacker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleOutcome {
    /// Attack power exceeded 1.5x defense power.
    DecisiveWin,
    /// Attack power exceeded defense power.
    MarginalWin,
    /// Attack power did not exceed defense power.
    Defeat,
}

string_enum!(BattleOutcome, "battle outcome", {
    DecisiveWin => "decisive_win",
    MarginalWin => "marginal_win",
    Defeat => "defeat",
});

impl BattleOutcome {
    /// Whether the attacker won.
    pub const fn is_win(self) -> bool {
        matches!(self, Self::DecisiveWin | Self::MarginalWin)
    }
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// The routing class of a chat channel, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// `global` -- everyone.
    Global,
    /// `alliance:<id>` -- alliance members.
    Alliance,
    /// `world:<id>` -- players of one world.
    World,
    /// `player:<id>` -- private notification channel of one player.
    Player,
}

string_enum!(ChannelType, "channel type", {
    Global => "global",
    Alliance => "alliance",
    World => "world",
    Player => "player",
});

impl ChannelType {
    /// Classify a channel by its name (`"global"`, `"alliance:<id>"`, ...).
    ///
    /// Returns `None` for names that match no convention.
    pub fn of_channel(name: &str) -> Option<Self> {
        if name == "global" {
            return Some(Self::Global);
        }
        let (prefix, rest) = name.split_once(':')?;
        if rest.is_empty() {
            return None;
        }
        match prefix {
            "alliance" => Some(Self::Alliance),
            "world" => Some(Self::World),
            "player" => Some(Self::Player),
            _ => None,
        }
    }
}
