//! Six-tier listener ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order in which listeners for the same message type run.
///
/// Lower tiers run first so they can make primary decisions (including
/// cancelling) before higher tiers react. `Monitor` runs last and is meant to
/// observe the final outcome only. The dispatcher logs and counts a `Monitor`
/// listener that cancels, and rejects it outright when `strict_monitor` is set.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ListenerPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Monitor,
}

impl ListenerPriority {
    /// Every tier, in dispatch order.
    pub const ALL: [ListenerPriority; 6] = [
        ListenerPriority::Lowest,
        ListenerPriority::Low,
        ListenerPriority::Normal,
        ListenerPriority::High,
        ListenerPriority::Highest,
        ListenerPriority::Monitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ListenerPriority::Lowest => "lowest",
            ListenerPriority::Low => "low",
            ListenerPriority::Normal => "normal",
            ListenerPriority::High => "high",
            ListenerPriority::Highest => "highest",
            ListenerPriority::Monitor => "monitor",
        }
    }

    /// Whether listeners at this tier are expected to leave messages alone.
    pub fn is_observe_only(self) -> bool {
        self == ListenerPriority::Monitor
    }
}

impl fmt::Display for ListenerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListenerPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ListenerPriority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid listener priority: {s}"))
    }
}
