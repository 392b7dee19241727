//! Discrete convoy commands, queued and applied at the start of a tick.

use crate::error::SimError;
use crate::schedule::Schedule;
use convoy_domain::{ConvoyId, LineId, PlayerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvoyCommand {
    /// Leave the depot and follow the schedule
    Start,
    /// Open the schedule for editing; the convoy idles meanwhile
    EditSchedule,
    SetSchedule { schedule: Schedule },
    /// Recompute the route, e.g. after a network change
    RecalculateRoute,
    SendToDepot,
    Withdraw { enabled: bool },
    NoLoad { enabled: bool },
    /// Sell a convoy standing in its depot
    Sell,
    SelfDestruct,
    /// Offer the convoy to another player
    RequestTrade { to: PlayerId },
    AcceptTrade { player: PlayerId },
    /// Couple this convoy behind `leader`
    Couple { leader: ConvoyId },
    Uncouple,
    SetLine { line: Option<LineId> },
}

impl ConvoyCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::EditSchedule => "EDIT_SCHEDULE",
            Self::SetSchedule { .. } => "SET_SCHEDULE",
            Self::RecalculateRoute => "RECALCULATE_ROUTE",
            Self::SendToDepot => "SEND_TO_DEPOT",
            Self::Withdraw { .. } => "WITHDRAW",
            Self::NoLoad { .. } => "NO_LOAD",
            Self::Sell => "SELL",
            Self::SelfDestruct => "SELF_DESTRUCT",
            Self::RequestTrade { .. } => "REQUEST_TRADE",
            Self::AcceptTrade { .. } => "ACCEPT_TRADE",
            Self::Couple { .. } => "COUPLE",
            Self::Uncouple => "UNCOUPLE",
            Self::SetLine { .. } => "SET_LINE",
        }
    }
}

/// Result of applying one queued command
#[derive(Debug)]
pub struct CommandOutcome {
    pub convoy: ConvoyId,
    pub command: &'static str,
    pub result: Result<(), SimError>,
}

impl CommandOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
