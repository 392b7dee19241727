//! Convoy lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest backoff tier (the "two months" wait).
pub const MAX_WAIT_TIER: u8 = 2;

/// Closed set of convoy states.
///
/// The escalating waits of a blocked convoy are one variant carrying a tier;
/// tier 0 retries after the base backoff, tiers 1 and 2 stretch the delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvoyState {
    /// Standing in a depot
    #[default]
    Initial,
    EditSchedule,
    Routing,
    NoRoute,
    Driving,
    Loading,
    /// Blocked; retried until clear, escalating every `ticks_per_month`
    Waiting { tier: u8, remaining_ticks: u32 },
    /// Cleared after a wait; resumes driving on the next step
    CanStart { tier: u8 },
    LeavingDepot,
    EnteringDepot,
    Coupled,
    CoupledLoading,
    WaitingForLeavingDepot,
    SelfDestruct,
}

impl ConvoyState {
    /// States in which the convoy moves along its route.
    #[must_use]
    pub const fn is_driving_family(&self) -> bool {
        matches!(
            self,
            Self::Driving
                | Self::Waiting { .. }
                | Self::CanStart { .. }
                | Self::LeavingDepot
                | Self::EnteringDepot
                | Self::Coupled
        )
    }

    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. } | Self::WaitingForLeavingDepot)
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading | Self::CoupledLoading)
    }

    #[must_use]
    pub const fn is_coupled(&self) -> bool {
        matches!(self, Self::Coupled | Self::CoupledLoading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::EditSchedule => "EDIT_SCHEDULE",
            Self::Routing => "ROUTING",
            Self::NoRoute => "NO_ROUTE",
            Self::Driving => "DRIVING",
            Self::Loading => "LOADING",
            Self::Waiting { tier: 0, .. } => "WAITING_FOR_CLEARANCE",
            Self::Waiting { tier: 1, .. } => "WAITING_FOR_CLEARANCE_ONE_MONTH",
            Self::Waiting { .. } => "WAITING_FOR_CLEARANCE_TWO_MONTHS",
            Self::CanStart { tier: 0 } => "CAN_START",
            Self::CanStart { tier: 1 } => "CAN_START_ONE_MONTH",
            Self::CanStart { .. } => "CAN_START_TWO_MONTHS",
            Self::LeavingDepot => "LEAVING_DEPOT",
            Self::EnteringDepot => "ENTERING_DEPOT",
            Self::Coupled => "COUPLED",
            Self::CoupledLoading => "COUPLED_LOADING",
            Self::WaitingForLeavingDepot => "WAITING_FOR_LEAVING_DEPOT",
            Self::SelfDestruct => "SELF_DESTRUCT",
        }
    }
}

impl fmt::Display for ConvoyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
