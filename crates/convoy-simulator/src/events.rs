//! Events emitted by the step loop for the finance and notification side.

use crate::state::ConvoyState;
use convoy_domain::{ConvoyId, PlayerId, StationId, TileCoord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Something the owner or the books should hear about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimEvent {
    StateChanged {
        convoy: ConvoyId,
        from: ConvoyState,
        to: ConvoyState,
    },
    /// Revenue and running cost booked on reaching a stop
    StopBooked {
        convoy: ConvoyId,
        tile: TileCoord,
        station: Option<StationId>,
        delivered: u32,
        revenue: i64,
        operating_cost: i64,
    },
    NewMonth {
        month: u32,
    },
    NewYear {
        year: u32,
    },
    NoRoute {
        convoy: ConvoyId,
        goal: TileCoord,
    },
    LongblockTimedOut {
        convoy: ConvoyId,
        signal: TileCoord,
    },
    Coupled {
        leader: ConvoyId,
        follower: ConvoyId,
    },
    CouplingCompleted {
        leader: ConvoyId,
        follower: ConvoyId,
    },
    CouplingRejected {
        follower: ConvoyId,
        leader: ConvoyId,
        reason: String,
    },
    CouplingAbandoned {
        leader: ConvoyId,
        follower: ConvoyId,
    },
    Uncoupled {
        leader: ConvoyId,
        follower: ConvoyId,
    },
    OwnerChanged {
        convoy: ConvoyId,
        from: PlayerId,
        to: PlayerId,
    },
    Sold {
        convoy: ConvoyId,
        owner: PlayerId,
        value: i64,
    },
    Destroyed {
        convoy: ConvoyId,
    },
    CommandRejected {
        convoy: ConvoyId,
        reason: String,
    },
}

/// Consumer of drained events
pub trait EventSink {
    fn record(&mut self, tick: u64, event: &SimEvent);
}

impl EventSink for Vec<(u64, SimEvent)> {
    fn record(&mut self, tick: u64, event: &SimEvent) {
        self.push((tick, event.clone()));
    }
}

/// Logs every event; failures at `warn`, the rest at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&mut self, tick: u64, event: &SimEvent) {
        match event {
            SimEvent::NoRoute { convoy, goal } => {
                warn!(tick, convoy = %convoy, goal = %goal, "No route");
            }
            SimEvent::CouplingRejected { follower, leader, reason } => {
                warn!(tick, follower = %follower, leader = %leader, %reason, "Coupling rejected");
            }
            SimEvent::LongblockTimedOut { convoy, signal } => {
                warn!(tick, convoy = %convoy, signal = %signal, "Longblock request timed out");
            }
            SimEvent::CommandRejected { convoy, reason } => {
                warn!(tick, convoy = %convoy, %reason, "Command rejected");
            }
            SimEvent::StateChanged { .. } => {}
            other => info!(tick, event = ?other, "Event"),
        }
    }
}
