//! # Simulation Snapshots
//!
//! Everything needed to resume a simulation on the same world: the convoy
//! arena (generations included, so old handles stay stale), the coupling
//! table, pending longblock and priority requests, lane change requests,
//! station cargo and lines.
//!
//! The global reservation table and lane cells are not stored. They are
//! rebuilt from the per-convoy claims on restore, which makes the claimed
//! tile set round-trip exactly.

use crate::arena::Arena;
use crate::command::ConvoyCommand;
use crate::config::SimConfig;
use crate::convoy::Convoy;
use crate::coupling::CouplingTable;
use crate::crossings::CrossingTable;
use crate::error::{Result, SimError};
use crate::lanes::LaneCoordinator;
use crate::lines::LineRegistry;
use crate::longblock::LongblockJudge;
use crate::occupancy::TileOccupancy;
use crate::priority::PriorityArbiter;
use crate::reservation::ReservationTable;
use crate::simulation::Simulation;
use crate::stations::StationBoard;
use crate::world::World;
use convoy_domain::ConvoyId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub version: u32,
    pub tick: u64,
    pub month: u32,
    pub convoys: Arena<Convoy>,
    pub couplings: CouplingTable,
    pub longblock: LongblockJudge,
    pub priority: PriorityArbiter,
    pub lanes: LaneCoordinator,
    pub stations: StationBoard,
    pub lines: LineRegistry,
    pub commands: Vec<(ConvoyId, ConvoyCommand)>,
}

impl SimulationSnapshot {
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let snapshot: Self = serde_json::from_value(value)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SimError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

impl Simulation {
    /// Capture the simulation between two ticks.
    #[must_use]
    pub fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot {
            version: SNAPSHOT_VERSION,
            tick: self.tick,
            month: self.month,
            convoys: self.convoys.clone(),
            couplings: self.couplings.clone(),
            longblock: self.longblock.clone(),
            priority: self.priority.clone(),
            lanes: self.lanes.clone(),
            stations: self.stations.clone(),
            lines: self.lines.clone(),
            commands: self.commands.iter().cloned().collect(),
        }
    }

    /// Resume from a snapshot taken on `world`.
    ///
    /// Fails when two convoys claim the same tile, which a snapshot taken by
    /// [`Simulation::snapshot`] never contains.
    pub fn restore(config: SimConfig, snapshot: SimulationSnapshot, world: &dyn World) -> Result<Self> {
        let mut lanes = snapshot.lanes;
        if lanes.drive_left() != config.drive_left {
            lanes = LaneCoordinator::new(config.drive_left);
        }
        let mut sim = Self {
            config,
            tick: snapshot.tick,
            month: snapshot.month,
            convoys: snapshot.convoys,
            reservations: ReservationTable::new(),
            lanes,
            occupancy: TileOccupancy::new(),
            priority: snapshot.priority,
            longblock: snapshot.longblock,
            couplings: snapshot.couplings,
            crossings: CrossingTable::new(),
            stations: snapshot.stations,
            lines: snapshot.lines,
            commands: VecDeque::from(snapshot.commands),
            events: Vec::new(),
        };
        sim.rebuild_indexes(world)?;
        info!(tick = sim.tick, convoys = sim.convoys.len(), "Simulation restored");
        Ok(sim)
    }
}
