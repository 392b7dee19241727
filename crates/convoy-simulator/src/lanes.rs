//! # Lane Coordinator
//!
//! Occupancy of road lanes per tile, crossing-conflict detection and the
//! request/acknowledge exchange used when a convoy wants the lane another
//! convoy is standing in.
//!
//! Every cell `(tile, lane)` holds at most one convoy. `no_cars_blocking`
//! is the single gate for entering a cell, whether by moving forward or by
//! switching lanes in place.

use convoy_domain::{ConvoyId, Lane, Ribi, TileCoord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const ROAD_LANES: [Lane; 2] = [Lane::RoadBack, Lane::RoadFront];

/// A vehicle standing in one lane of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneCell {
    pub convoy: ConvoyId,
    /// Direction the vehicle entered the tile with
    pub direction: Ribi,
    /// Direction it will leave the tile with
    pub next_direction: Ribi,
    pub overtaking: bool,
}

/// Request by `requester` for the cell `(tile, target)` held by `occupant`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneChangeRequest {
    pub requester: ConvoyId,
    pub occupant: ConvoyId,
    pub tile: TileCoord,
    pub target: Lane,
    pub filed_tick: u64,
    pub acknowledged: bool,
}

/// Result of one evaluation of the pending requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneEvaluation {
    pub completed: Vec<LaneChangeRequest>,
    pub expired: Vec<LaneChangeRequest>,
}

/// Whether two vehicles on the same tile would cross paths.
///
/// `current`/`next` are our directions entering and leaving the tile,
/// `other_next` is where the other vehicle is heading. `forced_to_change_lane`
/// means we sweep into the neighbouring lane.
#[must_use]
pub fn judge_lane_crossing(
    current: Ribi,
    next: Ribi,
    other_next: Ribi,
    is_overtaking: bool,
    forced_to_change_lane: bool,
    drive_left: bool,
) -> bool {
    if other_next.is_none() || current.is_none() {
        return false;
    }
    let oncoming = other_next == current.reverse();
    if forced_to_change_lane {
        return other_next == current;
    }
    if is_overtaking {
        return oncoming;
    }
    let crosses_traffic = if drive_left {
        next == current.rotate_cw()
    } else {
        next == current.rotate_ccw()
    };
    if crosses_traffic {
        return oncoming || other_next == next.reverse();
    }
    if next == current {
        return other_next.is_perpendicular(current);
    }
    false
}

/// Global lane occupancy plus pending lane change requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneCoordinator {
    #[serde(skip)]
    cells: BTreeMap<(TileCoord, Lane), LaneCell>,
    #[serde(skip)]
    by_convoy: BTreeMap<ConvoyId, Vec<(TileCoord, Lane)>>,
    requests: BTreeMap<ConvoyId, LaneChangeRequest>,
    drive_left: bool,
}

impl LaneCoordinator {
    #[must_use]
    pub fn new(drive_left: bool) -> Self {
        Self {
            drive_left,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn drive_left(&self) -> bool {
        self.drive_left
    }

    #[must_use]
    pub fn occupant(&self, tile: TileCoord, lane: Lane) -> Option<&LaneCell> {
        self.cells.get(&(tile, lane))
    }

    /// Cells currently held by `convoy`.
    #[must_use]
    pub fn cells_of(&self, convoy: ConvoyId) -> &[(TileCoord, Lane)] {
        self.by_convoy.get(&convoy).map_or(&[], Vec::as_slice)
    }

    /// First convoy that forbids `me` from standing in `(tile, lane)`.
    ///
    /// Either the cell itself is taken, or a vehicle in the other lane of
    /// the same tile is on a crossing path. A vehicle that acknowledged our
    /// lane change request no longer counts as crossing.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn no_cars_blocking(
        &self,
        tile: TileCoord,
        lane: Lane,
        me: ConvoyId,
        current: Ribi,
        next: Ribi,
        overtaking: bool,
        forced_to_change_lane: bool,
    ) -> Option<ConvoyId> {
        if let Some(cell) = self.cells.get(&(tile, lane)).filter(|c| c.convoy != me) {
            return Some(cell.convoy);
        }
        ROAD_LANES
            .iter()
            .filter(|other_lane| **other_lane != lane)
            .filter_map(|other_lane| self.cells.get(&(tile, *other_lane)))
            .filter(|cell| cell.convoy != me)
            .filter(|cell| !self.has_yielded_to(cell.convoy, me))
            .find(|cell| {
                judge_lane_crossing(
                    current,
                    next,
                    cell.next_direction,
                    overtaking,
                    forced_to_change_lane,
                    self.drive_left,
                )
            })
            .map(|cell| cell.convoy)
    }

    /// Replace the cells of `convoy` atomically.
    ///
    /// Fails without any change, returning the first other holder, when one
    /// of the cells is taken by somebody else.
    pub fn occupy(
        &mut self,
        convoy: ConvoyId,
        cells: &[(TileCoord, Lane, LaneCell)],
    ) -> Result<(), ConvoyId> {
        for (tile, lane, _) in cells {
            if let Some(other) = self.cells.get(&(*tile, *lane)).filter(|c| c.convoy != convoy) {
                return Err(other.convoy);
            }
        }
        self.vacate(convoy);
        let mut held = Vec::with_capacity(cells.len());
        for (tile, lane, cell) in cells {
            self.cells.insert((*tile, *lane), *cell);
            held.push((*tile, *lane));
        }
        self.by_convoy.insert(convoy, held);
        Ok(())
    }

    /// Drop every cell of `convoy`.
    pub fn vacate(&mut self, convoy: ConvoyId) {
        if let Some(held) = self.by_convoy.remove(&convoy) {
            for key in held {
                if self.cells.get(&key).is_some_and(|c| c.convoy == convoy) {
                    self.cells.remove(&key);
                }
            }
        }
    }

    /// Move `convoy` from `from` to `to` on `tile` if the target cell is free.
    pub fn shift_lane(&mut self, convoy: ConvoyId, tile: TileCoord, from: Lane, to: Lane) -> bool {
        if self.cells.get(&(tile, to)).is_some_and(|c| c.convoy != convoy) {
            return false;
        }
        let Some(cell) = self.cells.get(&(tile, from)).filter(|c| c.convoy == convoy).copied() else {
            return false;
        };
        self.cells.remove(&(tile, from));
        self.cells.insert((tile, to), cell);
        if let Some(held) = self.by_convoy.get_mut(&convoy) {
            for key in held.iter_mut().filter(|k| **k == (tile, from)) {
                *key = (tile, to);
            }
        }
        true
    }

    // ===== YIELD PROTOCOL =====

    /// File a lane change request; a requester has at most one.
    ///
    /// Returns `false` when an identical request is already pending.
    pub fn request_lane_change(
        &mut self,
        requester: ConvoyId,
        occupant: ConvoyId,
        tile: TileCoord,
        target: Lane,
        tick: u64,
    ) -> bool {
        if self
            .requests
            .get(&requester)
            .is_some_and(|r| r.occupant == occupant && r.tile == tile && r.target == target)
        {
            return false;
        }
        debug!(%requester, %occupant, %tile, ?target, "Lane change requested");
        self.requests.insert(
            requester,
            LaneChangeRequest {
                requester,
                occupant,
                tile,
                target,
                filed_tick: tick,
                acknowledged: false,
            },
        );
        true
    }

    /// Acknowledge every request addressed to `occupant`; returns the
    /// requesters.
    pub fn yield_lane_space(&mut self, occupant: ConvoyId) -> Vec<ConvoyId> {
        let mut acked = Vec::new();
        for request in self.requests.values_mut().filter(|r| r.occupant == occupant) {
            request.acknowledged = true;
            acked.push(request.requester);
        }
        acked
    }

    #[must_use]
    pub fn has_yielded_to(&self, occupant: ConvoyId, requester: ConvoyId) -> bool {
        self.requests
            .get(&requester)
            .is_some_and(|r| r.occupant == occupant && r.acknowledged)
    }

    #[must_use]
    pub fn request_of(&self, requester: ConvoyId) -> Option<&LaneChangeRequest> {
        self.requests.get(&requester)
    }

    /// Requests addressed to `occupant` that it has not acknowledged yet.
    #[must_use]
    pub fn pending_against(&self, occupant: ConvoyId) -> Vec<LaneChangeRequest> {
        self.requests
            .values()
            .filter(|r| r.occupant == occupant && !r.acknowledged)
            .copied()
            .collect()
    }

    /// Settle the pending requests once per tick.
    ///
    /// An acknowledged request completes when its target cell is free;
    /// unacknowledged requests older than `timeout` expire.
    pub fn evaluate(&mut self, tick: u64, timeout: u64) -> LaneEvaluation {
        let mut evaluation = LaneEvaluation::default();
        let cells = &self.cells;
        self.requests.retain(|_, request| {
            let target_free = cells
                .get(&(request.tile, request.target))
                .is_none_or(|c| c.convoy == request.requester);
            if request.acknowledged && target_free {
                evaluation.completed.push(*request);
                return false;
            }
            if tick.saturating_sub(request.filed_tick) > timeout {
                evaluation.expired.push(*request);
                return false;
            }
            true
        });
        evaluation
    }

    /// Forget every request made by or addressed to `convoy`.
    pub fn forget(&mut self, convoy: ConvoyId) {
        self.requests
            .retain(|requester, r| *requester != convoy && r.occupant != convoy);
    }

    pub fn cells(&self) -> impl Iterator<Item = (&(TileCoord, Lane), &LaneCell)> {
        self.cells.iter()
    }

    pub fn requests(&self) -> impl Iterator<Item = &LaneChangeRequest> {
        self.requests.values()
    }
}
