//! Lane selection, overtaking and the yield protocol for road convoys.

use super::{Entry, Simulation};
use crate::convoy::Convoy;
use crate::error::{Result, SimError};
use crate::state::ConvoyState;
use convoy_domain::{ConvoyId, Lane, LaneAffinity, Ribi, TileCoord};
use tracing::{debug, info};

impl Simulation {
    pub(crate) fn road_can_enter(&mut self, cnv: &mut Convoy, next: usize, tile: TileCoord) -> Entry {
        let here = cnv.route_index;
        if cnv.lane.yielding_quit_index.is_some_and(|quit| here >= quit) {
            cnv.lane.yielding_quit_index = None;
        }
        if cnv.lane.overtaking_end_index.is_some_and(|end| here >= end) {
            cnv.lane.overtaking_end_index = None;
        }
        let affinity = cnv.lane.affinity_at(here);
        let overtaking = cnv.lane.is_overtaking(here);
        let passing = match affinity {
            LaneAffinity::Passing => true,
            LaneAffinity::Traffic => false,
            LaneAffinity::None => overtaking || cnv.lane.next_lane == LaneAffinity::Passing,
        };

        let drive_left = self.config.drive_left;
        let dir = cnv.route.direction_into(next);
        let leaving = match cnv.route.direction_into(next + 1) {
            d if d.is_none() => dir,
            d => d,
        };
        let lane = Lane::for_travel(dir, passing, drive_left);
        let switching = cnv
            .lane
            .lane_at(here)
            .is_some_and(|current| current != lane && current.opposite() == lane && !turns(cnv, next));

        match self
            .lanes
            .no_cars_blocking(tile, lane, cnv.id, dir, leaving, overtaking, switching)
        {
            None => Entry::Clear { lane: Some(lane) },
            Some(blocker) if passing => {
                if self.same_direction_on(blocker, tile, lane, dir) {
                    self.file_lane_request(cnv, blocker, tile, lane)
                } else {
                    Entry::blocked(self.speed_of(blocker))
                }
            }
            Some(blocker) if affinity == LaneAffinity::Traffic => Entry::blocked(self.speed_of(blocker)),
            Some(blocker) => self.try_overtake(cnv, next, tile, blocker),
        }
    }

    fn speed_of(&self, convoy: ConvoyId) -> u32 {
        self.convoys.get(convoy).map_or(0, |c| c.kin.akt_speed)
    }

    /// Whether `convoy` stands in `(tile, lane)` heading the same way.
    fn same_direction_on(&self, convoy: ConvoyId, tile: TileCoord, lane: Lane, dir: Ribi) -> bool {
        self.lanes
            .occupant(tile, lane)
            .is_some_and(|cell| cell.convoy == convoy && cell.direction == dir)
    }

    /// Pull out into the passing lane past a slower convoy ahead.
    ///
    /// Needs a straight stretch of `overtake_clearance_tiles` with an empty
    /// passing lane. A same-direction vehicle dawdling in the passing lane
    /// gets a lane change request instead.
    fn try_overtake(&mut self, cnv: &mut Convoy, next: usize, tile: TileCoord, blocker: ConvoyId) -> Entry {
        let blocker_speed = self.speed_of(blocker);
        let dir = cnv.route.direction_into(next);
        let traffic_lane = Lane::for_travel(dir, false, self.config.drive_left);
        let passing_lane = traffic_lane.opposite();

        let ahead_same_way = self.same_direction_on(blocker, tile, traffic_lane, dir);
        let slower = blocker_speed < cnv.kin.akt_speed_soll;
        let clearance = self.config.overtake_clearance_tiles;
        let straight = (next..=next + clearance).all(|i| cnv.route.direction_into(i) == dir);
        if !ahead_same_way || !slower || !straight {
            return Entry::blocked(blocker_speed);
        }

        if let Some(cell) = self.lanes.occupant(tile, passing_lane).copied() {
            if cell.convoy != cnv.id && cell.direction == dir {
                return self.file_lane_request(cnv, cell.convoy, tile, passing_lane);
            }
        }
        let passing_free = (next..=next + clearance).all(|i| {
            cnv.route.get(i).is_some_and(|t| {
                self.lanes
                    .occupant(t, passing_lane)
                    .is_none_or(|cell| cell.convoy == cnv.id)
            })
        });
        let oncoming = self.lanes.no_cars_blocking(
            tile,
            passing_lane,
            cnv.id,
            dir,
            dir,
            true,
            false,
        );
        if !passing_free || oncoming.is_some() {
            return Entry::blocked(blocker_speed);
        }

        cnv.lane.next_lane = LaneAffinity::Passing;
        cnv.lane.overtaking_end_index = Some(next + clearance);
        debug!(convoy = %cnv.id, %blocker, until = next + clearance, "Overtaking");
        Entry::Clear {
            lane: Some(passing_lane),
        }
    }

    /// Ask `occupant` to leave `(tile, lane)`.
    fn file_lane_request(&mut self, cnv: &mut Convoy, occupant: ConvoyId, tile: TileCoord, lane: Lane) -> Entry {
        if self
            .lanes
            .request_lane_change(cnv.id, occupant, tile, lane, self.tick)
        {
            cnv.lane.next_cross_lane = true;
            cnv.lane.request_cross_ticks = self.tick;
            if let Some(other) = self.convoys.get_mut(occupant) {
                other.lane.requested_change_lane = true;
            }
        }
        Entry::blocked(self.speed_of(occupant))
    }

    // =========================================================================
    // YIELD PROTOCOL
    // =========================================================================

    /// File a request by `requester` for the cell `(tile, target)`.
    ///
    /// Returns `Ok(false)` when the cell is free or an identical request is
    /// already pending.
    pub fn request_lane_change(&mut self, requester: ConvoyId, tile: TileCoord, target: Lane) -> Result<bool> {
        self.convoys.resolve(requester)?;
        let Some(occupant) = self
            .lanes
            .occupant(tile, target)
            .map(|cell| cell.convoy)
            .filter(|holder| *holder != requester)
        else {
            return Ok(false);
        };
        let filed = self
            .lanes
            .request_lane_change(requester, occupant, tile, target, self.tick);
        if filed {
            if let Some(cnv) = self.convoys.get_mut(requester) {
                cnv.lane.next_cross_lane = true;
                cnv.lane.request_cross_ticks = self.tick;
            }
            if let Some(cnv) = self.convoys.get_mut(occupant) {
                cnv.lane.requested_change_lane = true;
            }
        }
        Ok(filed)
    }

    /// Make `occupant` move over into the traffic lane and acknowledge every
    /// request addressed to it. Returns the requesters.
    pub fn yield_lane_space(&mut self, occupant: ConvoyId) -> Result<Vec<ConvoyId>> {
        let mut cnv = self
            .convoys
            .take(occupant)
            .ok_or(SimError::InvalidHandle(occupant))?;
        let acked = self.yield_lane_space_of(&mut cnv);
        self.convoys.put_back(occupant, cnv);
        Ok(acked)
    }

    fn yield_lane_space_of(&mut self, cnv: &mut Convoy) -> Vec<ConvoyId> {
        let drive_left = self.config.drive_left;
        let quit = cnv.route_index + self.config.yield_distance_tiles;
        cnv.lane.yielding_quit_index = Some(quit);
        cnv.lane.overtaking_end_index = None;
        cnv.lane.next_lane = LaneAffinity::None;
        cnv.lane.set_affinity(LaneAffinity::Traffic, quit);

        for i in 0..cnv.vehicles.len() {
            let (pos, index, dir, lane) = {
                let v = &cnv.vehicles[i];
                (v.pos, v.route_index, v.direction, v.lane)
            };
            let traffic = Lane::for_travel(dir, false, drive_left);
            if lane == traffic {
                continue;
            }
            let blocked = self
                .lanes
                .no_cars_blocking(pos, traffic, cnv.id, dir, dir, false, true)
                .is_some();
            if !blocked && self.lanes.shift_lane(cnv.id, pos, lane, traffic) {
                cnv.vehicles[i].lane = traffic;
                cnv.lane.record_lane(index, traffic);
            }
        }

        let acked = self.lanes.yield_lane_space(cnv.id);
        cnv.lane.requested_change_lane = false;
        if !acked.is_empty() {
            info!(convoy = %cnv.id, requesters = acked.len(), until = quit, "Yielding lane");
        }
        acked
    }

    /// Yield on the convoy's own step when somebody asked for its lane.
    pub(crate) fn maybe_yield(&mut self, cnv: &mut Convoy) {
        if !cnv.lane.requested_change_lane {
            return;
        }
        let movable = matches!(
            cnv.state,
            ConvoyState::Driving | ConvoyState::Waiting { .. } | ConvoyState::CanStart { .. }
        );
        if movable && cnv.lane.affinity_at(cnv.route_index) != LaneAffinity::Passing {
            self.yield_lane_space_of(cnv);
        }
    }

    /// Once-per-tick settlement of lane change requests.
    pub(crate) fn settle_lane_requests(&mut self) {
        let evaluation = self
            .lanes
            .evaluate(self.tick, self.config.lane_request_timeout_ticks);
        for request in &evaluation.completed {
            if let Some(requester) = self.convoys.get_mut(request.requester) {
                requester.lane.next_lane = LaneAffinity::Passing;
                requester.lane.next_cross_lane = false;
            }
            debug!(requester = %request.requester, occupant = %request.occupant, "Lane change completed");
        }
        for request in &evaluation.expired {
            if let Some(requester) = self.convoys.get_mut(request.requester) {
                requester.lane.next_cross_lane = false;
            }
            debug!(requester = %request.requester, occupant = %request.occupant, "Lane change request expired");
        }
        for request in evaluation.completed.iter().chain(&evaluation.expired) {
            if self.lanes.pending_against(request.occupant).is_empty() {
                if let Some(occupant) = self.convoys.get_mut(request.occupant) {
                    occupant.lane.requested_change_lane = false;
                }
            }
        }
    }

    /// Pin a road convoy to one lane until its route index reaches
    /// `end_index`.
    pub fn set_lane_affinity(&mut self, id: ConvoyId, affinity: LaneAffinity, end_index: usize) -> Result<()> {
        let cnv = self.convoys.resolve_mut(id)?;
        cnv.lane.set_affinity(affinity, end_index);
        Ok(())
    }
}

/// Whether the route turns when entering `next`.
fn turns(cnv: &Convoy, next: usize) -> bool {
    let before = cnv.route.direction_into(cnv.route_index);
    !before.is_none() && before != cnv.route.direction_into(next)
}
