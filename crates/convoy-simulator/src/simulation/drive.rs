//! Driving: spending the step budget, tile hops and the can-enter dispatch.

use super::{ARRIVAL_STEPS, Entry, Simulation};
use crate::convoy::{Convoy, LaneState};
use crate::crossings::CrossingSide;
use crate::lanes::LaneCell;
use crate::movement::MovementKind;
use crate::reservation::{ReserveMode, ReserveRequest, block_reserver};
use crate::state::ConvoyState;
use crate::world::{World, WorldContext};
use convoy_domain::{CostType, Lane, LaneAffinity, Ribi, STEPS_PER_TILE, TileCoord};
use tracing::{debug, warn};

/// Position of a road convoy before a hop, restored when its lane cells
/// cannot be published afterwards.
struct HopUndo {
    route_index: usize,
    front_steps: u32,
    alte_richtung: Ribi,
    lane: LaneState,
}

impl HopUndo {
    fn of(cnv: &Convoy) -> Self {
        Self {
            route_index: cnv.route_index,
            front_steps: cnv.front_steps,
            alte_richtung: cnv.alte_richtung,
            lane: cnv.lane.clone(),
        }
    }

    fn restore(self, cnv: &mut Convoy) {
        cnv.route_index = self.route_index;
        cnv.front_steps = self.front_steps;
        cnv.alte_richtung = self.alte_richtung;
        cnv.lane = self.lane;
    }
}

/// Running cost and distance of one tile travelled.
fn book_hop(cnv: &mut Convoy) {
    cnv.total_distance_traveled += 1;
    cnv.distance_since_last_stop += 1;
    let cost = cnv.running_cost_per_tile();
    cnv.finance.book(-cost, CostType::Operations);
    cnv.finance.book(1, CostType::Distance);
    cnv.cost_since_last_stop += cost;
}

impl Simulation {
    // =========================================================================
    // CAN ENTER
    // =========================================================================

    /// Whether the front vehicle may cross into the next route tile.
    pub(crate) fn can_enter_next(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) -> Entry {
        let next = cnv.route_index + 1;
        let Some(tile) = cnv.route.get(next) else {
            return Entry::CLEAR;
        };
        let kind = MovementKind::for_waytype(cnv.waytype);
        if !kind.can_enter_way(ctx.world, tile, cnv.waytype) {
            debug!(convoy = %cnv.id, %tile, "Way missing on next tile");
            return Entry::blocked(0);
        }
        if cnv.kin.cached().is_electric && !ctx.world.is_electrified(tile, cnv.waytype) {
            debug!(convoy = %cnv.id, %tile, "No electrification ahead");
            return Entry::blocked(0);
        }
        let entry = match kind {
            MovementKind::Rail => self.rail_can_enter(cnv, next, tile, ctx),
            MovementKind::Road => self.road_can_enter(cnv, next, tile),
            MovementKind::Water | MovementKind::Air => self.tile_can_enter(cnv, next, tile, kind, ctx),
        };
        if !matches!(entry, Entry::Clear { .. }) {
            return entry;
        }
        if kind == MovementKind::Rail {
            self.reserve_crossings_ahead(cnv, next);
        }
        self.crossing_gate(cnv, tile, ctx.world).unwrap_or(entry)
    }

    /// Ships and aircraft only check plain tile occupancy.
    fn tile_can_enter(
        &self,
        cnv: &Convoy,
        next: usize,
        tile: TileCoord,
        kind: MovementKind,
        ctx: &WorldContext<'_>,
    ) -> Entry {
        let stop_tile = next == cnv.route.last_index() || ctx.world.station_at(tile).is_some();
        if !kind.occupancy_blocks(stop_tile) {
            return Entry::CLEAR;
        }
        match self.occupancy.holder(tile, cnv.waytype).filter(|h| *h != cnv.id) {
            Some(holder) => {
                let speed = self.convoys.get(holder).map_or(0, |h| h.kin.akt_speed);
                Entry::blocked(speed)
            }
            None => Entry::CLEAR,
        }
    }

    // =========================================================================
    // LEVEL CROSSINGS
    // =========================================================================

    /// Refuse entry into a crossing held by the other side, or join its
    /// holders.
    fn crossing_gate(&mut self, cnv: &mut Convoy, tile: TileCoord, world: &dyn World) -> Option<Entry> {
        if cnv.held_crossings.contains(&tile) || !world.is_level_crossing(tile) {
            return None;
        }
        let side = CrossingSide::of(cnv.waytype)?;
        match self.crossings.try_reserve(tile, cnv.id, side) {
            Ok(()) => {
                cnv.held_crossings.push(tile);
                None
            }
            Err(holder) => {
                debug!(convoy = %cnv.id, %tile, %holder, "Crossing held by the other side");
                let speed = self.convoys.get(holder).map_or(0, |h| h.kin.akt_speed);
                Some(Entry::blocked(speed))
            }
        }
    }

    /// Note the crossings ahead that a train takes early, together with the
    /// route index from which it may take each.
    pub(crate) fn calc_crossing_reservation(&self, cnv: &mut Convoy, world: &dyn World) {
        cnv.crossing_reservation_index.clear();
        if CrossingSide::of(cnv.waytype) != Some(CrossingSide::Rail) {
            return;
        }
        let lookahead = self.config.crossing_lookahead_tiles;
        for (index, tile) in cnv.route.tiles.iter().enumerate().skip(cnv.route_index + 1) {
            if world.is_level_crossing(*tile) && !cnv.held_crossings.contains(tile) {
                cnv.crossing_reservation_index
                    .push((index, index.saturating_sub(lookahead)));
            }
        }
    }

    /// Take noted crossings whose lookahead point the train has reached,
    /// once its block claim covers them.
    fn reserve_crossings_ahead(&mut self, cnv: &mut Convoy, next: usize) {
        let mut i = 0;
        while let Some(&(index, from)) = cnv.crossing_reservation_index.get(i) {
            let Some(tile) = cnv.route.get(index) else {
                cnv.crossing_reservation_index.remove(i);
                continue;
            };
            if from > next || !cnv.reservation.holds(tile) {
                i += 1;
                continue;
            }
            let held = cnv.held_crossings.contains(&tile);
            if held || self.crossings.try_reserve(tile, cnv.id, CrossingSide::Rail).is_ok() {
                if !held {
                    cnv.held_crossings.push(tile);
                }
                cnv.crossing_reservation_index.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Leave every held crossing no longer under or ahead of the convoy.
    pub(crate) fn release_passed_crossings(&mut self, cnv: &mut Convoy, rear: usize) {
        let id = cnv.id;
        let route = &cnv.route;
        let crossings = &mut self.crossings;
        cnv.held_crossings.retain(|tile| {
            let kept = route.position_of(*tile, rear).is_some();
            if !kept {
                crossings.release(*tile, id);
            }
            kept
        });
    }

    pub(crate) fn release_crossings(&mut self, cnv: &mut Convoy) {
        let id = cnv.id;
        for tile in cnv.held_crossings.drain(..) {
            self.crossings.release(tile, id);
        }
        cnv.crossing_reservation_index.clear();
    }

    /// Take the crossings under a convoy being put on the map.
    pub(crate) fn claim_body_crossings(&mut self, cnv: &mut Convoy, world: &dyn World) -> bool {
        let Some(side) = CrossingSide::of(cnv.waytype) else {
            return true;
        };
        for (_, tile) in cnv.body() {
            if cnv.held_crossings.contains(&tile) || !world.is_level_crossing(tile) {
                continue;
            }
            if self.crossings.try_reserve(tile, cnv.id, side).is_err() {
                return false;
            }
            cnv.held_crossings.push(tile);
        }
        true
    }

    // =========================================================================
    // DRIVING
    // =========================================================================

    /// A leader waits for a follower still closing the gap.
    fn follower_approaching(&self, id: convoy_domain::ConvoyId) -> bool {
        self.couplings
            .follower_of(id)
            .and_then(|f| self.convoys.get(f))
            .and_then(|f| f.coupling)
            .is_some_and(|c| !c.coupling_done)
    }

    pub(crate) fn step_driving(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        if self.follower_approaching(cnv.id) {
            cnv.kin.akt_speed = 0;
            return;
        }
        let last = cnv.route.last_index();
        let must_stop = cnv.next_stop_index <= cnv.route_index + 1;
        cnv.kin.accelerate(must_stop);

        let road = MovementKind::for_waytype(cnv.waytype) == MovementKind::Road;
        let mut budget = cnv.kin.steps_this_tick();
        while budget > 0 {
            let at_end = cnv.route_index >= last;
            let limit = if at_end { ARRIVAL_STEPS } else { STEPS_PER_TILE - 1 };
            if cnv.front_steps < limit {
                let advance = (limit - cnv.front_steps).min(budget);
                cnv.front_steps += advance;
                budget -= advance;
                continue;
            }
            if at_end {
                break;
            }
            match self.can_enter_next(cnv, ctx) {
                Entry::Clear { lane } => {
                    if road {
                        let undo = HopUndo::of(cnv);
                        self.hop(cnv, lane);
                        cnv.place_vehicles();
                        if let Err(other) = self.publish_lane_cells(cnv, ctx.world) {
                            debug!(convoy = %cnv.id, blocker = %other, "Lane cells taken behind the front; stepping back");
                            undo.restore(cnv);
                            cnv.place_vehicles();
                            let speed = self.convoys.get(other).map_or(0, |o| o.kin.akt_speed);
                            self.enter_waiting(cnv, speed, false);
                            break;
                        }
                    } else {
                        self.hop(cnv, lane);
                    }
                    book_hop(cnv);
                    budget -= 1;
                }
                Entry::Blocked {
                    restart_speed,
                    retry_now,
                } => {
                    self.enter_waiting(cnv, restart_speed, retry_now);
                    break;
                }
            }
        }

        cnv.place_vehicles();
        self.publish_position(cnv, ctx.world);

        if cnv.state == ConvoyState::LeavingDepot {
            let rear_tile = cnv.route.get(cnv.rear_index());
            if rear_tile.is_some_and(|t| !ctx.world.is_depot(t, cnv.waytype)) {
                self.transition(cnv, ConvoyState::Driving);
            }
        }
        let driving = matches!(cnv.state, ConvoyState::Driving | ConvoyState::LeavingDepot);
        if driving && cnv.route_index >= last && cnv.front_steps >= ARRIVAL_STEPS {
            self.reached_target(cnv, ctx);
        }
    }

    /// Cross into the next route tile.
    fn hop(&mut self, cnv: &mut Convoy, lane: Option<Lane>) {
        let heading = cnv.route.direction_into(cnv.route_index);
        if !heading.is_none() {
            cnv.alte_richtung = heading;
        }
        cnv.route_index += 1;
        cnv.front_steps = 0;

        if let Some(lane) = lane {
            cnv.lane.record_lane(cnv.route_index, lane);
            let dir = cnv.route.direction_into(cnv.route_index);
            let passing = lane != Lane::for_travel(dir, false, self.config.drive_left);
            if passing
                && cnv.lane.next_lane == LaneAffinity::Passing
                && cnv.lane.overtaking_end_index.is_none()
            {
                cnv.lane.overtaking_end_index =
                    Some(cnv.route_index + self.config.overtake_clearance_tiles);
            }
            if passing {
                cnv.lane.next_lane = LaneAffinity::None;
            }
        }

        cnv.kin.mark_moved();
    }

    /// Publish where the convoy now stands: release passed rail tiles, or
    /// refresh lane cells / tile occupancy.
    pub(crate) fn publish_position(&mut self, cnv: &mut Convoy, world: &dyn World) {
        match MovementKind::for_waytype(cnv.waytype) {
            MovementKind::Rail => {
                let request = ReserveRequest {
                    world,
                    waytype: cnv.waytype,
                    route: &cnv.route,
                    start_index: self.combined_rear_index(cnv),
                    signal_count: 0,
                    max_lookahead: 0,
                    until_route_end: false,
                };
                let outcome = block_reserver(
                    &mut self.reservations,
                    cnv.id,
                    &mut cnv.reservation,
                    &request,
                    ReserveMode::Release,
                );
                if outcome.released > 0 {
                    debug!(convoy = %cnv.id, released = outcome.released, "Released passed tiles");
                }
            }
            MovementKind::Road => {
                if let Err(other) = self.publish_lane_cells(cnv, world) {
                    warn!(convoy = %cnv.id, blocker = %other, "Lane cells taken; keeping previous cells");
                }
                cnv.lane.prune(cnv.rear_index());
            }
            MovementKind::Water | MovementKind::Air => {
                let tiles: Vec<TileCoord> = cnv
                    .body()
                    .into_iter()
                    .map(|(_, tile)| tile)
                    .filter(|tile| !world.is_depot(*tile, cnv.waytype))
                    .collect();
                self.occupancy.occupy(cnv.id, cnv.waytype, &tiles);
            }
        }
        if !cnv.held_crossings.is_empty() {
            let rear = match MovementKind::for_waytype(cnv.waytype) {
                MovementKind::Rail => self.combined_rear_index(cnv),
                _ => cnv.rear_index(),
            };
            self.release_passed_crossings(cnv, rear);
        }
    }

    /// Rear route index of the convoy, counting a fully coupled follower as
    /// part of it.
    fn combined_rear_index(&self, cnv: &Convoy) -> usize {
        let follower_len = self
            .couplings
            .follower_of(cnv.id)
            .and_then(|f| self.convoys.get(f))
            .filter(|f| f.coupling.is_some_and(|c| c.coupling_done))
            .map_or(0, |f| u64::from(f.length_steps()));
        if follower_len == 0 {
            return cnv.rear_index();
        }
        let rear = cnv
            .front_dist()
            .saturating_sub(u64::from(cnv.length_steps()) + follower_len);
        usize::try_from(rear / super::STEPS).unwrap_or(0).min(cnv.rear_index())
    }

    pub(crate) fn publish_lane_cells(
        &mut self,
        cnv: &Convoy,
        world: &dyn World,
    ) -> Result<(), convoy_domain::ConvoyId> {
        let overtaking = cnv.lane.is_overtaking(cnv.route_index);
        let cells: Vec<(TileCoord, Lane, LaneCell)> = cnv
            .vehicles
            .iter()
            .filter(|v| !world.is_depot(v.pos, cnv.waytype))
            .map(|v| {
                let leaving = cnv.route.direction_into(v.route_index + 1);
                let cell = LaneCell {
                    convoy: cnv.id,
                    direction: v.direction,
                    next_direction: if leaving.is_none() { v.direction } else { leaving },
                    overtaking,
                };
                (v.pos, v.lane, cell)
            })
            .collect();
        self.lanes.occupy(cnv.id, &cells)
    }

    // =========================================================================
    // WAITING
    // =========================================================================

    fn enter_waiting(&mut self, cnv: &mut Convoy, restart_speed: u32, retry_now: bool) {
        if !matches!(cnv.state, ConvoyState::Waiting { .. }) {
            let remaining_ticks = self.config.ticks_per_month;
            self.transition(
                cnv,
                ConvoyState::Waiting {
                    tier: 0,
                    remaining_ticks,
                },
            );
        }
        cnv.kin.akt_speed = 0;
        self.lock_wait(cnv, 0, restart_speed, retry_now);
    }

    fn lock_wait(&self, cnv: &mut Convoy, tier: u8, restart_speed: u32, retry_now: bool) {
        cnv.restart_speed = restart_speed;
        cnv.wait_lock = if retry_now {
            0
        } else {
            self.backoff_ticks(tier, restart_speed)
        };
        cnv.last_wait_lock = cnv.wait_lock;
    }

    /// Re-issue the can-enter query; escalate the backoff tier on failure.
    pub(crate) fn step_waiting(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        let ConvoyState::Waiting { tier, .. } = cnv.state else {
            return;
        };
        match self.can_enter_next(cnv, ctx) {
            Entry::Clear { .. } => {
                self.transition(cnv, ConvoyState::CanStart { tier });
            }
            Entry::Blocked {
                restart_speed,
                retry_now,
            } => {
                // The lock counted down one tick each, plus this retry
                let elapsed = cnv.last_wait_lock + 1;
                let mut new_tier = tier;
                if let Some(escalated) = cnv.record_wait_failure(elapsed, self.config.ticks_per_month) {
                    if let ConvoyState::Waiting { tier: next, .. } = escalated {
                        new_tier = next;
                    }
                    debug!(convoy = %cnv.id, tier = new_tier, "Wait escalated");
                    self.transition(cnv, escalated);
                }
                self.lock_wait(cnv, new_tier, restart_speed, retry_now);
            }
        }
    }
}
