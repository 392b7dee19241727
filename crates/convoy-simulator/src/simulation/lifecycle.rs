//! Routing, stops, loading and the depot lifecycle.

use super::{Entry, Simulation};
use crate::convoy::Convoy;
use crate::error::{Result, SimError};
use crate::events::SimEvent;
use crate::movement::MovementKind;
use crate::router::{Route, RouteConstraints};
use crate::state::ConvoyState;
use crate::world::{World, WorldContext};
use convoy_domain::{CostType, Lane, STEPS_PER_TILE, StationId, TileCoord};
use tracing::{debug, info, warn};

impl Simulation {
    // =========================================================================
    // ROUTING
    // =========================================================================

    pub(crate) fn step_routing(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        let Some(start) = cnv.front_tile() else {
            return;
        };
        let goal = if cnv.heading_home {
            cnv.home_depot
        } else {
            match cnv.schedule.current_target() {
                Some(target) => target,
                None => {
                    self.route_failed(cnv, start, ctx.world);
                    return;
                }
            }
        };
        self.drop_signal_requests(cnv);
        if start == goal {
            self.reached_target(cnv, ctx);
            return;
        }

        let constraints = RouteConstraints::new(cnv.waytype, cnv.kin.cached().min_top_speed_kmh);
        let Some(mut path) = ctx.router.compute_route(ctx.world, start, goal, &constraints) else {
            self.route_failed(cnv, goal, ctx.world);
            return;
        };

        if cnv.path_reverses(&path) {
            if self.couplings.follower_of(cnv.id).is_some() {
                self.cascade_uncouple(cnv, ctx);
            }
            cnv.reverse_in_place();
            if MovementKind::for_waytype(cnv.waytype) == MovementKind::Road {
                self.record_body_lanes(cnv);
            }
            let Some(front) = cnv.front_tile() else {
                return;
            };
            debug!(convoy = %cnv.id, %front, "Reversing");
            match ctx.router.compute_route(ctx.world, front, goal, &constraints) {
                Some(reversed) => path = reversed,
                None => {
                    self.route_failed(cnv, goal, ctx.world);
                    return;
                }
            }
        }

        self.install_route(cnv, path, ctx.world);
        let on_depot = cnv
            .front_tile()
            .is_some_and(|tile| ctx.world.is_depot(tile, cnv.waytype));
        info!(convoy = %cnv.id, %goal, tiles = cnv.route.len(), "Route found");
        if on_depot {
            self.transition(cnv, ConvoyState::WaitingForLeavingDepot);
        } else {
            self.transition(cnv, ConvoyState::Driving);
        }
    }

    fn route_failed(&mut self, cnv: &mut Convoy, goal: TileCoord, world: &dyn World) {
        cnv.kin.akt_speed = 0;
        if MovementKind::for_waytype(cnv.waytype) == MovementKind::Rail {
            self.reclaim_body(cnv, world);
        }
        warn!(error = %SimError::NoRoute { convoy: cnv.id, goal }, "Routing failed");
        self.transition(cnv, ConvoyState::NoRoute);
        self.emit(SimEvent::NoRoute {
            convoy: cnv.id,
            goal,
        });
    }

    /// Adopt `path` (starting at the front tile) and re-issue the claims
    /// for the tiles under the convoy.
    fn install_route(&mut self, cnv: &mut Convoy, path: Route, world: &dyn World) {
        let dropped = cnv.assign_route(path);
        cnv.reservation.shift_indices(dropped);
        cnv.longblock = None;
        cnv.loading_limit = 0;
        match MovementKind::for_waytype(cnv.waytype) {
            MovementKind::Rail => {
                self.reclaim_body(cnv, world);
                cnv.next_stop_index = cnv.route_index;
            }
            MovementKind::Road => {
                self.record_body_lanes(cnv);
            }
            MovementKind::Water | MovementKind::Air => {}
        }
        let rear = cnv.rear_index();
        self.release_passed_crossings(cnv, rear);
        self.calc_crossing_reservation(cnv, world);
    }

    /// Drop every rail claim except the tiles under the convoy.
    fn reclaim_body(&mut self, cnv: &mut Convoy, world: &dyn World) {
        cnv.reservation.release_all(&mut self.reservations, cnv.id);
        let body = cnv.body();
        if !cnv
            .reservation
            .claim_range(&mut self.reservations, world, cnv.waytype, cnv.id, &body)
        {
            warn!(convoy = %cnv.id, "Tiles under the convoy are claimed by another convoy");
        }
    }

    /// Put every body tile without a recorded lane into the traffic lane.
    fn record_body_lanes(&self, cnv: &mut Convoy) {
        for (index, _) in cnv.body() {
            if cnv.lane.lane_at(index).is_some() {
                continue;
            }
            let dir = match cnv.route.direction_into(index) {
                d if d.is_none() => cnv.route.direction_into(index + 1),
                d => d,
            };
            cnv.lane
                .record_lane(index, Lane::for_travel(dir, false, self.config.drive_left));
        }
        cnv.place_vehicles();
    }

    pub(crate) fn step_leave_depot(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        match self.can_enter_next(cnv, ctx) {
            Entry::Clear { .. } => self.transition(cnv, ConvoyState::LeavingDepot),
            Entry::Blocked { .. } => cnv.wait_lock = self.config.backoff_base_ticks,
        }
    }

    // =========================================================================
    // STOPS
    // =========================================================================

    /// The front reached the end of the route.
    pub(crate) fn reached_target(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        cnv.kin.akt_speed = 0;
        let Some(tile) = cnv.front_tile() else {
            return;
        };
        let at_depot = ctx.world.is_depot(tile, cnv.waytype);
        if at_depot && cnv.heading_home {
            self.transition(cnv, ConvoyState::EnteringDepot);
            return;
        }

        let station = ctx.world.station_at(tile);
        self.book_stop(cnv, tile, station);
        if cnv.register_journey_time(self.tick, self.config.delay_recovery_margin_ticks) {
            info!(convoy = %cnv.id, late = cnv.in_delay_recovery, "Delay recovery switched");
        }
        match station {
            Some(_) => {
                let entry = cnv.schedule.current_entry().copied();
                cnv.loading_limit = entry.map_or(0, |entry| entry.minimum_loading);
                cnv.arrived_tick = self.tick;
                cnv.scheduled_departure_tick = entry
                    .and_then(|entry| entry.departure)
                    .map(|slot| slot.next_after(self.tick));
                self.transition(cnv, ConvoyState::Loading);
            }
            None => {
                cnv.departed_tick = Some(self.tick);
                cnv.schedule.advance();
                self.transition(cnv, ConvoyState::Routing);
            }
        }
    }

    /// Unload everything and book revenue against the distance travelled
    /// since the previous stop.
    pub(crate) fn book_stop(&mut self, cnv: &mut Convoy, tile: TileCoord, station: Option<StationId>) {
        let delivered = cnv.unload_all();
        let revenue = i64::from(delivered)
            * i64::from(cnv.distance_since_last_stop)
            * self.config.revenue_per_unit_tile;
        if delivered > 0 {
            cnv.finance.book(revenue, CostType::Revenue);
            cnv.finance.book(i64::from(delivered), CostType::TransportedGoods);
        }
        let operating_cost = cnv.cost_since_last_stop;
        debug!(convoy = %cnv.id, %tile, delivered, revenue, "Stop booked");
        self.emit(SimEvent::StopBooked {
            convoy: cnv.id,
            tile,
            station,
            delivered,
            revenue,
            operating_cost,
        });
        cnv.distance_since_last_stop = 0;
        cnv.cost_since_last_stop = 0;
    }

    pub(crate) fn step_loading(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        let station = cnv.front_tile().and_then(|tile| ctx.world.station_at(tile));
        if let Some(station) = station.filter(|_| !cnv.no_load) {
            let room = cnv.capacity().saturating_sub(cnv.cargo());
            let taken = self.stations.take(station, room);
            if taken > 0 {
                cnv.load(taken);
                debug!(convoy = %cnv.id, %station, taken, level = cnv.loading_level, "Loaded");
            }
        }

        let waited = self.tick.saturating_sub(cnv.arrived_tick);
        let timed_out = cnv
            .schedule
            .current_entry()
            .and_then(|entry| entry.max_wait_ticks)
            .is_some_and(|max| waited >= u64::from(max));
        let full_enough = cnv.loading_level >= cnv.loading_limit;
        let loaded = cnv.no_load || cnv.capacity() == 0 || full_enough || timed_out;
        if loaded && cnv.may_depart(self.tick) {
            if let Some(slot) = cnv.scheduled_departure_tick.take() {
                debug!(convoy = %cnv.id, slot, late_by = self.tick.saturating_sub(slot), "Departing on timetable");
            }
            cnv.loading_limit = 0;
            cnv.departed_tick = Some(self.tick);
            cnv.schedule.advance();
            self.transition(cnv, ConvoyState::Routing);
            return;
        }
        let interval = self.config.loading_interval_ticks;
        // loaded and only the slot is missing: wake up exactly on it
        cnv.wait_lock = match cnv.scheduled_departure_tick.filter(|_| loaded) {
            Some(slot) => u32::try_from(slot.saturating_sub(self.tick + 1))
                .unwrap_or(u32::MAX)
                .min(interval),
            None => interval,
        };
    }

    // =========================================================================
    // DEPOT
    // =========================================================================

    pub(crate) fn step_enter_depot(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        self.cascade_uncouple(cnv, ctx);
        self.release_everything(cnv);
        cnv.heading_home = false;
        cnv.kin.akt_speed = 0;
        let depot = cnv.front_tile().unwrap_or(cnv.home_depot);
        cnv.route = Route::new(vec![depot]);
        cnv.route_epoch += 1;
        cnv.route_index = 0;
        cnv.front_steps = 0;
        cnv.next_stop_index = 0;
        cnv.lane.lane_trail.clear();
        cnv.place_vehicles();
        info!(convoy = %cnv.id, %depot, "Entered depot");
        if cnv.withdraw {
            self.transition(cnv, ConvoyState::SelfDestruct);
        } else {
            self.transition(cnv, ConvoyState::Initial);
        }
    }

    /// Give back every claimed tile, lane cell and pending signal request.
    pub(crate) fn release_everything(&mut self, cnv: &mut Convoy) {
        let released = cnv.reservation.release_all(&mut self.reservations, cnv.id);
        self.lanes.vacate(cnv.id);
        self.lanes.forget(cnv.id);
        self.occupancy.vacate(cnv.id);
        self.release_crossings(cnv);
        self.drop_signal_requests(cnv);
        if released > 0 {
            debug!(convoy = %cnv.id, released, "Released all claims");
        }
    }

    /// Withdraw pending priority and longblock requests.
    pub(crate) fn drop_signal_requests(&mut self, cnv: &mut Convoy) {
        self.priority.withdraw(cnv.id);
        self.longblock.invalidate_convoy(cnv.id);
        cnv.longblock = None;
    }

    /// Execute a self-destruct: the handle goes stale after this.
    pub(crate) fn destroy(&mut self, mut cnv: Convoy, ctx: &WorldContext<'_>) {
        let id = cnv.id;
        self.cascade_uncouple(&mut cnv, ctx);
        self.release_everything(&mut cnv);
        if let Some(line) = cnv.line.take() {
            self.lines.detach(line, id);
        }
        self.convoys.remove(id);
        info!(convoy = %id, name = %cnv.name, "Convoy destroyed");
        self.emit(SimEvent::Destroyed { convoy: id });
    }

    // =========================================================================
    // DEPLOY
    // =========================================================================

    pub(crate) fn deploy_convoy(
        &mut self,
        cnv: &mut Convoy,
        path: Route,
        front_index: usize,
        ctx: &WorldContext<'_>,
    ) -> Result<()> {
        if cnv.state != ConvoyState::Initial {
            return Err(SimError::InvalidCommand {
                convoy: cnv.id,
                reason: format!("deploy needs a convoy in the depot, not {}", cnv.state),
            });
        }
        if front_index >= path.len() {
            return Err(SimError::InvalidCommand {
                convoy: cnv.id,
                reason: format!("front index {front_index} outside a path of {} tiles", path.len()),
            });
        }
        if let Some(tile) = path.tiles.iter().find(|t| !ctx.world.has_way(**t, cnv.waytype)) {
            return Err(SimError::InvalidCommand {
                convoy: cnv.id,
                reason: format!("no {} way at {tile}", cnv.waytype.as_str()),
            });
        }

        let saved = (cnv.route.clone(), cnv.route_index, cnv.front_steps, cnv.lane.clone());
        cnv.route = path;
        cnv.route_epoch += 1;
        cnv.route_index = front_index;
        cnv.front_steps = STEPS_PER_TILE - 1;
        cnv.lane.lane_trail.clear();
        let kind = MovementKind::for_waytype(cnv.waytype);
        // rail earns its stopping point through reservations
        cnv.next_stop_index = match kind {
            MovementKind::Rail => front_index,
            _ => cnv.route.last_index(),
        };
        if kind == MovementKind::Road {
            self.record_body_lanes(cnv);
        }
        cnv.place_vehicles();

        let body = cnv.body();
        let claimed = self.claim_body_crossings(cnv, ctx.world)
            && match kind {
                MovementKind::Rail => cnv.reservation.claim_range(
                    &mut self.reservations,
                    ctx.world,
                    cnv.waytype,
                    cnv.id,
                    &body,
                ),
                MovementKind::Road => self.publish_lane_cells(cnv, ctx.world).is_ok(),
                MovementKind::Water | MovementKind::Air => {
                    let taken = body
                        .iter()
                        .any(|(_, t)| self.occupancy.holder(*t, cnv.waytype).is_some_and(|h| h != cnv.id));
                    if !taken {
                        let tiles: Vec<TileCoord> = body.iter().map(|(_, t)| *t).collect();
                        self.occupancy.occupy(cnv.id, cnv.waytype, &tiles);
                    }
                    !taken
                }
            };
        if !claimed {
            self.release_crossings(cnv);
            let index = cnv.rear_index();
            (cnv.route, cnv.route_index, cnv.front_steps, cnv.lane) = saved;
            cnv.next_stop_index = 0;
            cnv.place_vehicles();
            return Err(SimError::ReservationDenied {
                convoy: cnv.id,
                index,
            });
        }

        self.calc_crossing_reservation(cnv, ctx.world);
        cnv.kin.mark_roster_changed();
        info!(convoy = %cnv.id, front = front_index, "Convoy deployed");
        self.transition(cnv, ConvoyState::Driving);
        Ok(())
    }
}
