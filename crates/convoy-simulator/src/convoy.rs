//! Convoy and vehicle records.
//!
//! A convoy is an ordered consist driven as one unit. Vehicle positions are
//! derived from a single front position (route index + steps into the
//! tile) and each vehicle's length, so the consist can never be torn apart.

use crate::finance::FinancialHistory;
use crate::kinematics::Kinematics;
use crate::longblock::LongblockTicket;
use crate::reservation::Reservation;
use crate::router::Route;
use crate::schedule::Schedule;
use crate::state::{ConvoyState, MAX_WAIT_TIER};
use convoy_domain::{
    ConvoyId, Lane, LaneAffinity, LineId, PlayerId, Ribi, STEPS_PER_TILE, TileCoord, VehicleDesc,
    WayType,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

const STEPS: u64 = STEPS_PER_TILE as u64;

// =============================================================================
// VEHICLE
// =============================================================================

/// One vehicle of a consist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub desc: Arc<VehicleDesc>,
    pub pos: TileCoord,
    pub route_index: usize,
    /// Steps into the current tile
    pub steps: u32,
    pub direction: Ribi,
    pub lane: Lane,
    pub cargo: u16,
}

impl Vehicle {
    #[must_use]
    pub fn new(desc: Arc<VehicleDesc>, pos: TileCoord) -> Self {
        Self {
            desc,
            pos,
            route_index: 0,
            steps: 0,
            direction: Ribi::NONE,
            lane: Lane::RoadFront,
            cargo: 0,
        }
    }
}

// =============================================================================
// LANE AND COUPLING STATE
// =============================================================================

/// Road lane bookkeeping of a convoy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneState {
    pub lane_affinity: LaneAffinity,
    pub lane_affinity_end_index: Option<usize>,
    /// Route index until which a yielding convoy keeps to the traffic lane
    pub yielding_quit_index: Option<usize>,
    /// Somebody asked us to leave our lane
    pub requested_change_lane: bool,
    /// Lane chosen for the next tile
    pub next_lane: LaneAffinity,
    /// Route index at which an overtaking manoeuvre ends
    pub overtaking_end_index: Option<usize>,
    /// We asked another convoy to let us cross into its lane
    pub next_cross_lane: bool,
    /// Tick of that request
    pub request_cross_ticks: u64,
    /// Lane used on each route index still under the convoy
    pub lane_trail: VecDeque<(usize, Lane)>,
}

impl LaneState {
    #[must_use]
    pub fn lane_at(&self, index: usize) -> Option<Lane> {
        self.lane_trail
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, lane)| *lane)
    }

    pub fn record_lane(&mut self, index: usize, lane: Lane) {
        self.lane_trail.retain(|(i, _)| *i != index);
        self.lane_trail.push_back((index, lane));
    }

    /// Forget lanes of tiles behind `rear_index`.
    pub fn prune(&mut self, rear_index: usize) {
        self.lane_trail.retain(|(i, _)| *i >= rear_index);
    }

    #[must_use]
    pub fn is_overtaking(&self, route_index: usize) -> bool {
        self.overtaking_end_index.is_some_and(|end| route_index < end)
    }

    /// Pin the convoy to one lane until `end_index`.
    pub fn set_affinity(&mut self, affinity: LaneAffinity, end_index: usize) {
        self.lane_affinity = affinity;
        self.lane_affinity_end_index = Some(end_index);
    }

    /// Affinity in force at `route_index`, expiring a stale one.
    pub fn affinity_at(&mut self, route_index: usize) -> LaneAffinity {
        match self.lane_affinity_end_index {
            Some(end) if route_index < end => self.lane_affinity,
            _ => {
                self.lane_affinity = LaneAffinity::None;
                self.lane_affinity_end_index = None;
                LaneAffinity::None
            }
        }
    }

    fn shift_indices(&mut self, removed_prefix: usize) {
        for (i, _) in &mut self.lane_trail {
            *i = i.saturating_sub(removed_prefix);
        }
        let shift = |v: &mut Option<usize>| {
            if let Some(i) = v {
                *i = i.saturating_sub(removed_prefix);
            }
        };
        shift(&mut self.lane_affinity_end_index);
        shift(&mut self.yielding_quit_index);
        shift(&mut self.overtaking_end_index);
    }
}

/// Follower side of a coupling link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplingState {
    /// Route index of the leader's rear at link time
    pub next_coupling_index: usize,
    /// Steps into that tile where the leader's rear ends
    pub next_coupling_steps: u32,
    pub coupling_done: bool,
    pub scheduled_coupling_delay_tolerance: u64,
    /// Tick by which the gap must be closed
    pub deadline_tick: u64,
    /// Our front distance minus the leader's rear distance, in steps
    pub offset_steps: i64,
    /// Leader route generation our route was last rebased on
    pub leader_route_epoch: u64,
}

// =============================================================================
// CONVOY
// =============================================================================

/// What is needed to put a new convoy into a depot
#[derive(Debug, Clone)]
pub struct ConvoySpec {
    pub name: String,
    pub owner: PlayerId,
    pub home_depot: TileCoord,
    pub vehicles: Vec<Arc<VehicleDesc>>,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Convoy {
    pub id: ConvoyId,
    pub name: String,
    pub owner: PlayerId,
    pub waytype: WayType,
    pub state: ConvoyState,
    pub wait_lock: u32,
    /// Length of the last backoff set while waiting for clearance
    #[serde(default)]
    pub last_wait_lock: u32,
    pub vehicles: Vec<Vehicle>,

    pub route: Route,
    /// Bumped on every route change
    pub route_epoch: u64,
    pub route_index: usize,
    /// Steps of the front vehicle into the tile at `route_index`
    pub front_steps: u32,
    /// Route index the convoy must be able to stop at
    pub next_stop_index: usize,
    /// Heading before the last turn
    pub alte_richtung: Ribi,

    pub schedule: Schedule,
    pub line: Option<LineId>,

    pub reservation: Reservation,
    pub longblock: Option<LongblockTicket>,
    pub kin: Kinematics,
    /// Speed hint from the last denied entry
    pub restart_speed: u32,

    pub lane: LaneState,
    pub coupling: Option<CouplingState>,

    pub loading_level: u8,
    pub loading_limit: u8,
    pub arrived_tick: u64,
    /// Earliest tick the timetable lets the convoy leave its current stop
    #[serde(default)]
    pub scheduled_departure_tick: Option<u64>,
    /// Tick the convoy left its previous stop
    #[serde(default)]
    pub departed_tick: Option<u64>,
    /// Running late; departure slots are skipped until a journey is on time
    #[serde(default)]
    pub in_delay_recovery: bool,

    /// Level crossings ahead still to be reserved, as (crossing index,
    /// index from which to try)
    #[serde(default)]
    pub crossing_reservation_index: Vec<(usize, usize)>,
    /// Level crossings this convoy holds
    #[serde(default)]
    pub held_crossings: Vec<TileCoord>,

    pub finance: FinancialHistory,
    pub total_distance_traveled: u64,
    pub distance_since_last_stop: u32,
    pub cost_since_last_stop: i64,
    pub age_months: u32,

    pub home_depot: TileCoord,
    /// Routing to the home depot instead of the schedule target
    pub heading_home: bool,
    pub withdraw: bool,
    pub no_load: bool,
    pub permit_trade: bool,
    pub accept_player_nr: Option<PlayerId>,
}

impl Convoy {
    #[must_use]
    pub fn new(id: ConvoyId, spec: ConvoySpec) -> Self {
        let waytype = spec
            .vehicles
            .first()
            .map_or(WayType::Track, |desc| desc.waytype);
        let vehicles = spec
            .vehicles
            .into_iter()
            .map(|desc| Vehicle::new(desc, spec.home_depot))
            .collect();
        Self {
            id,
            name: spec.name,
            owner: spec.owner,
            waytype,
            state: ConvoyState::Initial,
            wait_lock: 0,
            last_wait_lock: 0,
            vehicles,
            route: Route::new(vec![spec.home_depot]),
            route_epoch: 0,
            route_index: 0,
            front_steps: 0,
            next_stop_index: 0,
            alte_richtung: Ribi::NONE,
            schedule: spec.schedule,
            line: None,
            reservation: Reservation::new(),
            longblock: None,
            kin: Kinematics::new(),
            restart_speed: 0,
            lane: LaneState::default(),
            coupling: None,
            loading_level: 0,
            loading_limit: 0,
            arrived_tick: 0,
            scheduled_departure_tick: None,
            departed_tick: None,
            in_delay_recovery: false,
            crossing_reservation_index: Vec::new(),
            held_crossings: Vec::new(),
            finance: FinancialHistory::new(),
            total_distance_traveled: 0,
            distance_since_last_stop: 0,
            cost_since_last_stop: 0,
            age_months: 0,
            home_depot: spec.home_depot,
            heading_home: false,
            withdraw: false,
            no_load: false,
            permit_trade: false,
            accept_player_nr: None,
        }
    }

    /// Switch state, returning the previous one when it changed.
    pub fn set_state(&mut self, state: ConvoyState) -> Option<ConvoyState> {
        if self.state == state {
            return None;
        }
        let old = self.state;
        self.state = state;
        Some(old)
    }

    // ===== POSITION =====

    #[must_use]
    pub fn length_steps(&self) -> u32 {
        self.vehicles.iter().map(|v| v.desc.length_in_steps()).sum()
    }

    /// Front position in steps from the route start.
    #[must_use]
    pub fn front_dist(&self) -> u64 {
        self.route_index as u64 * STEPS + u64::from(self.front_steps)
    }

    /// Set the front position from a step distance, clamped to the route.
    pub fn set_front_dist(&mut self, dist: u64) {
        let last = self.route.last_index();
        let index = usize::try_from(dist / STEPS).unwrap_or(usize::MAX);
        if index >= last {
            self.route_index = last;
            self.front_steps = if index == last {
                u32::try_from(dist % STEPS).unwrap_or(0)
            } else {
                STEPS_PER_TILE - 1
            };
        } else {
            self.route_index = index;
            self.front_steps = u32::try_from(dist % STEPS).unwrap_or(0);
        }
    }

    /// Route index of the tile under the rear end of the last vehicle.
    #[must_use]
    pub fn rear_index(&self) -> usize {
        let rear = self.front_dist().saturating_sub(u64::from(self.length_steps()));
        usize::try_from(rear / STEPS).unwrap_or(0).min(self.route_index)
    }

    /// Route tiles under the convoy, rear first.
    #[must_use]
    pub fn body(&self) -> Vec<(usize, TileCoord)> {
        (self.rear_index()..=self.route_index)
            .filter_map(|i| self.route.get(i).map(|tile| (i, tile)))
            .collect()
    }

    #[must_use]
    pub fn front_tile(&self) -> Option<TileCoord> {
        self.route.get(self.route_index)
    }

    /// Derive every vehicle's position from the front position.
    pub fn place_vehicles(&mut self) {
        let front = self.front_dist();
        let last = self.route.last_index();
        let mut offset = 0_u64;
        for vehicle in &mut self.vehicles {
            let dist = front.saturating_sub(offset);
            let index = usize::try_from(dist / STEPS).unwrap_or(last).min(last);
            vehicle.route_index = index;
            vehicle.steps = u32::try_from(dist % STEPS).unwrap_or(0);
            if let Some(tile) = self.route.get(index) {
                vehicle.pos = tile;
            }
            let dir = self.route.direction_into(index);
            if !dir.is_none() {
                vehicle.direction = dir;
            }
            if let Some(lane) = self.lane.lane_at(index) {
                vehicle.lane = lane;
            }
            offset += u64::from(vehicle.desc.length_in_steps());
        }
    }

    /// Replace the route ahead with `path`, keeping the tiles under the
    /// convoy as the new route's prefix. `path` starts at the front tile.
    ///
    /// Returns how many leading route tiles were dropped, so index-based
    /// bookkeeping can be shifted.
    pub fn assign_route(&mut self, path: Route) -> usize {
        let rear = self.rear_index();
        let front = self.route_index;
        let mut tiles: Vec<TileCoord> = self.route.tiles.get(rear..front).map(<[_]>::to_vec).unwrap_or_default();
        tiles.extend(path.tiles);
        self.route = Route::new(tiles);
        self.route_index = front - rear;
        self.route_epoch += 1;
        self.lane.shift_indices(rear);
        self.crossing_reservation_index.clear();
        self.next_stop_index = self.route.last_index();
        self.place_vehicles();
        rear
    }

    /// Whether driving `path` means turning back over our own body.
    #[must_use]
    pub fn path_reverses(&self, path: &Route) -> bool {
        match (path.get(1), self.route_index.checked_sub(1).and_then(|i| self.route.get(i))) {
            (Some(next), Some(behind)) => next == behind,
            _ => false,
        }
    }

    /// Turn the consist around on the tiles it stands on; the old rear
    /// becomes the front.
    pub fn reverse_in_place(&mut self) {
        let rear = self.rear_index();
        let front = self.route_index;
        let old_front_dist = self.front_dist();
        let length = u64::from(self.length_steps());
        let tiles: Vec<TileCoord> = self
            .route
            .tiles
            .get(rear..=front)
            .map(|body| body.iter().rev().copied().collect())
            .unwrap_or_default();
        // point x on the old route maps to (front + 1) * STEPS - 1 - x
        let span = (front as u64 + 1) * STEPS - 1;
        let new_front = span - old_front_dist.saturating_sub(length);
        self.route = Route::new(tiles);
        self.route_epoch += 1;
        self.vehicles.reverse();
        self.lane.lane_trail.clear();
        self.crossing_reservation_index.clear();
        self.set_front_dist(new_front);
        self.alte_richtung = self.alte_richtung.reverse();
        self.place_vehicles();
    }

    // ===== TIMETABLE =====

    /// Record the journey into the current stop and re-judge delay
    /// recovery; returns whether the recovery flag flipped.
    pub fn register_journey_time(&mut self, now: u64, margin: u64) -> bool {
        let Some(departed) = self.departed_tick.take() else {
            return false;
        };
        let journey = now.saturating_sub(departed);
        let index = self.schedule.current_index();
        let late = self
            .schedule
            .average_journey(index)
            .is_some_and(|average| journey > average + margin);
        self.schedule.register_journey_time(journey);
        if late == self.in_delay_recovery {
            return false;
        }
        self.in_delay_recovery = late;
        true
    }

    /// Whether the timetable lets the convoy leave at `tick`.
    #[must_use]
    pub fn may_depart(&self, tick: u64) -> bool {
        self.in_delay_recovery || self.scheduled_departure_tick.is_none_or(|slot| tick >= slot)
    }

    // ===== CARGO =====

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.vehicles.iter().map(|v| u32::from(v.desc.capacity)).sum()
    }

    #[must_use]
    pub fn cargo(&self) -> u32 {
        self.vehicles.iter().map(|v| u32::from(v.cargo)).sum()
    }

    /// Load up to `available` units; returns how many were taken.
    pub fn load(&mut self, available: u32) -> u32 {
        let mut left = available;
        for vehicle in &mut self.vehicles {
            let room = u32::from(vehicle.desc.capacity.saturating_sub(vehicle.cargo));
            let take = room.min(left);
            vehicle.cargo += u16::try_from(take).unwrap_or(0);
            left -= take;
        }
        let loaded = available - left;
        if loaded > 0 {
            self.kin.mark_cargo_changed();
        }
        self.update_loading_level();
        loaded
    }

    /// Empty every vehicle; returns the units unloaded.
    pub fn unload_all(&mut self) -> u32 {
        let unloaded = self.cargo();
        for vehicle in &mut self.vehicles {
            vehicle.cargo = 0;
        }
        if unloaded > 0 {
            self.kin.mark_cargo_changed();
        }
        self.update_loading_level();
        unloaded
    }

    pub fn update_loading_level(&mut self) {
        let capacity = self.capacity();
        self.loading_level = if capacity == 0 {
            100
        } else {
            u8::try_from(self.cargo() * 100 / capacity).unwrap_or(100)
        };
    }

    // ===== QUERIES =====

    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.state.is_waiting()
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    #[must_use]
    pub const fn is_coupled(&self) -> bool {
        self.state.is_coupled()
    }

    #[must_use]
    pub fn in_depot(&self) -> bool {
        self.state == ConvoyState::Initial
    }

    /// Count a failed retry against the current tier.
    ///
    /// Returns the next tier's state once the current tier is used up; the
    /// caller switches to it. At the top tier the budget is only refilled.
    pub fn record_wait_failure(&mut self, elapsed: u32, ticks_per_month: u32) -> Option<ConvoyState> {
        let ConvoyState::Waiting { tier, remaining_ticks } = self.state else {
            return None;
        };
        let remaining = remaining_ticks.saturating_sub(elapsed.max(1));
        if remaining > 0 {
            self.state = ConvoyState::Waiting {
                tier,
                remaining_ticks: remaining,
            };
            return None;
        }
        if tier >= MAX_WAIT_TIER {
            self.state = ConvoyState::Waiting {
                tier,
                remaining_ticks: ticks_per_month,
            };
            return None;
        }
        Some(ConvoyState::Waiting {
            tier: tier + 1,
            remaining_ticks: ticks_per_month,
        })
    }

    /// Driven by the leader while coupled.
    pub fn set_akt_speed(&mut self, speed: u32) {
        self.kin.akt_speed = speed;
    }

    pub fn set_alte_richtung(&mut self, dir: Ribi) {
        self.alte_richtung = dir;
    }

    /// Residual value of all vehicles; one percent lost per month of age,
    /// never below a fifth of the price.
    #[must_use]
    pub fn calc_restwert(&self) -> i64 {
        let keep = 100 - i64::from(self.age_months.min(80));
        self.vehicles.iter().map(|v| v.desc.price * keep / 100).sum()
    }

    #[must_use]
    pub fn running_cost_per_tile(&self) -> i64 {
        self.vehicles.iter().map(|v| v.desc.running_cost).sum()
    }
}
