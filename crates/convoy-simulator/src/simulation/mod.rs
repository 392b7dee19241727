//! # Simulation
//!
//! The fixed-order step loop over all live convoys.
//!
//! ```text
//! step(tick)
//!   ├── apply queued commands (FIFO)
//!   ├── longblock judging pass over requests filed last tick
//!   ├── for each convoy in handle order
//!   │     ├── SELF_DESTRUCT → destroy
//!   │     ├── wait_lock > 0 → count down
//!   │     ├── refresh kinematics, dispatch on state
//!   │     └── relay position and speed to a coupled follower
//!   ├── lane change request evaluation
//!   └── month / year rollover
//! ```
//!
//! Longblock requests filed during a tick stay queued until the next tick's
//! pass, so a signal invalidated in between drops them without a grant.
//!
//! A convoy being stepped is moved out of the arena for the duration of its
//! step, so every other convoy can still be read and mutated through the
//! arena while its handle stays live.

mod commands;
mod coupling_ops;
mod drive;
mod lifecycle;
mod rail;
mod road;

use crate::arena::Arena;
use crate::command::{CommandOutcome, ConvoyCommand};
use crate::config::SimConfig;
use crate::convoy::{Convoy, ConvoySpec};
use crate::coupling::CouplingTable;
use crate::crossings::{CrossingSide, CrossingTable};
use crate::error::{Result, SimError};
use crate::events::{EventSink, SimEvent};
use crate::lanes::LaneCoordinator;
use crate::lines::LineRegistry;
use crate::longblock::LongblockJudge;
use crate::movement::MovementKind;
use crate::occupancy::TileOccupancy;
use crate::priority::PriorityArbiter;
use crate::reservation::ReservationTable;
use crate::router::Route;
use crate::state::ConvoyState;
use crate::stations::StationBoard;
use crate::world::{World, WorldContext};
use convoy_domain::{ConvoyId, Lane, MAX_MONTHS, STEPS_PER_TILE, Slope, TileCoord};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

/// Answer of a can-enter query for the next route tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Road convoys get the lane they may use
    Clear { lane: Option<Lane> },
    Blocked {
        restart_speed: u32,
        /// Ask again on the next tick instead of backing off
        retry_now: bool,
    },
}

impl Entry {
    pub(crate) const CLEAR: Self = Self::Clear { lane: None };

    pub(crate) const fn blocked(restart_speed: u32) -> Self {
        Self::Blocked {
            restart_speed,
            retry_now: false,
        }
    }
}

/// What one call to [`Simulation::step`] did
#[derive(Debug)]
pub struct TickReport {
    pub tick: u64,
    pub commands: Vec<CommandOutcome>,
    pub live_convoys: usize,
}

/// Breach of a structural invariant, found by [`Simulation::check_invariants`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("Tile {tile} claimed by both {first} and {second}")]
    DoubleClaim {
        tile: TileCoord,
        first: ConvoyId,
        second: ConvoyId,
    },

    #[error("Claims of {convoy} are not in route order")]
    UnorderedClaims { convoy: ConvoyId },

    #[error("{convoy} claims {tile} but the table says {holder:?}")]
    TableMismatch {
        tile: TileCoord,
        convoy: ConvoyId,
        holder: Option<ConvoyId>,
    },

    #[error("Table entry {tile} -> {holder} has no matching claim")]
    OrphanedClaim { tile: TileCoord, holder: ConvoyId },

    #[error("Lane cell {tile}/{lane:?} held by {convoy} is inconsistent")]
    LaneCell {
        tile: TileCoord,
        lane: Lane,
        convoy: ConvoyId,
    },

    #[error("Crossing {tile} hold of {convoy} is inconsistent")]
    CrossingHold { tile: TileCoord, convoy: ConvoyId },

    #[error("Coupling {leader} -> {follower} is not symmetric")]
    AsymmetricCoupling { leader: ConvoyId, follower: ConvoyId },
}

/// All convoys plus the shared resources they contend for.
#[derive(Debug)]
pub struct Simulation {
    pub(crate) config: SimConfig,
    pub(crate) tick: u64,
    pub(crate) month: u32,
    pub(crate) convoys: Arena<Convoy>,
    pub(crate) reservations: ReservationTable,
    pub(crate) lanes: LaneCoordinator,
    pub(crate) occupancy: TileOccupancy,
    pub(crate) priority: PriorityArbiter,
    pub(crate) longblock: LongblockJudge,
    pub(crate) couplings: CouplingTable,
    pub(crate) crossings: CrossingTable,
    pub(crate) stations: StationBoard,
    pub(crate) lines: LineRegistry,
    pub(crate) commands: VecDeque<(ConvoyId, ConvoyCommand)>,
    pub(crate) events: Vec<(u64, SimEvent)>,
}

impl Simulation {
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let lanes = LaneCoordinator::new(config.drive_left);
        Self {
            config,
            tick: 0,
            month: 0,
            convoys: Arena::new(),
            reservations: ReservationTable::new(),
            lanes,
            occupancy: TileOccupancy::new(),
            priority: PriorityArbiter::new(),
            longblock: LongblockJudge::new(),
            couplings: CouplingTable::new(),
            crossings: CrossingTable::new(),
            stations: StationBoard::new(),
            lines: LineRegistry::new(),
            commands: VecDeque::new(),
            events: Vec::new(),
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    #[must_use]
    pub const fn month(&self) -> u32 {
        self.month
    }

    pub fn convoy(&self, id: ConvoyId) -> Result<&Convoy> {
        self.convoys.resolve(id)
    }

    pub fn convoys(&self) -> impl Iterator<Item = (ConvoyId, &Convoy)> {
        self.convoys.iter()
    }

    #[must_use]
    pub fn convoy_ids(&self) -> Vec<ConvoyId> {
        self.convoys.ids()
    }

    #[must_use]
    pub fn reservation_holder(&self, tile: TileCoord) -> Option<ConvoyId> {
        self.reservations.holder(tile)
    }

    #[must_use]
    pub const fn reservations(&self) -> &ReservationTable {
        &self.reservations
    }

    #[must_use]
    pub const fn lanes(&self) -> &LaneCoordinator {
        &self.lanes
    }

    #[must_use]
    pub const fn crossings(&self) -> &CrossingTable {
        &self.crossings
    }

    #[must_use]
    pub const fn longblock(&self) -> &LongblockJudge {
        &self.longblock
    }

    #[must_use]
    pub const fn priority(&self) -> &PriorityArbiter {
        &self.priority
    }

    #[must_use]
    pub const fn stations(&self) -> &StationBoard {
        &self.stations
    }

    pub fn stations_mut(&mut self) -> &mut StationBoard {
        &mut self.stations
    }

    #[must_use]
    pub const fn lines(&self) -> &LineRegistry {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut LineRegistry {
        &mut self.lines
    }

    /// The convoy `id` is coupled with, leader or follower.
    #[must_use]
    pub fn coupling_convoi(&self, id: ConvoyId) -> Option<ConvoyId> {
        self.couplings.partner(id)
    }

    // =========================================================================
    // CONVOY REGISTRY
    // =========================================================================

    /// Put a new convoy into its home depot.
    pub fn add_convoy(&mut self, spec: ConvoySpec) -> Result<ConvoyId> {
        let Some(first) = spec.vehicles.first() else {
            return Err(SimError::InvalidConsist(format!("{} has no vehicles", spec.name)));
        };
        let waytype = first.waytype;
        if spec.vehicles.iter().any(|desc| desc.waytype != waytype) {
            return Err(SimError::InvalidConsist(format!(
                "{} mixes way types",
                spec.name
            )));
        }
        let name = spec.name.clone();
        let id = self.convoys.insert_with(|id| Convoy::new(id, spec));
        info!(convoy = %id, %name, waytype = waytype.as_str(), "Convoy created");
        Ok(id)
    }

    /// Queue a command for the start of the next tick.
    pub fn submit(&mut self, convoy: ConvoyId, command: ConvoyCommand) {
        debug!(convoy = %convoy, command = command.as_str(), "Command queued");
        self.commands.push_back((convoy, command));
    }

    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Place a depot convoy directly onto `path` with its front on
    /// `front_index`, claiming the tiles it stands on.
    ///
    /// Fails with `ReservationDenied` when a tile under the convoy belongs to
    /// somebody else; nothing changes in that case.
    pub fn deploy(
        &mut self,
        id: ConvoyId,
        path: Route,
        front_index: usize,
        ctx: &WorldContext<'_>,
    ) -> Result<()> {
        let mut cnv = self.convoys.take(id).ok_or(SimError::InvalidHandle(id))?;
        let result = self.deploy_convoy(&mut cnv, path, front_index, ctx);
        self.convoys.put_back(id, cnv);
        result
    }

    /// Drop pending longblock requests at a removed or changed signal.
    pub fn invalidate_signal(&mut self, tile: TileCoord) -> usize {
        let dropped = self.longblock.invalidate_signal(tile);
        if dropped > 0 {
            info!(signal = %tile, dropped, "Longblock requests invalidated");
        }
        dropped
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    pub fn drain_events(&mut self) -> Vec<(u64, SimEvent)> {
        std::mem::take(&mut self.events)
    }

    /// Hand every pending event to `sink`.
    pub fn flush_events(&mut self, sink: &mut dyn EventSink) {
        for (tick, event) in self.events.drain(..) {
            sink.record(tick, &event);
        }
    }

    pub(crate) fn emit(&mut self, event: SimEvent) {
        self.events.push((self.tick, event));
    }

    // =========================================================================
    // STEP LOOP
    // =========================================================================

    /// Advance the whole simulation by one tick.
    pub fn step(&mut self, ctx: &WorldContext<'_>) -> TickReport {
        let tick = self.tick;
        let commands = self.apply_commands(ctx);
        self.judge_longblocks(ctx);

        for id in self.convoys.ids() {
            self.step_convoy(id, ctx);
        }

        self.settle_lane_requests();

        self.tick += 1;
        if self.tick % u64::from(self.config.ticks_per_month.max(1)) == 0 {
            self.new_month();
        }

        TickReport {
            tick,
            commands,
            live_convoys: self.convoys.len(),
        }
    }

    fn step_convoy(&mut self, id: ConvoyId, ctx: &WorldContext<'_>) {
        let Some(mut cnv) = self.convoys.take(id) else {
            return;
        };
        if cnv.state == ConvoyState::SelfDestruct {
            self.destroy(cnv, ctx);
            return;
        }
        if cnv.wait_lock > 0 {
            cnv.wait_lock -= 1;
        } else {
            self.refresh_kinematics(&mut cnv, ctx);
            self.dispatch(&mut cnv, ctx);
        }
        self.relay_follower(&mut cnv, ctx);
        self.convoys.put_back(id, cnv);
    }

    fn dispatch(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        if MovementKind::for_waytype(cnv.waytype) == MovementKind::Road {
            self.maybe_yield(cnv);
        }
        match cnv.state {
            ConvoyState::Initial
            | ConvoyState::EditSchedule
            | ConvoyState::NoRoute
            | ConvoyState::Coupled
            | ConvoyState::CoupledLoading
            | ConvoyState::SelfDestruct => {}
            ConvoyState::Routing => self.step_routing(cnv, ctx),
            ConvoyState::WaitingForLeavingDepot => self.step_leave_depot(cnv, ctx),
            ConvoyState::Driving | ConvoyState::LeavingDepot => self.step_driving(cnv, ctx),
            ConvoyState::EnteringDepot => self.step_enter_depot(cnv, ctx),
            ConvoyState::Waiting { .. } => self.step_waiting(cnv, ctx),
            ConvoyState::CanStart { .. } => {
                self.transition(cnv, ConvoyState::Driving);
                cnv.kin.akt_speed = cnv.restart_speed;
                self.step_driving(cnv, ctx);
            }
            ConvoyState::Loading => self.step_loading(cnv, ctx),
        }
    }

    /// Switch state, recording the change.
    pub(crate) fn transition(&mut self, cnv: &mut Convoy, to: ConvoyState) {
        if let Some(from) = cnv.set_state(to) {
            debug!(convoy = %cnv.id, %from, %to, "State change");
            self.emit(SimEvent::StateChanged {
                convoy: cnv.id,
                from,
                to,
            });
        }
    }

    fn refresh_kinematics(&self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        if cnv.kin.is_clean() {
            return;
        }
        let behind = cnv.route_index.checked_sub(1).and_then(|i| cnv.route.get(i));
        let slope = match (behind, cnv.front_tile()) {
            (Some(from), Some(to)) => ctx.world.slope(from, to),
            _ => Slope::Flat,
        };
        let partner_top_speed = self
            .couplings
            .partner(cnv.id)
            .and_then(|partner| self.convoys.get(partner))
            .and_then(|partner| partner.vehicles.iter().map(|v| v.desc.top_speed_kmh).min());
        cnv.kin
            .refresh(&cnv.vehicles, ctx.world, cnv.waytype, slope, partner_top_speed);
    }

    fn new_month(&mut self) {
        self.month += 1;
        let new_year = self.month % u32::try_from(MAX_MONTHS).unwrap_or(12) == 0;
        for id in self.convoys.ids() {
            if let Some(cnv) = self.convoys.get_mut(id) {
                cnv.finance.new_month();
                cnv.age_months += 1;
                if new_year {
                    cnv.finance.new_year();
                }
            }
        }
        info!(month = self.month, tick = self.tick, "New month");
        self.emit(SimEvent::NewMonth { month: self.month });
        if new_year {
            let year = self.month / u32::try_from(MAX_MONTHS).unwrap_or(12);
            info!(year, "New year");
            self.emit(SimEvent::NewYear { year });
        }
    }

    /// Retry delay for a waiting convoy; doubles per tier, shorter when the
    /// blocker is moving.
    pub(crate) fn backoff_ticks(&self, tier: u8, restart_speed: u32) -> u32 {
        let base = self.config.backoff_base_ticks;
        if restart_speed > 0 {
            return (base / 2).max(1);
        }
        base.saturating_mul(1 << tier.min(crate::state::MAX_WAIT_TIER))
    }

    // =========================================================================
    // INVARIANTS
    // =========================================================================

    /// Scan reservations, lane cells and coupling links for structural
    /// breaches. An empty result means the state is consistent.
    #[must_use]
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut claimed: BTreeMap<TileCoord, ConvoyId> = BTreeMap::new();

        for (id, cnv) in self.convoys.iter() {
            if !cnv.reservation.is_ordered() {
                violations.push(InvariantViolation::UnorderedClaims { convoy: id });
            }
            for claim in cnv.reservation.claims() {
                if let Some(first) = claimed.insert(claim.tile, id) {
                    if first != id {
                        violations.push(InvariantViolation::DoubleClaim {
                            tile: claim.tile,
                            first,
                            second: id,
                        });
                    }
                }
                let holder = self.reservations.holder(claim.tile);
                if holder != Some(id) {
                    violations.push(InvariantViolation::TableMismatch {
                        tile: claim.tile,
                        convoy: id,
                        holder,
                    });
                }
            }
        }
        for (tile, holder) in self.reservations.iter() {
            if claimed.get(tile) != Some(holder) {
                violations.push(InvariantViolation::OrphanedClaim {
                    tile: *tile,
                    holder: *holder,
                });
            }
        }

        for ((tile, lane), cell) in self.lanes.cells() {
            if !self.convoys.is_live(cell.convoy)
                || !self.lanes.cells_of(cell.convoy).contains(&(*tile, *lane))
            {
                violations.push(InvariantViolation::LaneCell {
                    tile: *tile,
                    lane: *lane,
                    convoy: cell.convoy,
                });
            }
        }
        for id in self.convoys.ids() {
            for (tile, lane) in self.lanes.cells_of(id) {
                if self.lanes.occupant(*tile, *lane).map(|c| c.convoy) != Some(id) {
                    violations.push(InvariantViolation::LaneCell {
                        tile: *tile,
                        lane: *lane,
                        convoy: id,
                    });
                }
            }
        }

        for (id, cnv) in self.convoys.iter() {
            for tile in &cnv.held_crossings {
                if !self.crossings.holders(*tile).contains(&id) {
                    violations.push(InvariantViolation::CrossingHold { tile: *tile, convoy: id });
                }
            }
        }
        for (tile, side, holders) in self.crossings.iter() {
            for holder in holders {
                let held = self.convoys.get(*holder).is_some_and(|cnv| {
                    cnv.held_crossings.contains(&tile) && CrossingSide::of(cnv.waytype) == Some(side)
                });
                if !held {
                    violations.push(InvariantViolation::CrossingHold {
                        tile,
                        convoy: *holder,
                    });
                }
            }
        }

        for (leader, follower) in self.couplings.links() {
            let symmetric = self.couplings.partner(leader) == Some(follower)
                && self.couplings.partner(follower) == Some(leader)
                && self.convoys.get(follower).is_some_and(|f| f.coupling.is_some());
            if !symmetric {
                violations.push(InvariantViolation::AsymmetricCoupling { leader, follower });
            }
        }
        for (id, cnv) in self.convoys.iter() {
            if cnv.coupling.is_some() && self.couplings.leader_of(id).is_none() {
                violations.push(InvariantViolation::AsymmetricCoupling {
                    leader: id,
                    follower: id,
                });
            }
        }
        violations
    }

    // =========================================================================
    // RESTORE SUPPORT
    // =========================================================================

    /// Rebuild the global reservation, lane and occupancy indexes from the
    /// per-convoy state.
    pub(crate) fn rebuild_indexes(&mut self, world: &dyn World) -> Result<()> {
        self.reservations = ReservationTable::new();
        self.occupancy = TileOccupancy::new();
        self.crossings = CrossingTable::new();
        for id in self.convoys.ids() {
            let Some(mut cnv) = self.convoys.take(id) else {
                continue;
            };
            let mut published = cnv.reservation.republish(&mut self.reservations, id);
            if let Some(side) = CrossingSide::of(cnv.waytype) {
                for tile in &cnv.held_crossings {
                    published &= self.crossings.try_reserve(*tile, id, side).is_ok();
                }
            }
            cnv.kin.mark_roster_changed();
            if !cnv.in_depot() {
                self.publish_position(&mut cnv, world);
            }
            self.convoys.put_back(id, cnv);
            if !published {
                return Err(SimError::Serialization(format!(
                    "conflicting reservation claims for {id}"
                )));
            }
        }
        Ok(())
    }
}

/// Steps per tile as a distance.
pub(crate) const STEPS: u64 = STEPS_PER_TILE as u64;

/// Front steps into the final route tile at which a convoy has arrived.
pub(crate) const ARRIVAL_STEPS: u32 = STEPS_PER_TILE / 2;

pub(crate) fn signed(dist: u64) -> i64 {
    i64::try_from(dist).unwrap_or(i64::MAX)
}
