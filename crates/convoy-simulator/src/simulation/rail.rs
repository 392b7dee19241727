//! Signal evaluation for rail-like convoys.
//!
//! Entering a tile the convoy already holds is always allowed. Otherwise the
//! signal standing on the tile (if it applies in our direction) decides how
//! the block behind it is claimed.

use super::{Entry, Simulation};
use crate::config::SimConfig;
use crate::convoy::Convoy;
use crate::error::SimError;
use crate::events::SimEvent;
use crate::longblock::{LongblockRequest, LongblockTicket, Verdict};
use crate::reservation::{
    ReservationTable, ReserveMode, ReserveOutcome, ReserveRequest, block_reserver, scan_block,
};
use crate::router::RouteConstraints;
use crate::world::{World, WorldContext};
use convoy_domain::{ConvoyId, SignalKind, TileCoord};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl Simulation {
    pub(crate) fn rail_can_enter(
        &mut self,
        cnv: &mut Convoy,
        next: usize,
        tile: TileCoord,
        ctx: &WorldContext<'_>,
    ) -> Entry {
        if cnv.reservation.holds(tile) && cnv.reservation.next_reservation_index() >= next {
            if cnv.longblock.is_some_and(|t| t.signal_index == next) {
                cnv.longblock = None;
            }
            return Entry::CLEAR;
        }
        let dir = cnv.route.direction_into(next);
        let signal = ctx
            .world
            .signal_at(tile, cnv.waytype)
            .filter(|s| s.applies_to(dir));
        match signal.map(|s| s.kind) {
            None | Some(SignalKind::Block) => self.reserve_ahead(cnv, next, false, ctx),
            Some(SignalKind::PreSignal) => self.presignal(cnv, next, ctx),
            Some(SignalKind::Priority) => self.priority_signal(cnv, next, tile, ctx),
            Some(SignalKind::LongBlock) => self.longblock_signal(cnv, next, tile, ctx),
            Some(SignalKind::Choose) => self.choose_signal(cnv, next, tile, ctx),
        }
    }

    /// Claim from `next` through the configured number of signals, or to the
    /// route end.
    fn reserve_ahead(
        &mut self,
        cnv: &mut Convoy,
        next: usize,
        until_route_end: bool,
        ctx: &WorldContext<'_>,
    ) -> Entry {
        let request = ReserveRequest {
            world: ctx.world,
            waytype: cnv.waytype,
            route: &cnv.route,
            start_index: next,
            signal_count: self.config.reservation_signal_count,
            max_lookahead: self.config.max_lookahead_tiles,
            until_route_end,
        };
        let outcome = block_reserver(
            &mut self.reservations,
            cnv.id,
            &mut cnv.reservation,
            &request,
            ReserveMode::Reserve,
        );
        self.settle_reservation(cnv, next, &outcome)
    }

    fn settle_reservation(&self, cnv: &mut Convoy, next: usize, outcome: &ReserveOutcome) -> Entry {
        if outcome.covers(next) {
            cnv.next_stop_index = outcome
                .claimed_through
                .map_or(next, |through| through + 1)
                .min(cnv.route.last_index());
            return Entry::CLEAR;
        }
        cnv.next_stop_index = next;
        let restart_speed = outcome
            .blocker
            .and_then(|b| self.convoys.get(b))
            .map_or(0, |b| b.kin.akt_speed);
        debug!(
            convoy = %cnv.id,
            error = %SimError::ReservationDenied { convoy: cnv.id, index: next },
            "Entry refused"
        );
        Entry::blocked(restart_speed)
    }

    fn blocker_speed(&self, blocker: Option<(usize, ConvoyId)>) -> u32 {
        blocker
            .and_then(|(_, b)| self.convoys.get(b))
            .map_or(0, |b| b.kin.akt_speed)
    }

    // =========================================================================
    // PRE-SIGNAL
    // =========================================================================

    /// Also requires the block after the next one to be free.
    fn presignal(&mut self, cnv: &mut Convoy, next: usize, ctx: &WorldContext<'_>) -> Entry {
        let lookahead = self.config.max_lookahead_tiles;
        let first = scan_block(
            &self.reservations,
            ctx.world,
            cnv.waytype,
            cnv.id,
            &cnv.route,
            next,
            next + lookahead,
        );
        if first.blocker.is_none() {
            if let Some(signal) = first.next_signal {
                let second = scan_block(
                    &self.reservations,
                    ctx.world,
                    cnv.waytype,
                    cnv.id,
                    &cnv.route,
                    signal,
                    signal + lookahead,
                );
                if second.blocker.is_some() {
                    debug!(convoy = %cnv.id, exit = signal, "Pre-signal: exit block occupied");
                    cnv.next_stop_index = next;
                    return Entry::blocked(self.blocker_speed(second.blocker));
                }
            }
        }
        self.reserve_ahead(cnv, next, false, ctx)
    }

    // =========================================================================
    // PRIORITY SIGNAL
    // =========================================================================

    /// Clear only for the earliest arrival among convoys wanting
    /// overlapping tiles; ties go to the lower handle.
    fn priority_signal(
        &mut self,
        cnv: &mut Convoy,
        next: usize,
        tile: TileCoord,
        ctx: &WorldContext<'_>,
    ) -> Entry {
        let scan = scan_block(
            &self.reservations,
            ctx.world,
            cnv.waytype,
            cnv.id,
            &cnv.route,
            next,
            next + self.config.max_lookahead_tiles,
        );
        let tiles: BTreeSet<TileCoord> = cnv
            .route
            .tiles
            .get(scan.start..scan.end)
            .map(|block| block.iter().copied().collect())
            .unwrap_or_default();
        self.priority.register(cnv.id, tile, tiles, self.tick);

        if scan.blocker.is_some() || !self.priority.has_precedence(cnv.id) {
            cnv.next_stop_index = next;
            return Entry::blocked(self.blocker_speed(scan.blocker));
        }
        let entry = self.reserve_ahead(cnv, next, false, ctx);
        if matches!(entry, Entry::Clear { .. }) {
            self.priority.withdraw(cnv.id);
        }
        entry
    }

    // =========================================================================
    // LONGBLOCK SIGNAL
    // =========================================================================

    fn longblock_signal(
        &mut self,
        cnv: &mut Convoy,
        next: usize,
        tile: TileCoord,
        ctx: &WorldContext<'_>,
    ) -> Entry {
        let ticket = cnv
            .longblock
            .filter(|t| t.signal_index == next && t.signal_tile == tile);
        match ticket.map(|t| t.verdict) {
            Some(Verdict::Granted) => {
                cnv.longblock = None;
                if cnv.reservation.holds(tile) {
                    Entry::CLEAR
                } else {
                    self.reserve_ahead(cnv, next, false, ctx)
                }
            }
            Some(Verdict::Pending) => Entry::Blocked {
                restart_speed: 0,
                retry_now: true,
            },
            Some(Verdict::Denied | Verdict::TimedOut | Verdict::Dropped) => {
                self.file_longblock(cnv, next, tile);
                Entry::blocked(0)
            }
            None => {
                self.file_longblock(cnv, next, tile);
                Entry::Blocked {
                    restart_speed: 0,
                    retry_now: true,
                }
            }
        }
    }

    fn file_longblock(&mut self, cnv: &mut Convoy, next: usize, tile: TileCoord) {
        self.longblock.file(LongblockRequest {
            convoy: cnv.id,
            signal_tile: tile,
            signal_index: next,
            next_block: next,
            filed_tick: self.tick,
            valid: true,
        });
        cnv.longblock = Some(LongblockTicket {
            signal_tile: tile,
            signal_index: next,
            verdict: Verdict::Pending,
        });
        cnv.next_stop_index = next;
    }

    /// The once-per-tick judging pass over pending longblock requests.
    pub(crate) fn judge_longblocks(&mut self, ctx: &WorldContext<'_>) {
        if self.longblock.is_empty() {
            return;
        }
        let tick = self.tick;
        let world = ctx.world;
        let Self {
            longblock,
            convoys,
            reservations,
            config,
            ..
        } = self;
        let results = longblock.run_pass(
            tick,
            config.longblock_timeout_ticks,
            |request| match convoys.get_mut(request.convoy) {
                Some(cnv) => judge_request(cnv, request, reservations, world, config),
                None => Verdict::Dropped,
            },
        );

        for (request, verdict) in results {
            let updated = self
                .convoys
                .get_mut(request.convoy)
                .and_then(|cnv| cnv.longblock.as_mut())
                .filter(|t| t.signal_index == request.signal_index && t.signal_tile == request.signal_tile)
                .map(|ticket| ticket.verdict = verdict)
                .is_some();
            if !updated {
                continue;
            }
            match verdict {
                Verdict::TimedOut => {
                    warn!(
                        error = %SimError::SignalTimeout { convoy: request.convoy, signal: request.signal_tile },
                        "Longblock request treated as denied"
                    );
                    self.emit(SimEvent::LongblockTimedOut {
                        convoy: request.convoy,
                        signal: request.signal_tile,
                    });
                }
                Verdict::Granted => {
                    debug!(convoy = %request.convoy, signal = %request.signal_tile, "Longblock granted");
                }
                _ => {
                    debug!(convoy = %request.convoy, signal = %request.signal_tile, ?verdict, "Longblock not granted");
                }
            }
        }
    }

    // =========================================================================
    // CHOOSE SIGNAL
    // =========================================================================

    /// Reserve to the route end; when the planned path is blocked, look for
    /// another path to the goal or to another tile of the same station and
    /// splice it into the route.
    fn choose_signal(
        &mut self,
        cnv: &mut Convoy,
        next: usize,
        tile: TileCoord,
        ctx: &WorldContext<'_>,
    ) -> Entry {
        let scan = scan_block(
            &self.reservations,
            ctx.world,
            cnv.waytype,
            cnv.id,
            &cnv.route,
            next,
            cnv.route.len(),
        );
        if scan.blocker.is_none() {
            return self.reserve_ahead(cnv, next, true, ctx);
        }
        let Some(goal) = cnv.route.last() else {
            return Entry::blocked(0);
        };
        let mut goals = vec![goal];
        if let Some(station) = ctx.world.station_at(goal) {
            goals.extend(
                ctx.world
                    .station_tiles(station)
                    .into_iter()
                    .filter(|t| *t != goal),
            );
        }

        let mut constraints =
            RouteConstraints::new(cnv.waytype, cnv.kin.cached().min_top_speed_kmh);
        constraints.avoid = self
            .reservations
            .iter()
            .filter(|(_, holder)| **holder != cnv.id)
            .map(|(t, _)| *t)
            .collect();
        if let Some(front) = cnv.front_tile() {
            constraints.avoid.insert(front);
        }

        for candidate in goals {
            let Some(path) = ctx
                .router
                .compute_route(ctx.world, tile, candidate, &constraints)
            else {
                continue;
            };
            if path
                .tiles
                .iter()
                .any(|t| !self.reservations.is_free_for(*t, cnv.id))
            {
                continue;
            }
            cnv.route.tiles.truncate(next);
            cnv.route.tiles.extend(path.tiles);
            cnv.route_epoch += 1;
            self.calc_crossing_reservation(cnv, ctx.world);
            info!(convoy = %cnv.id, signal = %tile, goal = %candidate, "Choose signal took another path");
            return self.reserve_ahead(cnv, next, true, ctx);
        }
        cnv.next_stop_index = next;
        Entry::blocked(self.blocker_speed(scan.blocker))
    }
}

/// Decide one longblock request: grant only if every block across the
/// configured span is free, then claim them all.
fn judge_request(
    cnv: &mut Convoy,
    request: &LongblockRequest,
    table: &mut ReservationTable,
    world: &dyn World,
    config: &SimConfig,
) -> Verdict {
    if cnv.route.get(request.signal_index) != Some(request.signal_tile)
        || cnv.route_index >= request.signal_index
    {
        return Verdict::Dropped;
    }
    let still_longblock = world
        .signal_at(request.signal_tile, cnv.waytype)
        .is_some_and(|s| s.kind == SignalKind::LongBlock);
    if !still_longblock {
        return Verdict::Dropped;
    }

    let span = config.longblock_span_signals.max(1);
    let limit = request.next_block + config.max_lookahead_tiles;
    let mut cursor = request.next_block;
    for _ in 0..span {
        let scan = scan_block(table, world, cnv.waytype, cnv.id, &cnv.route, cursor, limit);
        if scan.blocker.is_some() {
            return Verdict::Denied;
        }
        match scan.next_signal {
            Some(signal) => cursor = signal,
            None => break,
        }
    }

    let reserve = ReserveRequest {
        world,
        waytype: cnv.waytype,
        route: &cnv.route,
        start_index: request.next_block,
        signal_count: span,
        max_lookahead: config.max_lookahead_tiles,
        until_route_end: false,
    };
    let outcome = block_reserver(table, cnv.id, &mut cnv.reservation, &reserve, ReserveMode::Reserve);
    cnv.next_stop_index = outcome
        .claimed_through
        .map_or(request.signal_index, |through| through + 1)
        .min(cnv.route.last_index());
    if outcome.covers(request.signal_index) {
        Verdict::Granted
    } else {
        Verdict::Denied
    }
}
