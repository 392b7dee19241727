//! Coupling: a follower closes up behind a leader, then rides along.
//!
//! ```text
//! couple_convoi ──► approach (creep up to the leader's rear)
//!                     │ deadline missed / leader moved → abandon
//!                     ▼
//!                   coupling_done ──► mirror leader position and speed
//!                     │
//!                     ▼
//!                   uncouple_convoi / destruction of either side
//! ```
//!
//! The follower never queries signals while coupled. Once coupled its route
//! is its own body followed by the leader's route ahead of the leader's
//! rear, and its front is kept at a fixed step offset from that rear.

use super::{STEPS, Simulation, signed};
use crate::convoy::{Convoy, CouplingState};
use crate::coupling::CouplingRole;
use crate::error::{Result, SimError};
use crate::events::SimEvent;
use crate::router::Route;
use crate::state::ConvoyState;
use crate::world::{World, WorldContext};
use convoy_domain::{ConvoyId, TileCoord};
use tracing::{debug, info, warn};

/// Where the follower has to put its front to touch the leader's rear
struct CouplingTarget {
    index: usize,
    steps: u32,
}

impl Simulation {
    // =========================================================================
    // COUPLE
    // =========================================================================

    /// Link `follower` behind `leader`.
    ///
    /// Rejections leave both convoys untouched.
    pub(crate) fn couple_convoi(
        &mut self,
        follower: ConvoyId,
        leader: ConvoyId,
        ctx: &WorldContext<'_>,
    ) -> Result<()> {
        if !self.convoys.is_live(leader) {
            return Err(SimError::InvalidCommand {
                convoy: follower,
                reason: format!("leader {leader} no longer exists"),
            });
        }
        let checked = match (self.convoys.get(follower), self.convoys.get(leader)) {
            (Some(f), Some(l)) => self.can_start_coupling(f, l),
            _ => return Err(SimError::InvalidHandle(follower)),
        };
        let target = match checked {
            Ok(target) => target,
            Err(reason) => {
                warn!(%follower, %leader, %reason, "Coupling rejected");
                self.emit(SimEvent::CouplingRejected {
                    follower,
                    leader,
                    reason: reason.clone(),
                });
                return Err(SimError::CouplingMismatch {
                    follower,
                    leader,
                    reason,
                });
            }
        };

        let (leader_epoch, leader_departure) = self
            .convoys
            .get(leader)
            .map_or((0, None), |l| (l.route_epoch, l.scheduled_departure_tick));
        let mut f = self
            .convoys
            .take(follower)
            .ok_or(SimError::InvalidHandle(follower))?;

        // The gap up to the leader's rear, minus what the leader still holds
        let gap: Vec<(usize, TileCoord)> = (f.route_index + 1..target.index)
            .filter_map(|i| f.route.get(i).map(|tile| (i, tile)))
            .filter(|(_, tile)| self.reservations.holder(*tile) != Some(leader))
            .collect();
        let claimed = f
            .reservation
            .claim_range(&mut self.reservations, ctx.world, f.waytype, f.id, &gap);
        if !claimed {
            self.convoys.put_back(follower, f);
            let reason = "the gap to the leader cannot be reserved".to_string();
            warn!(%follower, %leader, %reason, "Coupling rejected");
            self.emit(SimEvent::CouplingRejected {
                follower,
                leader,
                reason: reason.clone(),
            });
            return Err(SimError::CouplingMismatch {
                follower,
                leader,
                reason,
            });
        }
        self.couplings.link(leader, follower);

        // the leader waits past its own departure slot at most this long
        let tolerance = f
            .schedule
            .current_entry()
            .and_then(|entry| entry.coupling_delay_tolerance_ticks)
            .map_or(self.config.default_coupling_delay_tolerance_ticks, u64::from);
        let waits_from = leader_departure.map_or(self.tick, |slot| slot.max(self.tick));
        f.coupling = Some(CouplingState {
            next_coupling_index: target.index,
            next_coupling_steps: target.steps,
            coupling_done: false,
            scheduled_coupling_delay_tolerance: tolerance,
            deadline_tick: waits_from + tolerance,
            offset_steps: 0,
            leader_route_epoch: leader_epoch,
        });
        self.drop_signal_requests(&mut f);
        f.crossing_reservation_index.clear();
        f.wait_lock = 0;
        f.kin.mark_partner_changed();
        self.transition(&mut f, ConvoyState::Coupled);
        self.convoys.put_back(follower, f);
        if let Some(l) = self.convoys.get_mut(leader) {
            l.kin.mark_partner_changed();
        }

        info!(%leader, %follower, index = target.index, "Coupling started");
        self.emit(SimEvent::Coupled { leader, follower });
        Ok(())
    }

    /// Whether `f` may start closing up behind `l`; yields the spot its front
    /// has to reach.
    fn can_start_coupling(&self, f: &Convoy, l: &Convoy) -> std::result::Result<CouplingTarget, String> {
        if f.id == l.id {
            return Err("cannot couple a convoy to itself".into());
        }
        if self.couplings.partner(f.id).is_some() || self.couplings.partner(l.id).is_some() {
            return Err("already coupled".into());
        }
        if f.waytype != l.waytype || !f.waytype.is_rail_like() {
            return Err(format!(
                "way types {} and {} cannot couple",
                f.waytype.as_str(),
                l.waytype.as_str()
            ));
        }
        let ready = |state: ConvoyState| {
            matches!(
                state,
                ConvoyState::Driving
                    | ConvoyState::Waiting { .. }
                    | ConvoyState::CanStart { .. }
                    | ConvoyState::Loading
            )
        };
        if !ready(f.state) || !ready(l.state) {
            return Err(format!("states {} and {} do not allow coupling", f.state, l.state));
        }
        let aligned = f
            .schedule
            .current_target()
            .is_some_and(|target| l.schedule.contains(target));
        if !aligned {
            return Err("follower target is not on the leader's schedule".into());
        }

        let rear_dist = l.front_dist().saturating_sub(u64::from(l.length_steps()));
        let rear_steps = u32::try_from(rear_dist % STEPS).unwrap_or(0);
        let Some(rear_tile) = l.route.get(l.rear_index()) else {
            return Err("leader has no position".into());
        };
        let tolerance = self.config.coupling_distance_tolerance_tiles;
        let Some(index) = f
            .route
            .position_of(rear_tile, f.route_index)
            .filter(|j| *j <= f.route_index + self.config.max_lookahead_tiles)
        else {
            return Err("leader is not ahead on the follower's route".into());
        };
        let gap = index - f.route_index;
        if gap > tolerance {
            return Err(format!("leader is {gap} tiles ahead, tolerance is {tolerance}"));
        }
        let target_dist = index as u64 * STEPS + u64::from(rear_steps);
        if target_dist < f.front_dist() {
            return Err("convoys overlap".into());
        }
        let blocked = (f.route_index + 1..index)
            .filter_map(|i| f.route.get(i))
            .any(|tile| {
                self.reservations
                    .holder(tile)
                    .is_some_and(|holder| holder != f.id && holder != l.id)
            });
        if blocked {
            return Err("a third convoy stands between them".into());
        }
        Ok(CouplingTarget {
            index,
            steps: rear_steps,
        })
    }

    // =========================================================================
    // RELAY
    // =========================================================================

    /// Carry a coupled follower along after the leader stepped.
    pub(crate) fn relay_follower(&mut self, leader: &mut Convoy, ctx: &WorldContext<'_>) {
        let Some(fid) = self.couplings.follower_of(leader.id) else {
            return;
        };
        let Some(mut f) = self.convoys.take(fid) else {
            self.couplings.unlink(leader.id);
            return;
        };
        match f.coupling {
            Some(cs) if cs.coupling_done => {
                self.mirror_leader(leader, &mut f, ctx.world);
                self.sync_follower_state(leader, &mut f, ctx.world);
            }
            Some(cs) => {
                if self.can_continue_coupling(leader, &f, &cs) {
                    self.approach_leader(leader, &mut f, ctx.world);
                } else {
                    self.sever(leader, &mut f, ctx.world);
                    warn!(leader = %leader.id, follower = %fid, "Coupling abandoned");
                    self.emit(SimEvent::CouplingAbandoned {
                        leader: leader.id,
                        follower: fid,
                    });
                }
            }
            None => {
                self.couplings.unlink(fid);
            }
        }
        self.convoys.put_back(fid, f);
    }

    fn can_continue_coupling(&self, leader: &Convoy, f: &Convoy, cs: &CouplingState) -> bool {
        if self.tick > cs.deadline_tick || leader.state == ConvoyState::SelfDestruct {
            return false;
        }
        leader.route.get(leader.rear_index()) == f.route.get(cs.next_coupling_index)
    }

    /// Creep towards the leader's rear; link up once it is reached.
    fn approach_leader(&mut self, leader: &Convoy, f: &mut Convoy, world: &dyn World) {
        let Some(cs) = f.coupling else {
            return;
        };
        let target = cs.next_coupling_index as u64 * STEPS + u64::from(cs.next_coupling_steps);
        let before = f.route_index;
        let front = f.front_dist();
        if front < target {
            let step = u64::from(self.config.coupling_approach_steps.max(1));
            f.set_front_dist((front + step).min(target));
            f.kin.akt_speed = self.config.coupling_approach_steps;
        }
        self.count_tiles(f, before);
        f.place_vehicles();
        f.reservation.release_passed(&mut self.reservations, f.id, f.rear_index());

        if f.front_dist() >= target {
            f.kin.akt_speed = leader.kin.akt_speed;
            if let Some(cs) = f.coupling.as_mut() {
                cs.coupling_done = true;
            }
            self.rebase_follower(leader, f, world);
            info!(leader = %leader.id, follower = %f.id, "Coupling completed");
            self.emit(SimEvent::CouplingCompleted {
                leader: leader.id,
                follower: f.id,
            });
        }
    }

    /// Keep the follower's front at its offset behind the leader's rear.
    fn mirror_leader(&mut self, leader: &Convoy, f: &mut Convoy, world: &dyn World) {
        if f.coupling.is_some_and(|cs| cs.leader_route_epoch != leader.route_epoch) {
            self.rebase_follower(leader, f, world);
        }
        let Some(cs) = f.coupling else {
            return;
        };
        let rear = signed(leader.front_dist().saturating_sub(u64::from(leader.length_steps())));
        let target = u64::try_from((rear + cs.offset_steps).max(0)).unwrap_or(0);
        let before = f.route_index;
        if target > f.front_dist() {
            f.set_front_dist(target);
        }
        self.count_tiles(f, before);
        f.set_akt_speed(leader.kin.akt_speed);
        f.set_alte_richtung(leader.alte_richtung);
        f.place_vehicles();
        f.reservation.release_passed(&mut self.reservations, f.id, f.rear_index());
        let rear = f.rear_index();
        self.release_passed_crossings(f, rear);
    }

    fn count_tiles(&self, f: &mut Convoy, before: usize) {
        let hopped = f.route_index.saturating_sub(before);
        if hopped > 0 {
            f.kin.mark_moved();
            f.total_distance_traveled += hopped as u64;
            f.distance_since_last_stop += u32::try_from(hopped).unwrap_or(u32::MAX);
        }
    }

    /// Rebuild the follower's route on top of the leader's and re-issue its
    /// claims for tiles the leader does not hold.
    fn rebase_follower(&mut self, leader: &Convoy, f: &mut Convoy, world: &dyn World) {
        let rear_dist = leader.front_dist().saturating_sub(u64::from(leader.length_steps()));
        let j = usize::try_from(rear_dist / STEPS)
            .unwrap_or(0)
            .min(leader.route.last_index());
        let f_rear = f.rear_index();
        let mut tiles: Vec<TileCoord> = f
            .route
            .tiles
            .get(f_rear..f.route_index)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        let k = tiles.len();
        tiles.extend(leader.route.tiles.iter().skip(j).copied());
        f.route = Route::new(tiles);
        f.route_epoch += 1;
        f.set_front_dist(k as u64 * STEPS + rear_dist % STEPS);
        f.next_stop_index = f.route.last_index();
        f.place_vehicles();

        self.reclaim_follower_body(f, world);

        let offset = signed(f.front_dist()) - signed(rear_dist);
        if let Some(cs) = f.coupling.as_mut() {
            cs.offset_steps = offset;
            cs.leader_route_epoch = leader.route_epoch;
        }
        debug!(leader = %leader.id, follower = %f.id, offset, "Follower rebased");
    }

    /// Drop the follower's claims and claim its body tiles again, leaving out
    /// tiles somebody else (normally the leader) still holds.
    fn reclaim_follower_body(&mut self, f: &mut Convoy, world: &dyn World) {
        f.reservation.release_all(&mut self.reservations, f.id);
        let free: Vec<(usize, TileCoord)> = f
            .body()
            .into_iter()
            .filter(|(_, tile)| self.reservations.is_free_for(*tile, f.id))
            .collect();
        if !f
            .reservation
            .claim_range(&mut self.reservations, world, f.waytype, f.id, &free)
        {
            warn!(follower = %f.id, tiles = free.len(), "Body tiles could not be claimed again");
        }
    }

    /// Follow the leader into and out of loading.
    fn sync_follower_state(&mut self, leader: &Convoy, f: &mut Convoy, world: &dyn World) {
        if leader.is_loading() {
            let station = leader.front_tile().and_then(|tile| world.station_at(tile));
            if f.state != ConvoyState::CoupledLoading {
                if let Some(tile) = f.front_tile() {
                    self.book_stop(f, tile, station);
                }
                self.transition(f, ConvoyState::CoupledLoading);
            }
            if let Some(station) = station.filter(|_| !f.no_load) {
                let room = f.capacity().saturating_sub(f.cargo());
                let taken = self.stations.take(station, room);
                if taken > 0 {
                    f.load(taken);
                }
            }
        } else if f.state == ConvoyState::CoupledLoading {
            self.transition(f, ConvoyState::Coupled);
        }
    }

    // =========================================================================
    // UNCOUPLE
    // =========================================================================

    pub(crate) fn uncouple_convoi(&mut self, id: ConvoyId, ctx: &WorldContext<'_>) -> Result<()> {
        if self.couplings.partner(id).is_none() {
            return Err(SimError::InvalidCommand {
                convoy: id,
                reason: "not coupled".into(),
            });
        }
        let mut cnv = self.convoys.take(id).ok_or(SimError::InvalidHandle(id))?;
        self.cascade_uncouple(&mut cnv, ctx);
        self.convoys.put_back(id, cnv);
        Ok(())
    }

    /// Sever whatever link `cnv` takes part in.
    pub(crate) fn cascade_uncouple(&mut self, cnv: &mut Convoy, ctx: &WorldContext<'_>) {
        let Some(role) = self.couplings.role(cnv.id) else {
            return;
        };
        let (leader, follower) = match role {
            CouplingRole::Leader { follower } => {
                let Some(mut f) = self.convoys.take(follower) else {
                    self.couplings.unlink(cnv.id);
                    return;
                };
                self.sever(cnv, &mut f, ctx.world);
                self.convoys.put_back(follower, f);
                (cnv.id, follower)
            }
            CouplingRole::Follower { leader } => {
                let Some(mut l) = self.convoys.take(leader) else {
                    self.couplings.unlink(cnv.id);
                    cnv.coupling = None;
                    return;
                };
                self.sever(&mut l, cnv, ctx.world);
                self.convoys.put_back(leader, l);
                (leader, cnv.id)
            }
        };
        info!(%leader, %follower, "Uncoupled");
        self.emit(SimEvent::Uncoupled { leader, follower });
    }

    /// Break the link and give the follower its own claims back.
    fn sever(&mut self, l: &mut Convoy, f: &mut Convoy, world: &dyn World) {
        self.couplings.unlink(f.id);
        f.coupling = None;
        l.reservation
            .release_passed(&mut self.reservations, l.id, l.rear_index());

        self.reclaim_follower_body(f, world);

        l.kin.mark_partner_changed();
        f.kin.mark_partner_changed();
        f.kin.akt_speed = 0;
        if f.state != ConvoyState::SelfDestruct {
            self.transition(f, ConvoyState::Routing);
        }
    }
}
