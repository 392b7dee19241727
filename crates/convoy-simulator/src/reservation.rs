//! # Block Reservation
//!
//! Exclusive passage rights over route tiles for rail-like convoys.
//!
//! The [`ReservationTable`] is the global tile -> holder index; every convoy
//! additionally keeps its own [`Reservation`], the claimed tiles in route
//! order. Claims are only ever appended at the far end and released from
//! the near end, so the per-convoy list is always a queue ordered by route
//! index and "release the oldest" is the only release there is.

use crate::router::Route;
use crate::world::World;
use convoy_domain::{ConvoyId, TileCoord, WayType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

// =============================================================================
// GLOBAL TABLE
// =============================================================================

/// Tile -> holder index shared by all rail convoys.
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    holders: BTreeMap<TileCoord, ConvoyId>,
}

impl ReservationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn holder(&self, tile: TileCoord) -> Option<ConvoyId> {
        self.holders.get(&tile).copied()
    }

    /// Free, or already held by `owner`.
    #[must_use]
    pub fn is_free_for(&self, tile: TileCoord, owner: ConvoyId) -> bool {
        self.holder(tile).is_none_or(|holder| holder == owner)
    }

    fn claim(&mut self, tile: TileCoord, owner: ConvoyId) -> bool {
        match self.holders.get(&tile) {
            Some(holder) => *holder == owner,
            None => {
                self.holders.insert(tile, owner);
                true
            }
        }
    }

    fn release(&mut self, tile: TileCoord, owner: ConvoyId) {
        if self.holders.get(&tile) == Some(&owner) {
            self.holders.remove(&tile);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileCoord, &ConvoyId)> {
        self.holders.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

// =============================================================================
// PER-CONVOY RESERVATION
// =============================================================================

/// One claimed tile with the route index it was claimed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedTile {
    pub index: usize,
    pub tile: TileCoord,
}

/// Tiles held by one convoy, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    claims: VecDeque<ClaimedTile>,
    /// Furthest route index the claim extends to
    next_reservation_index: usize,
}

impl Reservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn next_reservation_index(&self) -> usize {
        self.next_reservation_index
    }

    pub fn claims(&self) -> impl Iterator<Item = &ClaimedTile> {
        self.claims.iter()
    }

    #[must_use]
    pub fn claimed_tiles(&self) -> Vec<TileCoord> {
        self.claims.iter().map(|c| c.tile).collect()
    }

    #[must_use]
    pub fn holds(&self, tile: TileCoord) -> bool {
        self.claims.iter().any(|c| c.tile == tile)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Claim `tile` for route `index`; appends to the far end.
    fn push(&mut self, table: &mut ReservationTable, owner: ConvoyId, index: usize, tile: TileCoord) -> bool {
        if !table.claim(tile, owner) {
            return false;
        }
        if !self.holds(tile) {
            self.claims.push_back(ClaimedTile { index, tile });
        }
        self.next_reservation_index = self.next_reservation_index.max(index);
        true
    }

    /// Release the oldest claimed tile.
    pub fn release_oldest(&mut self, table: &mut ReservationTable, owner: ConvoyId) -> Option<ClaimedTile> {
        let oldest = self.claims.pop_front()?;
        table.release(oldest.tile, owner);
        Some(oldest)
    }

    /// Release every tile the rear vehicle has left, i.e. claimed for a
    /// route index below `rear_index`.
    pub fn release_passed(
        &mut self,
        table: &mut ReservationTable,
        owner: ConvoyId,
        rear_index: usize,
    ) -> Vec<TileCoord> {
        let mut released = Vec::new();
        while self.claims.front().is_some_and(|c| c.index < rear_index) {
            if let Some(claim) = self.release_oldest(table, owner) {
                released.push(claim.tile);
            }
        }
        released
    }

    /// Bulk release on route recalculation or destruction, still oldest first.
    pub fn release_all(&mut self, table: &mut ReservationTable, owner: ConvoyId) -> usize {
        let mut count = 0;
        while self.release_oldest(table, owner).is_some() {
            count += 1;
        }
        self.next_reservation_index = 0;
        count
    }

    /// Claim tiles in route order, all or nothing.
    ///
    /// Used to re-issue claims for the tiles under a convoy after a route
    /// change. Depot tiles are never claimed.
    pub fn claim_range(
        &mut self,
        table: &mut ReservationTable,
        world: &dyn World,
        waytype: WayType,
        owner: ConvoyId,
        tiles: &[(usize, TileCoord)],
    ) -> bool {
        let free = tiles
            .iter()
            .all(|(_, tile)| world.is_depot(*tile, waytype) || table.is_free_for(*tile, owner));
        if !free {
            return false;
        }
        for (index, tile) in tiles {
            if !world.is_depot(*tile, waytype) {
                self.push(table, owner, *index, *tile);
            }
        }
        true
    }

    /// Shift every claim's route index after the route was rebased.
    pub fn shift_indices(&mut self, removed_prefix: usize) {
        for claim in &mut self.claims {
            claim.index = claim.index.saturating_sub(removed_prefix);
        }
        self.next_reservation_index = self.next_reservation_index.saturating_sub(removed_prefix);
    }

    /// Re-insert claims into the global table after a restore.
    pub fn republish(&self, table: &mut ReservationTable, owner: ConvoyId) -> bool {
        self.claims.iter().all(|claim| table.claim(claim.tile, owner))
    }

    /// Claims with strictly increasing route indices.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.claims
            .iter()
            .zip(self.claims.iter().skip(1))
            .all(|(a, b)| a.index < b.index)
    }
}

// =============================================================================
// BLOCK WALK
// =============================================================================

/// Whether a signal on the route tile at `index` applies to a convoy
/// entering it along the route.
#[must_use]
pub fn signal_applies(world: &dyn World, waytype: WayType, route: &Route, index: usize) -> bool {
    let Some(tile) = route.get(index) else {
        return false;
    };
    world
        .signal_at(tile, waytype)
        .is_some_and(|signal| signal.applies_to(route.direction_into(index)))
}

/// Result of scanning one block without claiming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockScan {
    pub start: usize,
    /// One past the last tile of the block
    pub end: usize,
    /// Route index of the signal ending the block
    pub next_signal: Option<usize>,
    /// First tile held by somebody else
    pub blocker: Option<(usize, ConvoyId)>,
}

/// Walk one block from `start` up to the next applying signal, the route
/// end or `limit` (exclusive), noting the first foreign claim.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn scan_block(
    table: &ReservationTable,
    world: &dyn World,
    waytype: WayType,
    owner: ConvoyId,
    route: &Route,
    start: usize,
    limit: usize,
) -> BlockScan {
    let end_limit = route.len().min(limit);
    let mut blocker = None;
    let mut index = start;
    while index < end_limit {
        let tile = route.tiles[index];
        if index > start && signal_applies(world, waytype, route, index) {
            return BlockScan {
                start,
                end: index,
                next_signal: Some(index),
                blocker,
            };
        }
        if blocker.is_none() && !world.is_depot(tile, waytype) {
            if let Some(holder) = table.holder(tile).filter(|h| *h != owner) {
                blocker = Some((index, holder));
            }
        }
        index += 1;
    }
    BlockScan {
        start,
        end: index,
        next_signal: None,
        blocker,
    }
}

/// Reserve or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveMode {
    Reserve,
    /// Release every claim below `start_index`, oldest first
    Release,
}

/// Parameters of one `block_reserver` call
#[derive(Clone, Copy)]
pub struct ReserveRequest<'a> {
    pub world: &'a dyn World,
    pub waytype: WayType,
    pub route: &'a Route,
    pub start_index: usize,
    /// Signals to look past before stopping
    pub signal_count: usize,
    pub max_lookahead: usize,
    /// Ignore `signal_count` and claim through to the route end
    pub until_route_end: bool,
}

/// What `block_reserver` achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// Furthest route index now held, if any block was claimed
    pub claimed_through: Option<usize>,
    /// Route index of the first foreign claim that stopped the walk
    pub failed_at: Option<usize>,
    pub blocker: Option<ConvoyId>,
    /// Signal at which the walk stopped
    pub next_signal: Option<usize>,
    /// Tiles given up by a release
    pub released: usize,
}

impl ReserveOutcome {
    /// Whether the tile at `index` is now covered by the reservation.
    #[must_use]
    pub fn covers(&self, index: usize) -> bool {
        self.claimed_through.is_some_and(|through| through >= index)
    }
}

/// Claim the route block by block from `start_index`.
///
/// Each block (tiles up to the next applying signal) is claimed all or
/// nothing. The walk stops after `signal_count` signals, at the route end,
/// after `max_lookahead` tiles or at the first block containing a foreign
/// claim; blocks claimed before the failing one are kept.
pub fn block_reserver(
    table: &mut ReservationTable,
    owner: ConvoyId,
    reservation: &mut Reservation,
    request: &ReserveRequest<'_>,
    mode: ReserveMode,
) -> ReserveOutcome {
    let mut outcome = ReserveOutcome::default();

    if mode == ReserveMode::Release {
        outcome.released = reservation
            .release_passed(table, owner, request.start_index)
            .len();
        return outcome;
    }

    let route = request.route;
    let limit = if request.until_route_end {
        route.len()
    } else {
        request.start_index.saturating_add(request.max_lookahead)
    };
    let mut cursor = request.start_index;
    let mut signals_passed = 0;

    while cursor < route.len().min(limit) {
        let scan = scan_block(table, request.world, request.waytype, owner, route, cursor, limit);
        if let Some((index, holder)) = scan.blocker {
            debug!(
                convoy = %owner,
                failed_at = index,
                blocker = %holder,
                "Block reservation refused"
            );
            outcome.failed_at = Some(index);
            outcome.blocker = Some(holder);
            break;
        }
        for index in scan.start..scan.end {
            let tile = route.tiles[index];
            if !request.world.is_depot(tile, request.waytype) {
                reservation.push(table, owner, index, tile);
            }
        }
        outcome.claimed_through = Some(scan.end.saturating_sub(1));
        match scan.next_signal {
            None => break,
            Some(signal) => {
                outcome.next_signal = Some(signal);
                signals_passed += 1;
                if !request.until_route_end && signals_passed >= request.signal_count {
                    break;
                }
                cursor = signal;
            }
        }
    }
    outcome
}
