//! Arrival-order arbitration for priority signals.
//!
//! Convoys waiting at a priority signal register the tiles of the block
//! they want. Two requests compete when their tile sets intersect; the one
//! that arrived first wins, ties broken by handle order.

use convoy_domain::{ConvoyId, TileCoord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A convoy waiting at a priority signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityClaim {
    pub signal_tile: TileCoord,
    pub arrival_tick: u64,
    pub tiles: BTreeSet<TileCoord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityArbiter {
    claims: BTreeMap<ConvoyId, PriorityClaim>,
}

impl PriorityArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `convoy` wants `tiles` behind `signal_tile`.
    ///
    /// The first registration's arrival tick is kept while the convoy keeps
    /// waiting at the same signal.
    pub fn register(&mut self, convoy: ConvoyId, signal_tile: TileCoord, tiles: BTreeSet<TileCoord>, tick: u64) {
        let arrival_tick = self
            .claims
            .get(&convoy)
            .filter(|claim| claim.signal_tile == signal_tile)
            .map_or(tick, |claim| claim.arrival_tick);
        self.claims.insert(
            convoy,
            PriorityClaim {
                signal_tile,
                arrival_tick,
                tiles,
            },
        );
    }

    /// Whether no competing claim precedes this convoy's.
    #[must_use]
    pub fn has_precedence(&self, convoy: ConvoyId) -> bool {
        let Some(mine) = self.claims.get(&convoy) else {
            return true;
        };
        let my_key = (mine.arrival_tick, convoy);
        !self.claims.iter().any(|(other, claim)| {
            *other != convoy
                && (claim.arrival_tick, *other) < my_key
                && !claim.tiles.is_disjoint(&mine.tiles)
        })
    }

    /// Remove the claim once granted, rerouted or destroyed.
    pub fn withdraw(&mut self, convoy: ConvoyId) -> bool {
        self.claims.remove(&convoy).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
