//! Plain tile occupancy for ships and aircraft.

use convoy_domain::{ConvoyId, TileCoord, WayType};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct TileOccupancy {
    holders: BTreeMap<(TileCoord, WayType), ConvoyId>,
    by_convoy: BTreeMap<ConvoyId, Vec<(TileCoord, WayType)>>,
}

impl TileOccupancy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn holder(&self, tile: TileCoord, waytype: WayType) -> Option<ConvoyId> {
        self.holders.get(&(tile, waytype)).copied()
    }

    /// Replace the tiles of `convoy`; tiles held by others are left alone.
    pub fn occupy(&mut self, convoy: ConvoyId, waytype: WayType, tiles: &[TileCoord]) {
        self.vacate(convoy);
        let mut held = Vec::new();
        for tile in tiles {
            let key = (*tile, waytype);
            if self.holders.get(&key).is_none_or(|h| *h == convoy) {
                self.holders.insert(key, convoy);
                held.push(key);
            }
        }
        self.by_convoy.insert(convoy, held);
    }

    pub fn vacate(&mut self, convoy: ConvoyId) {
        for key in self.by_convoy.remove(&convoy).unwrap_or_default() {
            if self.holders.get(&key) == Some(&convoy) {
                self.holders.remove(&key);
            }
        }
    }
}
