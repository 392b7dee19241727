//! # Level Crossings
//!
//! A tile where a road meets a rail-like way is shared by taking turns.
//! Any number of convoys of one side may hold the crossing together; the
//! other side gets it once the last of them has left.
//!
//! The table is an index over `Convoy::held_crossings` and is rebuilt from
//! the convoys when a snapshot is restored.

use convoy_domain::{ConvoyId, TileCoord, WayType};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Which kind of traffic currently owns a crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingSide {
    Rail,
    Road,
}

impl CrossingSide {
    /// Side a convoy of `waytype` takes; ships and aircraft never use a
    /// crossing.
    #[must_use]
    pub const fn of(waytype: WayType) -> Option<Self> {
        match waytype {
            WayType::Road => Some(Self::Road),
            WayType::Track | WayType::Monorail | WayType::Maglev | WayType::NarrowGauge => {
                Some(Self::Rail)
            }
            WayType::Water | WayType::Air => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Hold {
    side: CrossingSide,
    holders: BTreeSet<ConvoyId>,
}

#[derive(Debug, Clone, Default)]
pub struct CrossingTable {
    holds: BTreeMap<TileCoord, Hold>,
}

impl CrossingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Side currently holding `tile`.
    #[must_use]
    pub fn side(&self, tile: TileCoord) -> Option<CrossingSide> {
        self.holds.get(&tile).map(|hold| hold.side)
    }

    #[must_use]
    pub fn holders(&self, tile: TileCoord) -> Vec<ConvoyId> {
        self.holds
            .get(&tile)
            .map(|hold| hold.holders.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Join the holders of `tile`, or fail with one convoy of the other side.
    pub fn try_reserve(
        &mut self,
        tile: TileCoord,
        convoy: ConvoyId,
        side: CrossingSide,
    ) -> Result<(), ConvoyId> {
        match self.holds.get_mut(&tile) {
            Some(hold) if hold.side != side => {
                Err(hold.holders.first().copied().unwrap_or(convoy))
            }
            Some(hold) => {
                hold.holders.insert(convoy);
                Ok(())
            }
            None => {
                self.holds.insert(
                    tile,
                    Hold {
                        side,
                        holders: BTreeSet::from([convoy]),
                    },
                );
                debug!(%tile, %convoy, ?side, "Crossing taken");
                Ok(())
            }
        }
    }

    /// Leave `tile`; the crossing frees up with its last holder.
    pub fn release(&mut self, tile: TileCoord, convoy: ConvoyId) {
        let Some(hold) = self.holds.get_mut(&tile) else {
            return;
        };
        hold.holders.remove(&convoy);
        if hold.holders.is_empty() {
            self.holds.remove(&tile);
            debug!(%tile, "Crossing free");
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileCoord, CrossingSide, &BTreeSet<ConvoyId>)> {
        self.holds
            .iter()
            .map(|(tile, hold)| (*tile, hold.side, &hold.holders))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_side_shares_the_other_waits() {
        let tile = TileCoord::new(4, 0, 0);
        let bus_a = ConvoyId::new(0, 0);
        let bus_b = ConvoyId::new(1, 0);
        let train = ConvoyId::new(2, 0);
        let mut table = CrossingTable::new();

        assert!(table.try_reserve(tile, bus_a, CrossingSide::Road).is_ok());
        assert!(table.try_reserve(tile, bus_b, CrossingSide::Road).is_ok());
        assert_eq!(table.try_reserve(tile, train, CrossingSide::Rail), Err(bus_a));

        table.release(tile, bus_a);
        assert_eq!(table.try_reserve(tile, train, CrossingSide::Rail), Err(bus_b));
        table.release(tile, bus_b);
        assert_eq!(table.side(tile), None);

        assert!(table.try_reserve(tile, train, CrossingSide::Rail).is_ok());
        assert_eq!(table.side(tile), Some(CrossingSide::Rail));
        assert_eq!(table.holders(tile), vec![train]);
    }

    #[test]
    fn test_release_by_stranger_keeps_hold() {
        let tile = TileCoord::new(4, 0, 0);
        let mut table = CrossingTable::new();
        table
            .try_reserve(tile, ConvoyId::new(0, 0), CrossingSide::Rail)
            .unwrap();
        table.release(tile, ConvoyId::new(5, 0));
        assert_eq!(table.side(tile), Some(CrossingSide::Rail));
        assert!(!table.is_empty());
    }

    #[test]
    fn test_sides_by_waytype() {
        assert_eq!(CrossingSide::of(WayType::Road), Some(CrossingSide::Road));
        assert_eq!(CrossingSide::of(WayType::NarrowGauge), Some(CrossingSide::Rail));
        assert_eq!(CrossingSide::of(WayType::Water), None);
    }
}
