//! Per-waytype movement rules, dispatched on an enum keyed by the way type.
//!
//! Every vehicle is the same record; what differs between trains, road
//! vehicles, ships and aircraft is which resource guards tile entry and how
//! the router weighs a hop. Both are answered here.

use crate::world::World;
use convoy_domain::{Slope, TileCoord, WayType};
use serde::{Deserialize, Serialize};

/// Extra route cost for climbing one height level on road.
pub const ROAD_UPSLOPE_COST: u32 = 15;

/// Extra route cost for climbing one height level on rail-like ways.
pub const RAIL_UPSLOPE_COST: u32 = 25;

/// Resource consulted before a vehicle may enter the next tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    /// Block reservation and signals
    Rail,
    /// Lane coordinator
    Road,
    /// Tile occupancy along the whole route
    Water,
    /// Tile occupancy at stop positions only
    Air,
}

impl MovementKind {
    #[must_use]
    pub const fn for_waytype(waytype: WayType) -> Self {
        match waytype {
            WayType::Road => Self::Road,
            WayType::Water => Self::Water,
            WayType::Air => Self::Air,
            WayType::Track | WayType::Monorail | WayType::Maglev | WayType::NarrowGauge => Self::Rail,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rail => "RAIL",
            Self::Road => "ROAD",
            Self::Water => "WATER",
            Self::Air => "AIR",
        }
    }

    /// Static part of the entry check: the way must exist.
    #[must_use]
    pub fn can_enter_way(&self, world: &dyn World, tile: TileCoord, waytype: WayType) -> bool {
        world.has_way(tile, waytype)
    }

    /// Whether another vehicle standing on `tile` blocks entry at all.
    #[must_use]
    pub const fn occupancy_blocks(&self, is_stop_tile: bool) -> bool {
        match self {
            Self::Water => true,
            Self::Air => is_stop_tile,
            Self::Rail | Self::Road => false,
        }
    }

    /// Router cost of the hop `from -> to` for a vehicle with top speed
    /// `max_speed_kmh`.
    ///
    /// A hop costs 1, plus up to 3 when the way is slower than the vehicle,
    /// plus the upslope surcharge.
    #[must_use]
    pub fn calc_cost(
        &self,
        world: &dyn World,
        from: TileCoord,
        to: TileCoord,
        waytype: WayType,
        max_speed_kmh: u32,
    ) -> u32 {
        let mut cost = 1;
        if matches!(self, Self::Rail | Self::Road) {
            let tile_speed = world.speed_limit(to, waytype);
            if max_speed_kmh > 0 && tile_speed < max_speed_kmh {
                cost += 3 * (max_speed_kmh - tile_speed) / max_speed_kmh;
            }
        }
        if world.slope(from, to) == Slope::Up {
            cost += match self {
                Self::Rail => RAIL_UPSLOPE_COST,
                Self::Road => ROAD_UPSLOPE_COST,
                Self::Water | Self::Air => 0,
            };
        }
        cost
    }
}
