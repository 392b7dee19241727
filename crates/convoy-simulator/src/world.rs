//! # World Interface
//!
//! Read-only view of the tile grid the simulation drives over, plus a
//! `BTreeMap`-backed implementation used by the demo scenario and tests.
//!
//! The world is never global: the step loop receives a [`WorldContext`]
//! borrowing both the world and the router for the duration of one tick.

use crate::router::Router;
use convoy_domain::{Ribi, Signal, Slope, StationId, TileCoord, WayType};
use std::collections::BTreeMap;

/// Queryable tile grid
pub trait World {
    /// Whether `tile` carries a way of the given type.
    fn has_way(&self, tile: TileCoord, waytype: WayType) -> bool;

    /// Tiles reachable in one hop from `tile`, honouring one-way restrictions.
    fn way_neighbours(&self, tile: TileCoord, waytype: WayType) -> Vec<TileCoord>;

    /// Signal standing on `tile` for the given way, if any.
    fn signal_at(&self, tile: TileCoord, waytype: WayType) -> Option<Signal>;

    fn station_at(&self, tile: TileCoord) -> Option<StationId>;

    /// All tiles belonging to a station, in coordinate order.
    fn station_tiles(&self, station: StationId) -> Vec<TileCoord>;

    fn is_depot(&self, tile: TileCoord, waytype: WayType) -> bool;

    /// Speed limit of the way in km/h.
    fn speed_limit(&self, tile: TileCoord, waytype: WayType) -> u32;

    fn is_electrified(&self, tile: TileCoord, waytype: WayType) -> bool;

    /// A road and a rail-like way share `tile`.
    fn is_level_crossing(&self, tile: TileCoord) -> bool {
        self.has_way(tile, WayType::Road)
            && [WayType::Track, WayType::Monorail, WayType::Maglev, WayType::NarrowGauge]
                .into_iter()
                .any(|waytype| self.has_way(tile, waytype))
    }

    /// Height change when moving from `from` to `to`.
    fn slope(&self, from: TileCoord, to: TileCoord) -> Slope {
        match to.z.cmp(&from.z) {
            std::cmp::Ordering::Greater => Slope::Up,
            std::cmp::Ordering::Less => Slope::Down,
            std::cmp::Ordering::Equal => Slope::Flat,
        }
    }
}

/// World and router borrowed for one tick.
#[derive(Clone, Copy)]
pub struct WorldContext<'a> {
    pub world: &'a dyn World,
    pub router: &'a dyn Router,
}

impl<'a> WorldContext<'a> {
    #[must_use]
    pub fn new(world: &'a dyn World, router: &'a dyn Router) -> Self {
        Self { world, router }
    }
}

// =============================================================================
// GRID WORLD
// =============================================================================

/// One way on one tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Way {
    /// Connected directions
    pub ribi: Ribi,
    /// If set, travel is only allowed leaving the tile in these directions
    pub one_way: Option<Ribi>,
    pub max_speed_kmh: u32,
    pub electrified: bool,
    pub signal: Option<Signal>,
    pub depot: bool,
}

impl Way {
    fn new(max_speed_kmh: u32) -> Self {
        Self {
            ribi: Ribi::NONE,
            one_way: None,
            max_speed_kmh,
            electrified: false,
            signal: None,
            depot: false,
        }
    }
}

/// In-memory grid keyed by tile and way type.
#[derive(Debug, Clone, Default)]
pub struct GridWorld {
    ways: BTreeMap<(TileCoord, WayType), Way>,
    stations: BTreeMap<TileCoord, StationId>,
}

impl GridWorld {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect consecutive tiles of `path` with ways of `waytype`.
    ///
    /// Consecutive tiles must be planar neighbours; pairs that are not are
    /// skipped.
    pub fn lay_path(&mut self, path: &[TileCoord], waytype: WayType, max_speed_kmh: u32) -> &mut Self {
        for tile in path {
            self.ways
                .entry((*tile, waytype))
                .or_insert_with(|| Way::new(max_speed_kmh));
        }
        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.distance(&b) != 1 {
                continue;
            }
            let dir = Ribi::between(&a, &b);
            if let Some(way) = self.ways.get_mut(&(a, waytype)) {
                way.ribi = way.ribi.union(dir);
            }
            if let Some(way) = self.ways.get_mut(&(b, waytype)) {
                way.ribi = way.ribi.union(dir.reverse());
            }
        }
        self
    }

    /// Straight axis-aligned line between two tiles on the same row or column.
    pub fn lay_line(&mut self, from: TileCoord, to: TileCoord, waytype: WayType, max_speed_kmh: u32) -> &mut Self {
        let path = straight_line(from, to);
        self.lay_path(&path, waytype, max_speed_kmh)
    }

    /// Restrict travel out of `tile` to `dir`.
    pub fn set_one_way(&mut self, tile: TileCoord, waytype: WayType, dir: Ribi) -> &mut Self {
        if let Some(way) = self.ways.get_mut(&(tile, waytype)) {
            way.one_way = Some(dir);
        }
        self
    }

    pub fn place_signal(&mut self, tile: TileCoord, waytype: WayType, signal: Signal) -> &mut Self {
        if let Some(way) = self.ways.get_mut(&(tile, waytype)) {
            way.signal = Some(signal);
        }
        self
    }

    pub fn remove_signal(&mut self, tile: TileCoord, waytype: WayType) -> Option<Signal> {
        self.ways
            .get_mut(&(tile, waytype))
            .and_then(|way| way.signal.take())
    }

    pub fn place_station(&mut self, tile: TileCoord, station: StationId) -> &mut Self {
        self.stations.insert(tile, station);
        self
    }

    pub fn place_depot(&mut self, tile: TileCoord, waytype: WayType) -> &mut Self {
        if let Some(way) = self.ways.get_mut(&(tile, waytype)) {
            way.depot = true;
        }
        self
    }

    pub fn electrify(&mut self, tiles: &[TileCoord], waytype: WayType) -> &mut Self {
        for tile in tiles {
            if let Some(way) = self.ways.get_mut(&(*tile, waytype)) {
                way.electrified = true;
            }
        }
        self
    }

    #[must_use]
    pub fn way(&self, tile: TileCoord, waytype: WayType) -> Option<&Way> {
        self.ways.get(&(tile, waytype))
    }

    /// Number of tiles with any way.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.ways.len()
    }
}

impl World for GridWorld {
    fn has_way(&self, tile: TileCoord, waytype: WayType) -> bool {
        self.ways.contains_key(&(tile, waytype))
    }

    fn way_neighbours(&self, tile: TileCoord, waytype: WayType) -> Vec<TileCoord> {
        let Some(way) = self.ways.get(&(tile, waytype)) else {
            return Vec::new();
        };
        Ribi::SINGLES
            .iter()
            .filter(|dir| way.ribi.contains(**dir))
            .filter(|dir| way.one_way.is_none_or(|allowed| allowed.contains(**dir)))
            .filter_map(|dir| {
                let flat = tile.step(*dir);
                [0_i8, 1, -1].iter().find_map(|dz| {
                    let candidate = TileCoord::new(flat.x, flat.y, flat.z.saturating_add(*dz));
                    self.ways
                        .get(&(candidate, waytype))
                        .filter(|other| other.ribi.contains(dir.reverse()))
                        .map(|_| candidate)
                })
            })
            .collect()
    }

    fn signal_at(&self, tile: TileCoord, waytype: WayType) -> Option<Signal> {
        self.ways.get(&(tile, waytype)).and_then(|way| way.signal)
    }

    fn station_at(&self, tile: TileCoord) -> Option<StationId> {
        self.stations.get(&tile).copied()
    }

    fn station_tiles(&self, station: StationId) -> Vec<TileCoord> {
        self.stations
            .iter()
            .filter(|(_, id)| **id == station)
            .map(|(tile, _)| *tile)
            .collect()
    }

    fn is_depot(&self, tile: TileCoord, waytype: WayType) -> bool {
        self.ways.get(&(tile, waytype)).is_some_and(|way| way.depot)
    }

    fn speed_limit(&self, tile: TileCoord, waytype: WayType) -> u32 {
        self.ways
            .get(&(tile, waytype))
            .map_or(0, |way| way.max_speed_kmh)
    }

    fn is_electrified(&self, tile: TileCoord, waytype: WayType) -> bool {
        self.ways
            .get(&(tile, waytype))
            .is_some_and(|way| way.electrified)
    }
}

/// Tiles from `from` to `to` inclusive along one axis.
#[must_use]
pub fn straight_line(from: TileCoord, to: TileCoord) -> Vec<TileCoord> {
    let mut tiles = vec![from];
    let mut cur = from;
    while cur.x != to.x || cur.y != to.y {
        let dir = if cur.x < to.x {
            Ribi::EAST
        } else if cur.x > to.x {
            Ribi::WEST
        } else if cur.y < to.y {
            Ribi::SOUTH
        } else {
            Ribi::NORTH
        };
        cur = cur.step(dir);
        tiles.push(cur);
    }
    tiles
}
