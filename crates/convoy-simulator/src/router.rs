//! Route type and the router interface.
//!
//! The simulation treats path search as an external collaborator; the
//! [`GridRouter`] here runs A* over a [`World`] using the per-waytype hop
//! costs from [`MovementKind`].

use crate::movement::MovementKind;
use crate::world::World;
use convoy_domain::{Ribi, TileCoord, WayType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ordered tile sequence a convoy drives along.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub tiles: Vec<TileCoord>,
}

impl Route {
    #[must_use]
    pub fn new(tiles: Vec<TileCoord>) -> Self {
        Self { tiles }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<TileCoord> {
        self.tiles.get(index).copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<TileCoord> {
        self.tiles.last().copied()
    }

    #[must_use]
    pub fn last_index(&self) -> usize {
        self.tiles.len().saturating_sub(1)
    }

    /// Direction of travel when entering the tile at `index`.
    #[must_use]
    pub fn direction_into(&self, index: usize) -> Ribi {
        match (index.checked_sub(1).and_then(|i| self.get(i)), self.get(index)) {
            (Some(prev), Some(cur)) => Ribi::between(&prev, &cur),
            _ => Ribi::NONE,
        }
    }

    /// First index at or after `from` holding `tile`.
    #[must_use]
    pub fn position_of(&self, tile: TileCoord, from: usize) -> Option<usize> {
        self.tiles
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, t)| **t == tile)
            .map(|(i, _)| i)
    }
}

/// What the router must respect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConstraints {
    pub waytype: WayType,
    /// Top speed of the convoy, for the slow-way penalty
    pub max_speed_kmh: u32,
    /// Tiles the path must not cross (start and goal excepted)
    pub avoid: BTreeSet<TileCoord>,
}

impl RouteConstraints {
    #[must_use]
    pub fn new(waytype: WayType, max_speed_kmh: u32) -> Self {
        Self {
            waytype,
            max_speed_kmh,
            avoid: BTreeSet::new(),
        }
    }
}

/// Produces an ordered tile sequence from `start` to `goal`.
pub trait Router {
    /// Returns `None` when no path exists. The path starts with `start` and
    /// ends with `goal`.
    fn compute_route(
        &self,
        world: &dyn World,
        start: TileCoord,
        goal: TileCoord,
        constraints: &RouteConstraints,
    ) -> Option<Route>;
}

/// A* over way connectivity with manhattan heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridRouter;

impl Router for GridRouter {
    fn compute_route(
        &self,
        world: &dyn World,
        start: TileCoord,
        goal: TileCoord,
        constraints: &RouteConstraints,
    ) -> Option<Route> {
        let waytype = constraints.waytype;
        if !world.has_way(start, waytype) || !world.has_way(goal, waytype) {
            return None;
        }
        let kind = MovementKind::for_waytype(waytype);
        let result = pathfinding::prelude::astar(
            &start,
            |tile| {
                let from = *tile;
                world
                    .way_neighbours(from, waytype)
                    .into_iter()
                    .filter(|next| *next == goal || !constraints.avoid.contains(next))
                    .map(|next| {
                        let cost = kind.calc_cost(world, from, next, waytype, constraints.max_speed_kmh);
                        (next, cost)
                    })
                    .collect::<Vec<_>>()
            },
            |tile| tile.distance(&goal),
            |tile| *tile == goal,
        );
        result.map(|(tiles, _cost)| Route::new(tiles))
    }
}
