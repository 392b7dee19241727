//! Lazily recomputed convoy aggregates and the accelerate/brake model.
//!
//! Four independent dirty flags guard the cached sums. A flag is cleared
//! only by recomputing its aggregate, and the aggregates are unreadable
//! while any flag is set.

use crate::convoy::Vehicle;
use crate::world::World;
use convoy_domain::{Slope, WayType};
use serde::{Deserialize, Serialize};

/// Weight of one unit of cargo.
pub const CARGO_UNIT_WEIGHT_KG: u32 = 100;

/// Deceleration floor in km/h per tick.
const MIN_BRAKE_KMH: u32 = 8;

/// Speed a convoy crawls at when it must stop at the next tile.
const APPROACH_SPEED_KMH: u32 = 20;

/// Cap on acceleration in km/h per tick.
const MAX_ACCEL_KMH: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyFlags {
    pub recalc_data: bool,
    pub recalc_data_front: bool,
    pub recalc_speed_limit: bool,
    pub recalc_min_top_speed: bool,
}

impl DirtyFlags {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            recalc_data: true,
            recalc_data_front: true,
            recalc_speed_limit: true,
            recalc_min_top_speed: true,
        }
    }

    #[must_use]
    pub const fn is_clean(&self) -> bool {
        !(self.recalc_data || self.recalc_data_front || self.recalc_speed_limit || self.recalc_min_top_speed)
    }
}

impl Default for DirtyFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// Cached sums over the vehicles of a convoy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregates {
    pub sum_power_kw: u32,
    /// Power times gear factor, in kW
    pub sum_gear_and_power: u32,
    pub sum_weight_kg: u32,
    /// Weight including cargo
    pub sum_gesamtweight_kg: u32,
    /// Weight scaled by the slope friction of the front vehicle
    pub sum_friction_weight_kg: u32,
    pub capacity: u32,
    pub length_steps: u32,
    pub speed_limit_kmh: u32,
    pub min_top_speed_kmh: u32,
    pub is_electric: bool,
}

/// Current speed plus lazily cached aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kinematics {
    pub akt_speed: u32,
    pub akt_speed_soll: u32,
    #[serde(skip)]
    aggregates: Aggregates,
    #[serde(skip)]
    dirty: DirtyFlags,
}

impl Kinematics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Vehicles were added, removed or reordered.
    pub fn mark_roster_changed(&mut self) {
        self.dirty = DirtyFlags::all();
    }

    /// The convoy moved onto a new tile.
    pub fn mark_moved(&mut self) {
        self.dirty.recalc_data_front = true;
        self.dirty.recalc_speed_limit = true;
    }

    /// Cargo changed, so weights did.
    pub fn mark_cargo_changed(&mut self) {
        self.dirty.recalc_data = true;
        self.dirty.recalc_data_front = true;
    }

    /// The coupling partner changed.
    pub fn mark_partner_changed(&mut self) {
        self.dirty.recalc_min_top_speed = true;
    }

    #[must_use]
    pub const fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.dirty.is_clean()
    }

    /// Aggregates, or `None` while any of them is stale.
    #[must_use]
    pub const fn aggregates(&self) -> Option<&Aggregates> {
        if self.dirty.is_clean() {
            Some(&self.aggregates)
        } else {
            None
        }
    }

    /// Recompute whatever is dirty.
    ///
    /// `front_slope` is the slope the front vehicle is on; `partner_top_speed`
    /// is the top speed of a coupled partner, which caps ours.
    pub fn refresh(
        &mut self,
        vehicles: &[Vehicle],
        world: &dyn World,
        waytype: WayType,
        front_slope: Slope,
        partner_top_speed: Option<u32>,
    ) {
        if self.dirty.recalc_data {
            let agg = &mut self.aggregates;
            agg.sum_power_kw = vehicles.iter().map(|v| v.desc.power_kw).sum();
            agg.sum_gear_and_power = vehicles
                .iter()
                .map(|v| v.desc.power_kw * v.desc.gear_pct / 100)
                .sum();
            agg.sum_weight_kg = vehicles.iter().map(|v| v.desc.weight_kg).sum();
            agg.sum_gesamtweight_kg = vehicles
                .iter()
                .map(|v| v.desc.weight_kg + u32::from(v.cargo) * CARGO_UNIT_WEIGHT_KG)
                .sum();
            agg.capacity = vehicles.iter().map(|v| u32::from(v.desc.capacity)).sum();
            agg.length_steps = vehicles.iter().map(|v| v.desc.length_in_steps()).sum();
            self.dirty.recalc_data = false;
            self.dirty.recalc_data_front = true;
        }
        if self.dirty.recalc_data_front {
            let factor = match front_slope {
                Slope::Flat => 1,
                Slope::Up => 3,
                Slope::Down => 0,
            };
            self.aggregates.sum_friction_weight_kg = self.aggregates.sum_gesamtweight_kg * factor;
            self.dirty.recalc_data_front = false;
        }
        if self.dirty.recalc_min_top_speed {
            let own = vehicles
                .iter()
                .map(|v| v.desc.top_speed_kmh)
                .min()
                .unwrap_or(0);
            self.aggregates.min_top_speed_kmh = partner_top_speed.map_or(own, |p| own.min(p));
            self.aggregates.is_electric = vehicles.iter().any(|v| v.desc.needs_electrification);
            self.dirty.recalc_min_top_speed = false;
        }
        if self.dirty.recalc_speed_limit {
            self.aggregates.speed_limit_kmh = vehicles
                .iter()
                .map(|v| world.speed_limit(v.pos, waytype))
                .filter(|limit| *limit > 0)
                .min()
                .unwrap_or(self.aggregates.min_top_speed_kmh.max(1));
            self.dirty.recalc_speed_limit = false;
        }
    }

    /// One tick of speed adjustment towards the allowed speed.
    ///
    /// `must_stop_ahead` caps the target at crawling speed.
    pub fn accelerate(&mut self, must_stop_ahead: bool) {
        let Some(agg) = self.aggregates().copied() else {
            return;
        };
        let mut soll = agg.min_top_speed_kmh.min(agg.speed_limit_kmh);
        if must_stop_ahead {
            soll = soll.min(APPROACH_SPEED_KMH);
        }
        let weight_t = (agg.sum_gesamtweight_kg / 1000).max(1);
        let resistance = agg.sum_friction_weight_kg / 1000 / 10;
        let accel = (agg.sum_gear_and_power.saturating_sub(resistance) / weight_t).min(MAX_ACCEL_KMH);
        self.akt_speed_soll = soll;

        if self.akt_speed < soll {
            if agg.sum_gear_and_power > 0 {
                self.akt_speed = (self.akt_speed + accel.max(1)).min(soll);
            }
        } else {
            let brake = (self.akt_speed / 4).max(MIN_BRAKE_KMH);
            self.akt_speed = self.akt_speed.saturating_sub(brake).max(soll);
        }
    }

    /// Movement steps covered this tick at the current speed.
    #[must_use]
    pub fn steps_this_tick(&self) -> u32 {
        if self.akt_speed == 0 { 0 } else { (self.akt_speed / 4).max(1) }
    }

    /// Cached aggregates without the freshness check, for callers that
    /// refreshed in the same step.
    pub(crate) fn cached(&self) -> &Aggregates {
        &self.aggregates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::GridWorld;
    use convoy_domain::{TileCoord, VehicleDesc};
    use std::sync::Arc;

    fn engine() -> Arc<VehicleDesc> {
        Arc::new(VehicleDesc {
            name: "engine".into(),
            waytype: WayType::Track,
            power_kw: 2000,
            gear_pct: 100,
            weight_kg: 80_000,
            capacity: 0,
            top_speed_kmh: 120,
            length: 8,
            needs_electrification: true,
            running_cost: 10,
            price: 100_000,
        })
    }

    fn wagon() -> Arc<VehicleDesc> {
        Arc::new(VehicleDesc {
            name: "wagon".into(),
            waytype: WayType::Track,
            power_kw: 0,
            gear_pct: 100,
            weight_kg: 20_000,
            capacity: 40,
            top_speed_kmh: 100,
            length: 8,
            needs_electrification: false,
            running_cost: 2,
            price: 10_000,
        })
    }

    fn world() -> GridWorld {
        let mut world = GridWorld::new();
        world.lay_line(TileCoord::new(0, 0, 0), TileCoord::new(4, 0, 0), WayType::Track, 80);
        world
    }

    #[test]
    fn test_stale_until_refreshed() {
        let world = world();
        let vehicles = vec![Vehicle::new(engine(), TileCoord::new(0, 0, 0))];
        let mut kin = Kinematics::new();
        assert!(kin.aggregates().is_none());

        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, None);
        let agg = kin.aggregates().copied().unwrap();
        assert_eq!(agg.sum_power_kw, 2000);
        assert_eq!(agg.min_top_speed_kmh, 120);
        assert_eq!(agg.speed_limit_kmh, 80);
        assert!(agg.is_electric);
    }

    #[test]
    fn test_roster_change_marks_everything() {
        let world = world();
        let mut vehicles = vec![Vehicle::new(engine(), TileCoord::new(0, 0, 0))];
        let mut kin = Kinematics::new();
        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, None);

        vehicles.push(Vehicle::new(wagon(), TileCoord::new(0, 0, 0)));
        kin.mark_roster_changed();
        assert_eq!(kin.dirty(), DirtyFlags::all());
        assert!(kin.aggregates().is_none());

        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, None);
        let agg = kin.aggregates().copied().unwrap();
        assert_eq!(agg.capacity, 40);
        assert_eq!(agg.min_top_speed_kmh, 100);
        assert_eq!(agg.length_steps, 256);
    }

    #[test]
    fn test_speed_limit_falls_back_to_top_speed() {
        let world = world();
        let vehicles = vec![Vehicle::new(engine(), TileCoord::new(9, 9, 0))];
        let mut kin = Kinematics::new();
        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, None);
        let agg = kin.aggregates().copied().unwrap();
        assert_eq!(agg.speed_limit_kmh, 120);
    }

    #[test]
    fn test_partner_caps_top_speed() {
        let world = world();
        let vehicles = vec![Vehicle::new(engine(), TileCoord::new(0, 0, 0))];
        let mut kin = Kinematics::new();
        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, Some(60));
        assert_eq!(kin.aggregates().map(|a| a.min_top_speed_kmh), Some(60));
    }

    #[test]
    fn test_accelerate_and_brake() {
        let world = world();
        let vehicles = vec![Vehicle::new(engine(), TileCoord::new(0, 0, 0))];
        let mut kin = Kinematics::new();
        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, None);

        for _ in 0..50 {
            kin.accelerate(false);
        }
        assert_eq!(kin.akt_speed, 80);
        assert_eq!(kin.steps_this_tick(), 20);

        kin.accelerate(true);
        assert!(kin.akt_speed < 80);
        for _ in 0..50 {
            kin.accelerate(true);
        }
        assert_eq!(kin.akt_speed, 20);
    }

    #[test]
    fn test_unpowered_convoy_does_not_move() {
        let world = world();
        let vehicles = vec![Vehicle::new(wagon(), TileCoord::new(0, 0, 0))];
        let mut kin = Kinematics::new();
        kin.refresh(&vehicles, &world, WayType::Track, Slope::Flat, None);
        kin.accelerate(false);
        assert_eq!(kin.akt_speed, 0);
        assert_eq!(kin.steps_this_tick(), 0);
    }
}
