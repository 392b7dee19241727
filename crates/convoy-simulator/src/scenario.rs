//! # Demo Scenario
//!
//! A small seeded network used by the CLI:
//!
//! ```text
//!  y=0   D══►══S1══►══PRE══B══►══PRIO══►══S2══►══╗
//!        ║                                        ║
//!  y=2   ╚══◄══S1══CHOOSE══◄══B══◄══LONG══S2══◄═══╝
//!
//!  y=10  D────S4─────────── two-lane road ───────S3
//! ```
//!
//! Trains run a one-way loop between two stations with one signal of every
//! kind on it. Buses shuttle on the road with randomised top speeds so that
//! faster buses catch up and overtake. Cargo appears at the stations at a
//! fixed interval, drawn from a normal distribution.
//!
//! The layout is fixed. The seed only drives cargo and bus speeds, so a
//! snapshot taken on one run resumes on [`demo_world`] of any other.

use crate::command::ConvoyCommand;
use crate::config::SimConfig;
use crate::convoy::ConvoySpec;
use crate::error::{Result, SimError};
use crate::router::GridRouter;
use crate::schedule::Schedule;
use crate::simulation::{Simulation, TickReport};
use crate::snapshot::SimulationSnapshot;
use crate::world::{GridWorld, WorldContext};
use convoy_domain::{
    ConvoyId, DepartureSlot, PlayerId, Ribi, ScheduleEntry, Signal, SignalKind, StationId,
    TileCoord, VehicleDesc, WayType,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::Arc;
use tracing::info;

/// Ticks between two cargo drops at every station
pub const CARGO_INTERVAL_TICKS: u64 = 256;

const TRACK_SPEED_KMH: u32 = 100;
const ROAD_SPEED_KMH: u32 = 80;
const LOOP_END_X: i16 = 40;

pub const RAIL_DEPOT: TileCoord = TileCoord::new(0, 0, 0);
pub const ROAD_DEPOT: TileCoord = TileCoord::new(0, 10, 0);

const HARBOUR: StationId = StationId(1);
const MILL: StationId = StationId(2);
const MARKET: StationId = StationId(3);
const VILLAGE: StationId = StationId(4);

const fn t(x: i16, y: i16) -> TileCoord {
    TileCoord::new(x, y, 0)
}

/// The fixed demo network.
#[must_use]
pub fn demo_world() -> GridWorld {
    let mut world = GridWorld::new();

    // Rail loop, eastbound on y=0 and westbound on y=2
    world
        .lay_line(RAIL_DEPOT, t(LOOP_END_X, 0), WayType::Track, TRACK_SPEED_KMH)
        .lay_line(t(LOOP_END_X, 0), t(LOOP_END_X, 2), WayType::Track, TRACK_SPEED_KMH)
        .lay_line(t(LOOP_END_X, 2), t(1, 2), WayType::Track, TRACK_SPEED_KMH)
        .lay_line(t(1, 2), t(1, 0), WayType::Track, TRACK_SPEED_KMH)
        .place_depot(RAIL_DEPOT, WayType::Track);
    for x in 2..LOOP_END_X {
        world
            .set_one_way(t(x, 0), WayType::Track, Ribi::EAST)
            .set_one_way(t(x, 2), WayType::Track, Ribi::WEST);
    }

    world
        .place_signal(t(5, 0), WayType::Track, Signal::new(SignalKind::Block, Ribi::EAST))
        .place_signal(t(15, 0), WayType::Track, Signal::new(SignalKind::PreSignal, Ribi::EAST))
        .place_signal(t(20, 0), WayType::Track, Signal::new(SignalKind::Block, Ribi::EAST))
        .place_signal(t(25, 0), WayType::Track, Signal::new(SignalKind::Priority, Ribi::EAST))
        .place_signal(t(35, 2), WayType::Track, Signal::new(SignalKind::LongBlock, Ribi::WEST))
        .place_signal(t(20, 2), WayType::Track, Signal::new(SignalKind::Block, Ribi::WEST))
        .place_signal(t(13, 2), WayType::Track, Signal::new(SignalKind::Choose, Ribi::WEST));

    for x in [10, 11] {
        world.place_station(t(x, 0), HARBOUR).place_station(t(x, 2), HARBOUR);
    }
    for x in [30, 31] {
        world.place_station(t(x, 0), MILL).place_station(t(x, 2), MILL);
    }

    // Road
    world
        .lay_line(ROAD_DEPOT, t(LOOP_END_X, 10), WayType::Road, ROAD_SPEED_KMH)
        .place_depot(ROAD_DEPOT, WayType::Road);
    for x in [38, 39] {
        world.place_station(t(x, 10), MARKET);
    }
    for x in [3, 4] {
        world.place_station(t(x, 10), VILLAGE);
    }

    world
}

fn locomotive() -> Arc<VehicleDesc> {
    Arc::new(VehicleDesc {
        name: "Class 66 diesel".to_string(),
        waytype: WayType::Track,
        power_kw: 2_400,
        gear_pct: 100,
        weight_kg: 120_000,
        capacity: 0,
        top_speed_kmh: 110,
        length: 8,
        needs_electrification: false,
        running_cost: 18,
        price: 90_000,
    })
}

fn wagon() -> Arc<VehicleDesc> {
    Arc::new(VehicleDesc {
        name: "Box wagon".to_string(),
        waytype: WayType::Track,
        power_kw: 0,
        gear_pct: 100,
        weight_kg: 14_000,
        capacity: 40,
        top_speed_kmh: 120,
        length: 8,
        needs_electrification: false,
        running_cost: 2,
        price: 12_000,
    })
}

fn bus(top_speed_kmh: u32) -> Arc<VehicleDesc> {
    Arc::new(VehicleDesc {
        name: format!("Bus {top_speed_kmh}"),
        waytype: WayType::Road,
        power_kw: 180,
        gear_pct: 100,
        weight_kg: 9_000,
        capacity: 30,
        top_speed_kmh,
        length: 8,
        needs_electrification: false,
        running_cost: 4,
        price: 20_000,
    })
}

/// Demo world, router, simulation and cargo generator.
#[derive(Debug)]
pub struct Scenario {
    pub world: GridWorld,
    pub router: GridRouter,
    pub sim: Simulation,
    /// Convoys the scenario created, trains first
    pub convoys: Vec<ConvoyId>,
    rng: StdRng,
    cargo: Normal<f64>,
}

impl Scenario {
    /// Build the network, register trains and buses and queue their start.
    pub fn build(config: SimConfig, seed: u64, trains: usize, buses: usize) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let cargo = cargo_distribution()?;
        let mut sim = Simulation::new(config);

        let rail_schedule = Schedule::new(vec![
            ScheduleEntry {
                tile: t(11, 0),
                minimum_loading: 50,
                max_wait_ticks: Some(192),
                departure: Some(DepartureSlot {
                    interval_ticks: 96,
                    offset_ticks: 0,
                }),
                coupling_delay_tolerance_ticks: None,
            },
            ScheduleEntry::waypoint(t(30, 2)),
        ])?;
        let road_schedule = Schedule::new(vec![
            ScheduleEntry::waypoint(t(39, 10)),
            ScheduleEntry {
                tile: t(3, 10),
                minimum_loading: 0,
                max_wait_ticks: Some(64),
                departure: None,
                coupling_delay_tolerance_ticks: None,
            },
        ])?;
        let harbour_line = sim.lines_mut().add_line("Harbour freight", rail_schedule.clone());

        let mut convoys = Vec::with_capacity(trains + buses);
        for n in 0..trains {
            let id = sim.add_convoy(ConvoySpec {
                name: format!("Freight {}", n + 1),
                owner: PlayerId(0),
                home_depot: RAIL_DEPOT,
                vehicles: vec![locomotive(), wagon(), wagon()],
                schedule: rail_schedule.clone(),
            })?;
            sim.submit(id, ConvoyCommand::SetLine {
                line: Some(harbour_line),
            });
            sim.submit(id, ConvoyCommand::Start);
            convoys.push(id);
        }
        for n in 0..buses {
            let top_speed = rng.gen_range(40..=ROAD_SPEED_KMH);
            let id = sim.add_convoy(ConvoySpec {
                name: format!("Bus {}", n + 1),
                owner: PlayerId(1),
                home_depot: ROAD_DEPOT,
                vehicles: vec![bus(top_speed)],
                schedule: road_schedule.clone(),
            })?;
            sim.submit(id, ConvoyCommand::Start);
            convoys.push(id);
        }

        info!(seed, trains, buses, "Demo scenario built");
        let mut scenario = Self {
            world: demo_world(),
            router: GridRouter,
            sim,
            convoys,
            rng,
            cargo,
        };
        scenario.produce_cargo();
        Ok(scenario)
    }

    /// Continue a saved run on the demo network.
    pub fn resume(config: SimConfig, snapshot: SimulationSnapshot, seed: u64) -> Result<Self> {
        let world = demo_world();
        let sim = Simulation::restore(config, snapshot, &world)?;
        let convoys = sim.convoy_ids();
        Ok(Self {
            world,
            router: GridRouter,
            sim,
            convoys,
            rng: StdRng::seed_from_u64(seed),
            cargo: cargo_distribution()?,
        })
    }

    /// Advance one tick, dropping cargo at the stations on the interval.
    pub fn step(&mut self) -> TickReport {
        let ctx = WorldContext::new(&self.world, &self.router);
        let report = self.sim.step(&ctx);
        if self.sim.tick() % CARGO_INTERVAL_TICKS == 0 {
            self.produce_cargo();
        }
        report
    }

    fn produce_cargo(&mut self) {
        for station in [HARBOUR, MILL, MARKET, VILLAGE] {
            let amount = self.cargo.sample(&mut self.rng).max(0.0).round() as u32;
            self.sim.stations_mut().add_cargo(station, amount);
        }
    }
}

fn cargo_distribution() -> Result<Normal<f64>> {
    Normal::new(40.0, 12.0).map_err(|e| SimError::Scenario(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::World;

    #[test]
    fn test_demo_world_loop_is_one_way() {
        let world = demo_world();
        assert_eq!(world.way_neighbours(t(10, 0), WayType::Track), vec![t(11, 0)]);
        assert_eq!(world.way_neighbours(t(10, 2), WayType::Track), vec![t(9, 2)]);
        assert!(world.is_depot(RAIL_DEPOT, WayType::Track));
        assert!(world.is_depot(ROAD_DEPOT, WayType::Road));
        assert_eq!(world.station_at(t(30, 2)), Some(MILL));
    }

    #[test]
    fn test_demo_world_has_every_signal_kind() {
        let world = demo_world();
        let kinds: Vec<SignalKind> = (0..=LOOP_END_X)
            .flat_map(|x| [t(x, 0), t(x, 2)])
            .filter_map(|tile| world.signal_at(tile, WayType::Track))
            .map(|signal| signal.kind)
            .collect();
        for kind in [
            SignalKind::Block,
            SignalKind::PreSignal,
            SignalKind::Priority,
            SignalKind::LongBlock,
            SignalKind::Choose,
        ] {
            assert!(kinds.contains(&kind), "missing {}", kind.as_str());
        }
    }

    #[test]
    fn test_build_is_seed_deterministic() {
        let a = Scenario::build(SimConfig::default(), 7, 2, 3).unwrap();
        let b = Scenario::build(SimConfig::default(), 7, 2, 3).unwrap();
        assert_eq!(a.convoys.len(), 5);
        assert_eq!(a.sim.pending_commands(), 2 * 2 + 3);
        for id in &a.convoys {
            let top_a = a.sim.convoy(*id).unwrap().vehicles[0].desc.top_speed_kmh;
            let top_b = b.sim.convoy(*id).unwrap().vehicles[0].desc.top_speed_kmh;
            assert_eq!(top_a, top_b);
        }
        assert_eq!(a.sim.stations().waiting(HARBOUR), b.sim.stations().waiting(HARBOUR));
    }

    #[test]
    fn test_scenario_steps_and_drops_cargo() {
        let mut scenario = Scenario::build(SimConfig::default(), 42, 2, 2).unwrap();
        for _ in 0..CARGO_INTERVAL_TICKS {
            scenario.step();
        }
        assert_eq!(scenario.sim.tick(), CARGO_INTERVAL_TICKS);
        assert_eq!(scenario.sim.convoys().count(), 4);
        assert_eq!(scenario.sim.pending_commands(), 0);
    }
}
