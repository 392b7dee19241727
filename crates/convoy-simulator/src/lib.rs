//! # Convoy Simulator
//!
//! Deterministic, single-threaded stepping of convoys over a shared tile
//! network.
//!
//! ## Features
//!
//! - Block reservation with simple, pre-, priority, longblock and choose signals
//! - Lane coordination, overtaking and the yield protocol for road vehicles
//! - Coupling of two convoys into one driven unit
//! - Level crossings shared in turns by road and rail
//! - Timetabled departures with journey-time based delay recovery
//! - Tiered backoff for blocked convoys, never giving up
//! - Finance hooks, stops, loading and the depot lifecycle
//! - Snapshots that round-trip every claim
//!
//! The world and the router are consumed through the [`World`] and
//! [`Router`] traits; [`GridWorld`] and [`GridRouter`] are the in-crate
//! implementations used by the demo scenario and the tests.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod arena;
pub mod command;
pub mod config;
pub mod convoy;
pub mod coupling;
pub mod crossings;
pub mod error;
pub mod events;
pub mod finance;
pub mod kinematics;
pub mod lanes;
pub mod lines;
pub mod longblock;
pub mod movement;
pub mod occupancy;
pub mod priority;
pub mod reservation;
pub mod router;
pub mod scenario;
pub mod schedule;
pub mod simulation;
pub mod snapshot;
pub mod state;
pub mod stations;
pub mod world;

pub use command::{CommandOutcome, ConvoyCommand};
pub use config::SimConfig;
pub use convoy::{Convoy, ConvoySpec};
pub use error::{Result, SimError};
pub use events::{EventSink, SimEvent, TracingSink};
pub use router::{GridRouter, Route, RouteConstraints, Router};
pub use schedule::Schedule;
pub use simulation::{InvariantViolation, Simulation, TickReport};
pub use snapshot::SimulationSnapshot;
pub use state::ConvoyState;
pub use world::{GridWorld, World, WorldContext};
