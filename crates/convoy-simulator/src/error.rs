//! Simulator error types

use convoy_domain::{ConvoyId, DomainError, TileCoord};
use thiserror::Error;

/// Errors raised by the simulation core.
///
/// Transient conditions (a denied reservation, a pending longblock request)
/// are recovered by the convoy state machine and only show up here when a
/// caller asks for them explicitly.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("No route for {convoy} to {goal}")]
    NoRoute { convoy: ConvoyId, goal: TileCoord },

    #[error("Reservation denied for {convoy} at route index {index}")]
    ReservationDenied { convoy: ConvoyId, index: usize },

    #[error("Longblock request of {convoy} at signal {signal} timed out")]
    SignalTimeout { convoy: ConvoyId, signal: TileCoord },

    #[error("Cannot couple {follower} behind {leader}: {reason}")]
    CouplingMismatch {
        follower: ConvoyId,
        leader: ConvoyId,
        reason: String,
    },

    #[error("Invalid command for {convoy}: {reason}")]
    InvalidCommand { convoy: ConvoyId, reason: String },

    #[error("Invalid consist: {0}")]
    InvalidConsist(String),

    #[error("Stale or unknown convoy handle {0}")]
    InvalidHandle(ConvoyId),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Scenario error: {0}")]
    Scenario(String),
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
