//! # Simulation Configuration
//!
//! Tunables for the step loop, read from `CONVOY_*` environment variables
//! with defaults for everything.

use std::env;

/// Simulation tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Ticks in one in-game month (finance rollover, backoff tier length)
    pub ticks_per_month: u32,

    /// Signals the block reserver looks past in one request
    pub reservation_signal_count: usize,

    /// Hard cap on tiles claimed ahead of the front vehicle
    pub max_lookahead_tiles: usize,

    /// Base retry delay after a denied can-enter query
    pub backoff_base_ticks: u32,

    /// Signals a granted longblock request may span
    pub longblock_span_signals: usize,

    /// Age after which an undecided longblock request counts as denied
    pub longblock_timeout_ticks: u64,

    /// Maximum gap between follower front and leader rear when coupling
    pub coupling_distance_tolerance_tiles: usize,

    /// Ticks a follower may take to close the gap to its leader
    pub default_coupling_delay_tolerance_ticks: u64,

    /// Steps per tick a follower creeps while closing the coupling gap
    pub coupling_approach_steps: u32,

    /// Tiles of clear passing lane required to start overtaking
    pub overtake_clearance_tiles: usize,

    /// Tiles a yielding road convoy stays pinned to the traffic lane
    pub yield_distance_tiles: usize,

    /// Ticks an unacknowledged lane change request stays alive
    pub lane_request_timeout_ticks: u64,

    /// Ticks between two loading attempts at a station
    pub loading_interval_ticks: u32,

    /// Tiles before a level crossing at which a train with a block claim
    /// over it reserves the crossing
    pub crossing_lookahead_tiles: usize,

    /// Ticks a journey may exceed its average before the convoy runs in
    /// delay recovery
    pub delay_recovery_margin_ticks: u64,

    /// Left-hand traffic
    pub drive_left: bool,

    /// Revenue per cargo unit and tile travelled
    pub revenue_per_unit_tile: i64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ticks_per_month: 2048,
            reservation_signal_count: 1,
            max_lookahead_tiles: 64,
            backoff_base_ticks: 4,
            longblock_span_signals: 4,
            longblock_timeout_ticks: 64,
            coupling_distance_tolerance_tiles: 3,
            default_coupling_delay_tolerance_ticks: 256,
            coupling_approach_steps: 32,
            overtake_clearance_tiles: 4,
            yield_distance_tiles: 3,
            lane_request_timeout_ticks: 32,
            loading_interval_ticks: 8,
            crossing_lookahead_tiles: 4,
            delay_recovery_margin_ticks: 32,
            drive_left: false,
            revenue_per_unit_tile: 3,
        }
    }
}

impl SimConfig {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ticks_per_month: parse_var("CONVOY_TICKS_PER_MONTH", d.ticks_per_month).max(1),
            reservation_signal_count: parse_var(
                "CONVOY_RESERVATION_SIGNAL_COUNT",
                d.reservation_signal_count,
            )
            .max(1),
            max_lookahead_tiles: parse_var("CONVOY_MAX_LOOKAHEAD_TILES", d.max_lookahead_tiles)
                .max(1),
            backoff_base_ticks: parse_var("CONVOY_BACKOFF_BASE_TICKS", d.backoff_base_ticks),
            longblock_span_signals: parse_var(
                "CONVOY_LONGBLOCK_SPAN_SIGNALS",
                d.longblock_span_signals,
            )
            .max(1),
            longblock_timeout_ticks: parse_var(
                "CONVOY_LONGBLOCK_TIMEOUT_TICKS",
                d.longblock_timeout_ticks,
            ),
            coupling_distance_tolerance_tiles: parse_var(
                "CONVOY_COUPLING_DISTANCE_TOLERANCE_TILES",
                d.coupling_distance_tolerance_tiles,
            ),
            default_coupling_delay_tolerance_ticks: parse_var(
                "CONVOY_COUPLING_DELAY_TOLERANCE_TICKS",
                d.default_coupling_delay_tolerance_ticks,
            ),
            coupling_approach_steps: parse_var(
                "CONVOY_COUPLING_APPROACH_STEPS",
                d.coupling_approach_steps,
            )
            .max(1),
            overtake_clearance_tiles: parse_var(
                "CONVOY_OVERTAKE_CLEARANCE_TILES",
                d.overtake_clearance_tiles,
            ),
            yield_distance_tiles: parse_var("CONVOY_YIELD_DISTANCE_TILES", d.yield_distance_tiles),
            lane_request_timeout_ticks: parse_var(
                "CONVOY_LANE_REQUEST_TIMEOUT_TICKS",
                d.lane_request_timeout_ticks,
            ),
            loading_interval_ticks: parse_var(
                "CONVOY_LOADING_INTERVAL_TICKS",
                d.loading_interval_ticks,
            ),
            crossing_lookahead_tiles: parse_var(
                "CONVOY_CROSSING_LOOKAHEAD_TILES",
                d.crossing_lookahead_tiles,
            ),
            delay_recovery_margin_ticks: parse_var(
                "CONVOY_DELAY_RECOVERY_MARGIN_TICKS",
                d.delay_recovery_margin_ticks,
            ),
            drive_left: env::var("CONVOY_DRIVE_LEFT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(d.drive_left),
            revenue_per_unit_tile: parse_var(
                "CONVOY_REVENUE_PER_UNIT_TILE",
                d.revenue_per_unit_tile,
            ),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = SimConfig::default();
        assert!(config.ticks_per_month > 0);
        assert!(config.reservation_signal_count >= 1);
        assert!(config.max_lookahead_tiles >= config.overtake_clearance_tiles);
        assert!(!config.drive_left);
    }

    #[test]
    fn test_parse_var_falls_back() {
        assert_eq!(parse_var("CONVOY_TEST_UNSET_VARIABLE", 17_u32), 17);
    }
}
