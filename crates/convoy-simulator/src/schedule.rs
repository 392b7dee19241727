//! Cyclic schedules.

use convoy_domain::{DomainError, ScheduleEntry, TileCoord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Journeys remembered per stop
const JOURNEY_SAMPLES: usize = 4;

/// Recent journey times into one stop, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyLog {
    samples: VecDeque<u64>,
}

impl JourneyLog {
    pub fn record(&mut self, ticks: u64) {
        if self.samples.len() == JOURNEY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(ticks);
    }

    #[must_use]
    pub fn average(&self) -> Option<u64> {
        let count = u64::try_from(self.samples.len()).ok().filter(|n| *n > 0)?;
        Some(self.samples.iter().sum::<u64>() / count)
    }
}

/// Ordered stops with a cursor; advancing past the last stop wraps around.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
    current: usize,
    /// Journey times into each stop, by entry index
    #[serde(default)]
    journeys: Vec<JourneyLog>,
}

impl Schedule {
    /// Build a schedule; rejects an empty entry list and loading above 100%.
    pub fn new(entries: Vec<ScheduleEntry>) -> Result<Self, DomainError> {
        if entries.is_empty() {
            return Err(DomainError::EmptySchedule);
        }
        if let Some(bad) = entries.iter().find(|e| e.minimum_loading > 100) {
            return Err(DomainError::InvalidLoading(bad.minimum_loading));
        }
        Ok(Self {
            entries,
            current: 0,
            journeys: Vec::new(),
        })
    }

    /// Stops at the given tiles with no loading requirement.
    pub fn through(tiles: &[TileCoord]) -> Result<Self, DomainError> {
        Self::new(tiles.iter().copied().map(ScheduleEntry::waypoint).collect())
    }

    #[must_use]
    pub fn current_entry(&self) -> Option<&ScheduleEntry> {
        self.entries.get(self.current)
    }

    #[must_use]
    pub fn current_target(&self) -> Option<TileCoord> {
        self.current_entry().map(|e| e.tile)
    }

    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        if !self.entries.is_empty() {
            self.current = (self.current + 1) % self.entries.len();
        }
    }

    /// Point the cursor at `index` (clamped).
    pub fn set_current(&mut self, index: usize) {
        self.current = index.min(self.entries.len().saturating_sub(1));
    }

    #[must_use]
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a journey into the current stop.
    pub fn register_journey_time(&mut self, ticks: u64) {
        if self.journeys.len() < self.entries.len() {
            self.journeys.resize_with(self.entries.len(), JourneyLog::default);
        }
        if let Some(log) = self.journeys.get_mut(self.current) {
            log.record(ticks);
        }
    }

    /// Average journey time into stop `index`, once one was recorded.
    #[must_use]
    pub fn average_journey(&self, index: usize) -> Option<u64> {
        self.journeys.get(index).and_then(JourneyLog::average)
    }

    /// Whether the schedule stops at `tile`.
    #[must_use]
    pub fn contains(&self, tile: TileCoord) -> bool {
        self.entries.iter().any(|e| e.tile == tile)
    }
}
