//! Cargo waiting at stations.

use convoy_domain::StationId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationBoard {
    waiting: BTreeMap<StationId, u32>,
}

impl StationBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cargo(&mut self, station: StationId, amount: u32) {
        let entry = self.waiting.entry(station).or_default();
        *entry = entry.saturating_add(amount);
    }

    #[must_use]
    pub fn waiting(&self, station: StationId) -> u32 {
        self.waiting.get(&station).copied().unwrap_or(0)
    }

    /// Remove up to `max` units; returns how many were taken.
    pub fn take(&mut self, station: StationId, max: u32) -> u32 {
        let Some(entry) = self.waiting.get_mut(&station) else {
            return 0;
        };
        let taken = (*entry).min(max);
        *entry -= taken;
        taken
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StationId, &u32)> {
        self.waiting.iter()
    }
}
