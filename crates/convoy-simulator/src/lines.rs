//! Lines: named groups of convoys sharing a schedule.

use crate::schedule::Schedule;
use convoy_domain::{ConvoyId, LineId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub name: String,
    pub schedule: Schedule,
    pub convoys: BTreeSet<ConvoyId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRegistry {
    lines: BTreeMap<LineId, Line>,
    next_id: u32,
}

impl LineRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_line(&mut self, name: impl Into<String>, schedule: Schedule) -> LineId {
        let id = LineId(self.next_id);
        self.next_id += 1;
        self.lines.insert(
            id,
            Line {
                name: name.into(),
                schedule,
                convoys: BTreeSet::new(),
            },
        );
        id
    }

    #[must_use]
    pub fn get(&self, id: LineId) -> Option<&Line> {
        self.lines.get(&id)
    }

    /// Attach a convoy; returns the line schedule it should adopt.
    pub fn attach(&mut self, id: LineId, convoy: ConvoyId) -> Option<Schedule> {
        let line = self.lines.get_mut(&id)?;
        line.convoys.insert(convoy);
        Some(line.schedule.clone())
    }

    pub fn detach(&mut self, id: LineId, convoy: ConvoyId) {
        if let Some(line) = self.lines.get_mut(&id) {
            line.convoys.remove(&convoy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::TileCoord;

    #[test]
    fn test_attach_detach() {
        let mut lines = LineRegistry::new();
        let schedule = Schedule::through(&[TileCoord::new(1, 1, 0)]).unwrap();
        let id = lines.add_line("Blue", schedule.clone());
        let convoy = ConvoyId::new(0, 0);

        assert_eq!(lines.attach(id, convoy), Some(schedule));
        assert!(lines.get(id).unwrap().convoys.contains(&convoy));
        lines.detach(id, convoy);
        assert!(lines.get(id).unwrap().convoys.is_empty());
        assert!(lines.attach(LineId(99), convoy).is_none());
    }
}
