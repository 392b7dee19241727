//! Coupling relation table.
//!
//! Leader -> followers edges kept outside the convoys, so either side can
//! be destroyed without leaving a dangling back-reference. A convoy takes
//! part in at most one link, as leader or as follower.

use convoy_domain::ConvoyId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Role of a convoy in its coupling link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingRole {
    Leader { follower: ConvoyId },
    Follower { leader: ConvoyId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplingTable {
    followers: BTreeMap<ConvoyId, BTreeSet<ConvoyId>>,
}

impl CouplingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the edge `leader -> follower`. Fails if either is already linked.
    pub fn link(&mut self, leader: ConvoyId, follower: ConvoyId) -> bool {
        if leader == follower || self.partner(leader).is_some() || self.partner(follower).is_some() {
            return false;
        }
        self.followers.entry(leader).or_default().insert(follower);
        true
    }

    /// Remove the link `convoy` takes part in; returns `(leader, follower)`.
    pub fn unlink(&mut self, convoy: ConvoyId) -> Option<(ConvoyId, ConvoyId)> {
        let pair = match self.role(convoy)? {
            CouplingRole::Leader { follower } => (convoy, follower),
            CouplingRole::Follower { leader } => (leader, convoy),
        };
        if let Some(set) = self.followers.get_mut(&pair.0) {
            set.remove(&pair.1);
            if set.is_empty() {
                self.followers.remove(&pair.0);
            }
        }
        Some(pair)
    }

    #[must_use]
    pub fn role(&self, convoy: ConvoyId) -> Option<CouplingRole> {
        if let Some(follower) = self.followers.get(&convoy).and_then(|s| s.iter().next()) {
            return Some(CouplingRole::Leader { follower: *follower });
        }
        self.followers
            .iter()
            .find(|(_, set)| set.contains(&convoy))
            .map(|(leader, _)| CouplingRole::Follower { leader: *leader })
    }

    /// The convoy `convoy` is coupled with, from either side.
    #[must_use]
    pub fn partner(&self, convoy: ConvoyId) -> Option<ConvoyId> {
        self.role(convoy).map(|role| match role {
            CouplingRole::Leader { follower } => follower,
            CouplingRole::Follower { leader } => leader,
        })
    }

    #[must_use]
    pub fn leader_of(&self, convoy: ConvoyId) -> Option<ConvoyId> {
        match self.role(convoy)? {
            CouplingRole::Follower { leader } => Some(leader),
            CouplingRole::Leader { .. } => None,
        }
    }

    #[must_use]
    pub fn follower_of(&self, convoy: ConvoyId) -> Option<ConvoyId> {
        match self.role(convoy)? {
            CouplingRole::Leader { follower } => Some(follower),
            CouplingRole::Follower { .. } => None,
        }
    }

    /// All `(leader, follower)` edges in leader order.
    #[must_use]
    pub fn links(&self) -> Vec<(ConvoyId, ConvoyId)> {
        self.followers
            .iter()
            .flat_map(|(leader, set)| set.iter().map(move |f| (*leader, *f)))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.followers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partner_is_symmetric() {
        let a = ConvoyId::new(0, 0);
        let b = ConvoyId::new(1, 0);
        let mut table = CouplingTable::new();
        assert!(table.link(a, b));
        assert_eq!(table.partner(a), Some(b));
        assert_eq!(table.partner(b), Some(a));
        assert_eq!(table.follower_of(a), Some(b));
        assert_eq!(table.leader_of(b), Some(a));

        assert_eq!(table.unlink(b), Some((a, b)));
        assert_eq!(table.partner(a), None);
        assert_eq!(table.partner(b), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_one_link_per_convoy() {
        let a = ConvoyId::new(0, 0);
        let b = ConvoyId::new(1, 0);
        let c = ConvoyId::new(2, 0);
        let mut table = CouplingTable::new();
        assert!(table.link(a, b));
        assert!(!table.link(a, c));
        assert!(!table.link(c, b));
        assert!(!table.link(c, c));
        assert_eq!(table.links(), vec![(a, b)]);
    }
}
