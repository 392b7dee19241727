//! Generational arena holding the live convoys.
//!
//! Handles are `ConvoyId { index, generation }`; a slot's generation is
//! bumped on removal so an old handle never resolves to a new occupant.
//! Iteration is always in slot order, which is the deterministic processing
//! order of the step loop.

use crate::error::{Result, SimError};
use convoy_domain::ConvoyId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
    /// Value temporarily moved out by `take`; the slot is still live.
    checked_out: bool,
}

/// Slot vector with generation-checked handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value built from its future handle.
    pub fn insert_with(&mut self, build: impl FnOnce(ConvoyId) -> T) -> ConvoyId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let id = ConvoyId::new(index, slot.generation);
            slot.value = Some(build(id));
            slot.checked_out = false;
            return id;
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        let id = ConvoyId::new(index, 0);
        self.slots.push(Slot {
            generation: 0,
            value: Some(build(id)),
            checked_out: false,
        });
        id
    }

    fn slot(&self, id: ConvoyId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: ConvoyId) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    /// True while the handle refers to a live value, even if it is checked out.
    #[must_use]
    pub fn is_live(&self, id: ConvoyId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.value.is_some() || slot.checked_out)
    }

    #[must_use]
    pub fn get(&self, id: ConvoyId) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: ConvoyId) -> Option<&mut T> {
        self.slot_mut(id).and_then(|slot| slot.value.as_mut())
    }

    /// Like `get`, failing with `InvalidHandle` on a stale id.
    pub fn resolve(&self, id: ConvoyId) -> Result<&T> {
        self.get(id).ok_or(SimError::InvalidHandle(id))
    }

    pub fn resolve_mut(&mut self, id: ConvoyId) -> Result<&mut T> {
        self.get_mut(id).ok_or(SimError::InvalidHandle(id))
    }

    /// Move a value out while keeping its handle live; pair with `put_back`.
    pub fn take(&mut self, id: ConvoyId) -> Option<T> {
        let slot = self.slot_mut(id)?;
        let value = slot.value.take()?;
        slot.checked_out = true;
        Some(value)
    }

    pub fn put_back(&mut self, id: ConvoyId, value: T) {
        if let Some(slot) = self.slot_mut(id) {
            slot.value = Some(value);
            slot.checked_out = false;
        }
    }

    /// Remove a value and retire its handle.
    pub fn remove(&mut self, id: ConvoyId) -> Option<T> {
        let slot = self.slot_mut(id)?;
        if slot.value.is_none() && !slot.checked_out {
            return None;
        }
        let value = slot.value.take();
        slot.checked_out = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        value
    }

    /// Live handles in slot order, including checked-out values.
    #[must_use]
    pub fn ids(&self) -> Vec<ConvoyId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some() || slot.checked_out)
            .filter_map(|(i, slot)| {
                u32::try_from(i)
                    .ok()
                    .map(|index| ConvoyId::new(index, slot.generation))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConvoyId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            let index = u32::try_from(i).ok()?;
            slot.value
                .as_ref()
                .map(|value| (ConvoyId::new(index, slot.generation), value))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value.is_some() || slot.checked_out)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut arena = Arena::new();
        let a = arena.insert_with(|_| "a");
        assert_eq!(arena.remove(a), Some("a"));

        let b = arena.insert_with(|_| "b");
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(arena.get(a).is_none());
        assert!(matches!(arena.resolve(a), Err(SimError::InvalidHandle(id)) if id == a));
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn test_insert_with_sees_own_handle() {
        let mut arena = Arena::new();
        let id = arena.insert_with(|id| id);
        assert_eq!(arena.get(id), Some(&id));
    }

    #[test]
    fn test_take_keeps_handle_live() {
        let mut arena = Arena::new();
        let id = arena.insert_with(|_| 7);
        let value = arena.take(id).unwrap();
        assert!(arena.is_live(id));
        assert!(arena.get(id).is_none());
        assert_eq!(arena.ids(), vec![id]);
        arena.put_back(id, value + 1);
        assert_eq!(arena.get(id), Some(&8));
    }

    #[test]
    fn test_ids_in_slot_order() {
        let mut arena = Arena::new();
        let a = arena.insert_with(|_| 1);
        let b = arena.insert_with(|_| 2);
        let c = arena.insert_with(|_| 3);
        arena.remove(b);
        let d = arena.insert_with(|_| 4);
        assert_eq!(arena.ids(), vec![a, d, c]);
        assert_eq!(arena.len(), 3);
    }
}
