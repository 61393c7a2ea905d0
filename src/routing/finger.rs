//! Finger Tables
//!
//! Each ring layer keeps a table of fingers: trails we originated whose far
//! endpoint gives us a foothold at some location in the keyspace. A finger
//! starts out pending (trail launched, destination unknown) and becomes
//! valid once the walk response reports where the trail terminated.
//!
//! Slots are reused round-robin: the walk cycle keeps a `walk_offset` cursor
//! and tears down whatever occupies the slot before launching a replacement,
//! so the table continuously refreshes itself instead of growing without
//! bound.

use super::trail::TrailSerial;
use crate::identity::Key;
use rand::Rng;

/// One finger: a trail we originated and, once the walk completed, the
/// location it terminated at.
#[derive(Debug)]
pub struct Finger {
    pub trail: TrailSerial,
    /// Terminal location; `None` while the walk is still in flight.
    pub destination: Option<Key>,
}

impl Finger {
    /// A finger is usable for routing once its destination is known.
    pub fn is_valid(&self) -> bool {
        self.destination.is_some()
    }
}

/// The finger table of one ring layer.
pub struct FingerTable {
    slots: Vec<Option<Finger>>,
    /// Occupied slots, valid or pending.
    occupied: usize,
    /// Next slot the walk cycle will (re)fill.
    pub walk_offset: usize,
    /// Destinations sorted for successor lookup; rebuilt lazily.
    sorted: Vec<(Key, TrailSerial)>,
    is_sorted: bool,
}

impl FingerTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            occupied: 0,
            walk_offset: 0,
            sorted: Vec::new(),
            is_sorted: true,
        }
    }

    /// Occupied slots (valid or pending).
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Fingers whose destination is known.
    pub fn valid_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|f| f.is_valid())
            .count()
    }

    pub fn get(&self, slot: usize) -> Option<&Finger> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Place a finger in an empty slot, growing the table if needed.
    pub fn occupy(&mut self, slot: usize, finger: Finger) {
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, || None);
        }
        debug_assert!(self.slots[slot].is_none(), "slot {slot} already occupied");
        self.slots[slot] = Some(finger);
        self.occupied += 1;
        self.is_sorted = false;
    }

    /// Empty a slot, returning the finger that was there.
    pub fn vacate(&mut self, slot: usize) -> Option<Finger> {
        let finger = self.slots.get_mut(slot)?.take()?;
        self.occupied -= 1;
        self.is_sorted = false;
        Some(finger)
    }

    /// Record the terminal location of the slot's finger.
    pub fn set_destination(&mut self, slot: usize, destination: Key) {
        if let Some(Some(finger)) = self.slots.get_mut(slot) {
            finger.destination = Some(destination);
            self.is_sorted = false;
        }
    }

    /// Pick a uniformly random valid finger's destination.
    pub fn random_valid_destination<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Key> {
        let valid: Vec<Key> = self
            .slots
            .iter()
            .flatten()
            .filter_map(|f| f.destination)
            .collect();
        if valid.is_empty() {
            return None;
        }
        Some(valid[rng.gen_range(0..valid.len())])
    }

    /// Trail of the valid finger closest at-or-after `key` on the ring,
    /// wrapping past the top of the keyspace.
    pub fn successor_of(&mut self, key: &Key) -> Option<TrailSerial> {
        self.ensure_sorted();
        if self.sorted.is_empty() {
            return None;
        }
        match self.sorted.binary_search_by(|(k, _)| k.cmp(key)) {
            Ok(i) => Some(self.sorted[i].1),
            Err(i) if i < self.sorted.len() => Some(self.sorted[i].1),
            Err(_) => Some(self.sorted[0].1),
        }
    }

    fn ensure_sorted(&mut self) {
        if self.is_sorted {
            return;
        }
        self.sorted.clear();
        for finger in self.slots.iter().flatten() {
            if let Some(dest) = finger.destination {
                self.sorted.push((dest, finger.trail));
            }
        }
        self.sorted.sort_by(|a, b| a.0.cmp(&b.0));
        self.is_sorted = true;
    }
}

impl Default for FingerTable {
    fn default() -> Self {
        Self::new()
    }
}
