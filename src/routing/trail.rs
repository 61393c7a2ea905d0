//! Trail State
//!
//! A trail is a path through the overlay, built hop by hop during a random
//! walk. Each node on the path keeps one `Trail` record describing its own
//! hop-segment: the predecessor it heard the walk from and the successor it
//! extended the walk to. Either side may be absent when this node is the
//! origin or the terminal of the walk.
//!
//! Every hop-segment is named by a random identifier shared with the peer on
//! that side. The segment between A and B carries the id A chose when it
//! extended the walk to B; A files it as its successor-side id, B as its
//! predecessor-side id. A trail that passes through us therefore has two
//! independent ids, and the table indexes the trail under both.
//!
//! Trails expire after a fixed lifetime. Expiration deadlines live in a
//! min-heap; entries for trails that were torn down early are simply left in
//! the heap and skipped when they surface (serials are never reused, so a
//! dead entry can never alias a live trail).

use crate::identity::{PeerId, TrailId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

/// Stable local handle for a trail. Never reused within a process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrailSerial(u64);

impl fmt::Display for TrailSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One side of a hop-segment: the neighbor on that side and the identifier
/// the segment is known by between us and that neighbor.
#[derive(Clone, Copy, Debug)]
pub struct TrailSide {
    pub peer: PeerId,
    pub id: TrailId,
}

/// Our hop-segment of one trail.
#[derive(Debug)]
pub struct Trail {
    pub serial: TrailSerial,
    /// Side the walk arrived from. `None` if we originated it.
    pub pred: Option<TrailSide>,
    /// Side we extended the walk to. `None` if it terminated here.
    pub succ: Option<TrailSide>,
    /// Absolute deadline; the trail is torn down when it passes.
    pub expires_at_ms: u64,
    /// `(layer, slot)` of the finger this trail backs, if we originated it.
    pub finger: Option<(u16, usize)>,
}

/// All live trails, indexed by serial and by both segment ids.
#[derive(Default)]
pub struct TrailTable {
    trails: HashMap<TrailSerial, Trail>,
    by_id: HashMap<TrailId, TrailSerial>,
    expiry: BinaryHeap<Reverse<(u64, TrailSerial)>>,
    next_serial: u64,
}

impl TrailTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live trails.
    pub fn len(&self) -> usize {
        self.trails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trails.is_empty()
    }

    /// Create a trail and index it under the ids of its present sides.
    pub fn create(
        &mut self,
        pred: Option<TrailSide>,
        succ: Option<TrailSide>,
        expires_at_ms: u64,
        finger: Option<(u16, usize)>,
    ) -> TrailSerial {
        let serial = TrailSerial(self.next_serial);
        self.next_serial += 1;
        if let Some(side) = &pred {
            self.by_id.insert(side.id, serial);
        }
        if let Some(side) = &succ {
            self.by_id.insert(side.id, serial);
        }
        self.expiry.push(Reverse((expires_at_ms, serial)));
        self.trails.insert(
            serial,
            Trail {
                serial,
                pred,
                succ,
                expires_at_ms,
                finger,
            },
        );
        serial
    }

    pub fn get(&self, serial: TrailSerial) -> Option<&Trail> {
        self.trails.get(&serial)
    }

    pub fn get_mut(&mut self, serial: TrailSerial) -> Option<&mut Trail> {
        self.trails.get_mut(&serial)
    }

    /// Resolve a segment id to its trail serial.
    pub fn serial_of(&self, id: &TrailId) -> Option<TrailSerial> {
        self.by_id.get(id).copied()
    }

    /// Whether any live trail uses this segment id.
    pub fn contains_id(&self, id: &TrailId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Attach the successor side to an existing trail and index its id.
    pub fn set_succ(&mut self, serial: TrailSerial, side: TrailSide) {
        if let Some(trail) = self.trails.get_mut(&serial) {
            debug_assert!(trail.succ.is_none());
            self.by_id.insert(side.id, serial);
            trail.succ = Some(side);
        }
    }

    /// Remove a trail, unindexing both segment ids. The stale expiry-heap
    /// entry is left behind and skipped later.
    pub fn remove(&mut self, serial: TrailSerial) -> Option<Trail> {
        let trail = self.trails.remove(&serial)?;
        if let Some(side) = &trail.pred {
            self.by_id.remove(&side.id);
        }
        if let Some(side) = &trail.succ {
            self.by_id.remove(&side.id);
        }
        Some(trail)
    }

    /// Pop the next trail whose deadline has passed, skipping stale entries
    /// for trails already removed.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<TrailSerial> {
        while let Some(Reverse((deadline, serial))) = self.expiry.peek().copied() {
            if deadline > now_ms {
                return None;
            }
            self.expiry.pop();
            if self.trails.contains_key(&serial) {
                return Some(serial);
            }
        }
        None
    }

    /// Earliest live expiration deadline, discarding stale entries on the way.
    pub fn next_deadline_ms(&mut self) -> Option<u64> {
        while let Some(Reverse((deadline, serial))) = self.expiry.peek().copied() {
            if self.trails.contains_key(&serial) {
                return Some(deadline);
            }
            self.expiry.pop();
        }
        None
    }

    /// Drain every trail, for shutdown.
    pub fn drain_serials(&mut self) -> Vec<TrailSerial> {
        self.trails.keys().copied().collect()
    }
}
