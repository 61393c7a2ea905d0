//! Trail-Based Overlay Routing Core
//!
//! Maintains this node's view of the overlay: the set of directly connected
//! friends, the trails passing through or anchored at this node, and one
//! finger table per ring layer. A periodic random walk launches trails that
//! become fingers; payloads are then routed hop by hop along established
//! trails.
//!
//! The core is a passive state machine. The host feeds it connectivity
//! events (`on_peer_connect` / `on_peer_disconnect`), inbound datagrams
//! (`handle_datagram`) and clock ticks (`process_timers`); outbound traffic
//! comes out of the packet channel. Nothing here touches sockets or spawns
//! tasks, which keeps the whole state machine deterministic under test.

mod finger;
mod friend;
mod router;
mod trail;
mod walk;

#[cfg(test)]
mod tests;

pub use finger::{Finger, FingerTable};
pub use friend::Friend;
pub use trail::{Trail, TrailSerial, TrailSide, TrailTable};

use crate::config::RoutingConfig;
use crate::identity::{Key, PeerId};
use crate::stats::RoutingStats;
use crate::wire::{ControlMessage, WireError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ============================================================================
// Outbound Packet Channel
// ============================================================================

/// A datagram queued for delivery to a directly connected peer.
#[derive(Debug)]
pub struct OutboundPacket {
    pub dest: PeerId,
    pub data: Vec<u8>,
}

pub type PacketTx = mpsc::UnboundedSender<OutboundPacket>;
pub type PacketRx = mpsc::UnboundedReceiver<OutboundPacket>;

/// Create the outbound packet channel connecting the core to the underlay.
///
/// The sender side is unbounded so the core can queue packets from within
/// message handlers without re-entering itself; the host drains the receiver
/// and hands packets to the transport.
pub fn packet_channel() -> (PacketTx, PacketRx) {
    mpsc::unbounded_channel()
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Content store the routing core delegates terminal payloads to.
///
/// Calls into the cache never call back into the core synchronously. When a
/// request needs an answer sent along a trail, the cache records the
/// `TrailSerial` it was handed and the host later calls
/// [`RoutingCore::send_get_result`] with it.
pub trait ContentCache {
    /// A random key from the local store, used to answer layer-0 walks.
    fn get_random_key(&mut self) -> Option<Key>;

    /// A trail terminated here asking for the successors of `key`.
    fn find_successor(&mut self, trail: TrailSerial, key: Key);

    /// A lookup for `key` terminated here.
    fn handle_get(&mut self, trail: TrailSerial, key: Key);

    /// A store request for `key` terminated here. `path` is the route the
    /// request took, oldest hop first, when path recording was on.
    fn handle_put(&mut self, key: Key, expiration_ms: u64, path: &[PeerId], value: &[u8]);

    /// A lookup result arrived for a request this node originated.
    fn deliver_result(&mut self, key: Key, expiration_ms: u64, put_path: &[PeerId], value: &[u8]);
}

/// Source of the current network-size estimate, which bounds walk lengths.
pub trait SizeEstimator {
    /// Estimated number of peers in the network. Implementations should
    /// return at least 1.
    fn estimate(&self) -> u64;
}

// ============================================================================
// Errors
// ============================================================================

/// Failures while processing an inbound event.
///
/// All of these are attributable to the remote peer; the core's own state
/// stays consistent and the host may disconnect or de-prioritize the sender.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("malformed message from {peer}: {source}")]
    Wire {
        peer: PeerId,
        #[source]
        source: WireError,
    },

    #[error("protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: &'static str },

    #[error("message from unconnected peer {0}")]
    UnknownPeer(PeerId),
}

// ============================================================================
// Routing Core
// ============================================================================

/// The overlay routing state machine for one node.
pub struct RoutingCore {
    my_id: PeerId,
    config: RoutingConfig,
    packet_tx: PacketTx,
    friends: HashMap<PeerId, Friend>,
    trails: TrailTable,
    /// One finger table per ring layer.
    fingers: Vec<FingerTable>,
    /// Layer the next walk will refresh.
    walk_layer: u16,
    /// Deadline of the next random walk; `None` while no friends exist.
    next_walk_at_ms: Option<u64>,
    cache: Box<dyn ContentCache>,
    estimator: Box<dyn SizeEstimator>,
    rng: StdRng,
    stats: RoutingStats,
}

impl RoutingCore {
    pub fn new(
        my_id: PeerId,
        config: RoutingConfig,
        packet_tx: PacketTx,
        cache: Box<dyn ContentCache>,
        estimator: Box<dyn SizeEstimator>,
    ) -> Self {
        Self::with_rng(
            my_id,
            config,
            packet_tx,
            cache,
            estimator,
            StdRng::from_entropy(),
        )
    }

    /// Construct with an explicit RNG, for deterministic tests.
    pub fn with_rng(
        my_id: PeerId,
        config: RoutingConfig,
        packet_tx: PacketTx,
        cache: Box<dyn ContentCache>,
        estimator: Box<dyn SizeEstimator>,
        rng: StdRng,
    ) -> Self {
        let layers = config.layers() as usize;
        Self {
            my_id,
            config,
            packet_tx,
            friends: HashMap::new(),
            trails: TrailTable::new(),
            fingers: (0..layers).map(|_| FingerTable::new()).collect(),
            walk_layer: 0,
            next_walk_at_ms: None,
            cache,
            estimator,
            rng,
            stats: RoutingStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn my_id(&self) -> PeerId {
        self.my_id
    }

    pub fn friend_count(&self) -> usize {
        self.friends.len()
    }

    pub fn trail_count(&self) -> usize {
        self.trails.len()
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    /// Finger table of one layer, if the layer exists.
    pub fn finger_table(&self, layer: u16) -> Option<&FingerTable> {
        self.fingers.get(layer as usize)
    }

    /// Trail of the valid finger closest at-or-after `key` in a layer.
    pub fn closest_finger(&mut self, layer: u16, key: &Key) -> Option<TrailSerial> {
        self.fingers.get_mut(layer as usize)?.successor_of(key)
    }

    // ------------------------------------------------------------------
    // Connectivity Events
    // ------------------------------------------------------------------

    /// The underlay established a connection to `peer`.
    pub fn on_peer_connect(&mut self, peer: PeerId, now_ms: u64) {
        if peer == self.my_id {
            debug!("ignoring connect event for ourselves");
            return;
        }
        if self.friends.contains_key(&peer) {
            warn!(%peer, "duplicate connect event, ignoring");
            return;
        }
        info!(%peer, "peer connected");
        self.friends
            .insert(peer, Friend::new(peer, self.packet_tx.clone()));

        // First friend: the walk cycle can start.
        if self.next_walk_at_ms.is_none() {
            self.next_walk_at_ms = Some(now_ms);
        }
    }

    /// The underlay lost the connection to `peer`. Every trail through the
    /// peer dies; the side that is still reachable gets notified.
    pub fn on_peer_disconnect(&mut self, peer: PeerId) {
        let Some(friend) = self.friends.remove(&peer) else {
            warn!(%peer, "disconnect event for unknown peer, ignoring");
            return;
        };
        info!(%peer, trails = friend.trail_count(), "peer disconnected");

        for serial in friend.succ_trails {
            self.delete_trail(serial, true, false);
        }
        for serial in friend.pred_trails {
            self.delete_trail(serial, false, true);
        }

        if self.friends.is_empty() {
            self.next_walk_at_ms = None;
        }
    }

    // ------------------------------------------------------------------
    // Trail Teardown
    // ------------------------------------------------------------------

    /// Tear down a trail. The single choke-point for all teardowns: unlinks
    /// the trail from both friends, notifies the requested sides with the id
    /// each side knows the segment by, and vacates any finger it backed.
    ///
    /// Calling with a serial that is already gone is a no-op, so racing
    /// teardowns are safe.
    pub fn delete_trail(&mut self, serial: TrailSerial, inform_pred: bool, inform_succ: bool) {
        let Some(trail) = self.trails.remove(serial) else {
            return;
        };
        debug!(%serial, "deleting trail");

        if let Some(side) = trail.pred {
            if let Some(friend) = self.friends.get_mut(&side.peer) {
                friend.pred_trails.remove(&serial);
                if inform_pred {
                    friend.send(&ControlMessage::TrailDestroy { trail_id: side.id });
                }
            }
        }
        if let Some(side) = trail.succ {
            if let Some(friend) = self.friends.get_mut(&side.peer) {
                friend.succ_trails.remove(&serial);
                if inform_succ {
                    friend.send(&ControlMessage::TrailDestroy { trail_id: side.id });
                }
            }
        }
        if let Some((layer, slot)) = trail.finger {
            if let Some(ft) = self.fingers.get_mut(layer as usize) {
                ft.vacate(slot);
            }
        }
        self.stats.trails_destroyed += 1;
    }

    /// A neighbor told us a trail segment died. Drop our segment and pass
    /// the notification to the opposite side.
    fn handle_trail_destroy(
        &mut self,
        sender: PeerId,
        trail_id: crate::identity::TrailId,
    ) -> Result<(), RoutingError> {
        let Some(serial) = self.trails.serial_of(&trail_id) else {
            // Both ends can initiate teardown concurrently.
            debug!(%sender, %trail_id, "destroy for unknown trail, ignoring");
            self.stats.benign_races += 1;
            return Ok(());
        };
        let Some(trail) = self.trails.get(serial) else {
            return Ok(());
        };

        let from_pred = matches!(&trail.pred, Some(s) if s.peer == sender && s.id == trail_id);
        let from_succ = matches!(&trail.succ, Some(s) if s.peer == sender && s.id == trail_id);
        if from_pred {
            self.delete_trail(serial, false, true);
        } else if from_succ {
            self.delete_trail(serial, true, false);
        } else {
            self.stats.protocol_violations += 1;
            return Err(RoutingError::ProtocolViolation {
                peer: sender,
                reason: "trail destroy from peer not on the trail",
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound Dispatch
    // ------------------------------------------------------------------

    /// Process one datagram received from a directly connected peer.
    pub fn handle_datagram(
        &mut self,
        sender: PeerId,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), RoutingError> {
        if !self.friends.contains_key(&sender) {
            return Err(RoutingError::UnknownPeer(sender));
        }
        let msg = match ControlMessage::decode(data) {
            Ok(msg) => msg,
            Err(source) => {
                self.stats.protocol_violations += 1;
                return Err(RoutingError::Wire { peer: sender, source });
            }
        };
        match msg {
            ControlMessage::RandomWalk {
                hops_taken,
                layer,
                trail_id,
            } => self.handle_random_walk(sender, hops_taken, layer, trail_id, now_ms),
            ControlMessage::RandomWalkResponse { trail_id, location } => {
                self.handle_random_walk_response(sender, trail_id, location)
            }
            ControlMessage::TrailDestroy { trail_id } => {
                self.handle_trail_destroy(sender, trail_id)
            }
            ControlMessage::TrailRoute {
                record_path,
                path,
                trail_id,
                payload,
            } => self.handle_trail_route(sender, record_path, path, trail_id, &payload),
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run every timer whose deadline has passed. The host calls this when
    /// [`next_wakeup_ms`](Self::next_wakeup_ms) elapses.
    pub fn process_timers(&mut self, now_ms: u64) {
        while let Some(serial) = self.trails.pop_due(now_ms) {
            debug!(%serial, "trail expired");
            self.stats.trails_expired += 1;
            self.delete_trail(serial, true, true);
        }
        if let Some(at) = self.next_walk_at_ms {
            if at <= now_ms {
                self.do_random_walk(now_ms);
            }
        }
    }

    /// Earliest deadline among all pending timers, or `None` when idle.
    pub fn next_wakeup_ms(&mut self) -> Option<u64> {
        match (self.next_walk_at_ms, self.trails.next_deadline_ms()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Tear down all state, notifying neighbors about every trail.
    pub fn shutdown(&mut self) {
        info!(trails = self.trails.len(), "shutting down routing core");
        for serial in self.trails.drain_serials() {
            self.delete_trail(serial, true, true);
        }
        self.friends.clear();
        self.next_walk_at_ms = None;
    }
}
