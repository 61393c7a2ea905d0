//! Random Walk Engine
//!
//! Fingers are discovered by random walks: we hand a walk to a random
//! friend, each hop extends it to another random friend, and once the walk
//! has taken about log2(network size) hops the final node reports a keyspace
//! location back along the freshly built trail. That trail then serves as
//! the finger to the reported location.
//!
//! Walks cycle through layers round-robin, and within a layer through
//! finger slots round-robin, so every finger is periodically refreshed. A
//! walk for layer N terminates at a location sampled from the terminal
//! node's layer N-1 fingers; layer-0 walks sample the terminal node's
//! content store. This couples the layers into progressively better mixed
//! rings.

use super::finger::Finger;
use super::trail::TrailSide;
use super::{RoutingCore, RoutingError};
use crate::identity::{Key, PeerId, TrailId};
use crate::wire::ControlMessage;
use rand::Rng;
use tracing::{debug, warn};

impl RoutingCore {
    /// Hops a walk must take before terminating: log2 of the current
    /// network-size estimate. With an estimate of 1 the budget is zero and
    /// walks terminate at their first recipient.
    fn hop_budget(&self) -> u16 {
        let estimate = self.estimator.estimate().max(1);
        estimate.ilog2() as u16
    }

    /// Pick a uniformly random friend.
    fn random_friend(&mut self) -> Option<PeerId> {
        if self.friends.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.friends.len());
        self.friends.keys().nth(idx).copied()
    }

    /// Launch one random walk for the current layer and advance the cycle.
    pub(super) fn do_random_walk(&mut self, now_ms: u64) {
        self.next_walk_at_ms = Some(now_ms + self.config.walk_interval_ms());
        let Some(peer) = self.random_friend() else {
            return;
        };

        let layer = self.walk_layer;
        let slot = self.fingers[layer as usize].walk_offset;

        // Recycle whatever finger occupies the slot; its trail teardown
        // vacates the slot for us.
        if let Some(old_serial) = self.fingers[layer as usize].get(slot).map(|f| f.trail) {
            self.delete_trail(old_serial, false, true);
        }
        debug_assert!(self.fingers[layer as usize].get(slot).is_none());

        let trail_id = TrailId::random(&mut self.rng);
        let serial = self.trails.create(
            None,
            Some(TrailSide { peer, id: trail_id }),
            now_ms + self.config.trail_timeout_ms(),
            Some((layer, slot)),
        );
        self.stats.trails_created += 1;

        if let Some(friend) = self.friends.get_mut(&peer) {
            friend.succ_trails.insert(serial);
            friend.send(&ControlMessage::RandomWalk {
                hops_taken: 0,
                layer,
                trail_id,
            });
        }

        let ft = &mut self.fingers[layer as usize];
        ft.occupy(
            slot,
            Finger {
                trail: serial,
                destination: None,
            },
        );
        ft.walk_offset = (slot + 1) % self.config.fingers_per_layer();
        self.walk_layer = (layer + 1) % self.config.layers();
        self.stats.walks_launched += 1;
        debug!(%peer, layer, slot, %serial, "launched random walk");
    }

    /// A walk arrived from a neighbor: either terminate it and report a
    /// location, or extend it to another random friend.
    pub(super) fn handle_random_walk(
        &mut self,
        sender: PeerId,
        hops_taken: u16,
        layer: u16,
        trail_id: TrailId,
        now_ms: u64,
    ) -> Result<(), RoutingError> {
        if layer >= self.config.layers() {
            self.stats.protocol_violations += 1;
            return Err(RoutingError::ProtocolViolation {
                peer: sender,
                reason: "walk layer out of range",
            });
        }
        if self.trails.contains_id(&trail_id) {
            self.stats.protocol_violations += 1;
            return Err(RoutingError::ProtocolViolation {
                peer: sender,
                reason: "walk carries an id already in use",
            });
        }

        let serial = self.trails.create(
            Some(TrailSide {
                peer: sender,
                id: trail_id,
            }),
            None,
            now_ms + self.config.trail_timeout_ms(),
            None,
        );
        self.stats.trails_created += 1;
        if let Some(friend) = self.friends.get_mut(&sender) {
            friend.pred_trails.insert(serial);
        }

        if hops_taken >= self.hop_budget() {
            // Terminate: sample a location for the walk's origin.
            let location = self
                .sample_location(layer)
                .unwrap_or_else(|| Key::random(&mut self.rng));
            debug!(%sender, layer, hops_taken, %location, "terminating walk");
            if let Some(friend) = self.friends.get(&sender) {
                friend.send(&ControlMessage::RandomWalkResponse { trail_id, location });
            }
            return Ok(());
        }

        // Extend to a random friend (possibly back to the sender).
        let Some(next) = self.random_friend() else {
            return Ok(());
        };
        let succ_id = TrailId::random(&mut self.rng);
        self.trails.set_succ(
            serial,
            TrailSide {
                peer: next,
                id: succ_id,
            },
        );
        if let Some(friend) = self.friends.get_mut(&next) {
            friend.succ_trails.insert(serial);
            friend.send(&ControlMessage::RandomWalk {
                hops_taken: hops_taken + 1,
                layer,
                trail_id: succ_id,
            });
        }
        Ok(())
    }

    /// The location a terminating walk for `layer` reports: a random key
    /// from the content store for layer 0, a random valid finger destination
    /// from the layer below otherwise.
    fn sample_location(&mut self, layer: u16) -> Option<Key> {
        if layer == 0 {
            self.cache.get_random_key()
        } else {
            self.fingers[(layer - 1) as usize].random_valid_destination(&mut self.rng)
        }
    }

    /// A walk response travelling back toward the origin. Relay it if this
    /// node is an intermediate hop, otherwise complete the finger.
    pub(super) fn handle_random_walk_response(
        &mut self,
        sender: PeerId,
        trail_id: TrailId,
        location: Key,
    ) -> Result<(), RoutingError> {
        let Some(serial) = self.trails.serial_of(&trail_id) else {
            // The trail may have expired while the walk was in flight.
            debug!(%sender, %trail_id, "response for unknown trail, ignoring");
            self.stats.benign_races += 1;
            return Ok(());
        };
        let Some(trail) = self.trails.get(serial) else {
            return Ok(());
        };
        let from_succ = matches!(&trail.succ, Some(s) if s.peer == sender && s.id == trail_id);
        if !from_succ {
            self.stats.protocol_violations += 1;
            return Err(RoutingError::ProtocolViolation {
                peer: sender,
                reason: "walk response from the wrong trail side",
            });
        }
        let pred = trail.pred;
        let finger = trail.finger;

        if let Some(pred) = pred {
            if let Some(friend) = self.friends.get(&pred.peer) {
                friend.send(&ControlMessage::RandomWalkResponse {
                    trail_id: pred.id,
                    location,
                });
            }
            return Ok(());
        }

        // We originated the walk; the trail must still back its finger slot.
        let valid_slot = finger.and_then(|(layer, slot)| {
            let finger = self.fingers.get(layer as usize)?.get(slot)?;
            (finger.trail == serial).then_some((layer, slot))
        });
        match valid_slot {
            Some((layer, slot)) => {
                self.fingers[layer as usize].set_destination(slot, location);
                self.stats.fingers_completed += 1;
                debug!(layer, slot, %location, "finger completed");
            }
            None => {
                warn!(%serial, "walk response for a trail with no finger slot");
                self.delete_trail(serial, false, true);
            }
        }
        Ok(())
    }
}
