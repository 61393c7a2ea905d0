//! Trail Message Routing
//!
//! Once a trail exists, payloads flow along it in either direction. Each
//! hop looks the segment id up, checks which side the message came from,
//! and hands it to the opposite side; at an endpoint the payload is
//! dispatched to the content store.
//!
//! Routes can record the path they take. If appending a hop would push the
//! message past the datagram size limit, path recording is dropped for the
//! rest of the journey rather than losing the message.

use super::trail::{TrailSerial, TrailSide};
use super::{RoutingCore, RoutingError};
use crate::identity::{Key, PeerId, TrailId};
use crate::wire::{trail_route_size, ControlMessage, TrailPayload, MAX_MESSAGE_SIZE};
use tracing::{debug, warn};

impl RoutingCore {
    /// An in-trail message arrived from a neighbor: relay it to the other
    /// side of our segment, or dispatch it if the trail ends here.
    pub(super) fn handle_trail_route(
        &mut self,
        sender: PeerId,
        record_path: bool,
        path: Vec<PeerId>,
        trail_id: TrailId,
        payload_bytes: &[u8],
    ) -> Result<(), RoutingError> {
        if !record_path && !path.is_empty() {
            self.stats.protocol_violations += 1;
            return Err(RoutingError::ProtocolViolation {
                peer: sender,
                reason: "path present without path recording",
            });
        }
        let Some(serial) = self.trails.serial_of(&trail_id) else {
            // Teardown and in-flight traffic race routinely.
            debug!(%sender, %trail_id, "route for unknown trail, ignoring");
            self.stats.benign_races += 1;
            return Ok(());
        };
        let Some(trail) = self.trails.get(serial) else {
            return Ok(());
        };
        let from_pred = matches!(&trail.pred, Some(s) if s.peer == sender && s.id == trail_id);
        let from_succ = matches!(&trail.succ, Some(s) if s.peer == sender && s.id == trail_id);
        let onward = if from_pred {
            trail.succ
        } else if from_succ {
            trail.pred
        } else {
            self.stats.protocol_violations += 1;
            return Err(RoutingError::ProtocolViolation {
                peer: sender,
                reason: "route from peer not on the trail",
            });
        };

        match onward {
            Some(next) => {
                // Transit hop: the payload stays opaque. Its declared length
                // was already checked against the datagram on decode; the
                // payload type only matters where the trail ends.
                self.forward_on_trail(next, record_path, path, Some(sender), payload_bytes.to_vec());
            }
            None => {
                let payload = match TrailPayload::decode(payload_bytes) {
                    Ok(payload) => payload,
                    Err(source) => {
                        self.stats.protocol_violations += 1;
                        return Err(RoutingError::Wire {
                            peer: sender,
                            source,
                        });
                    }
                };
                let mut full_path = path;
                if record_path {
                    full_path.push(sender);
                }
                self.dispatch_payload(serial, full_path, payload);
            }
        }
        Ok(())
    }

    /// Send a payload along one hop of a trail, maintaining the recorded
    /// path. When appending `append_hop` would exceed the datagram limit,
    /// path recording degrades to off instead of dropping the message.
    fn forward_on_trail(
        &mut self,
        to: TrailSide,
        record_path: bool,
        mut path: Vec<PeerId>,
        append_hop: Option<PeerId>,
        payload: Vec<u8>,
    ) {
        let mut record_path = record_path;
        if record_path {
            if let Some(hop) = append_hop {
                path.push(hop);
            }
            if trail_route_size(path.len(), payload.len()) > MAX_MESSAGE_SIZE {
                debug!(hops = path.len(), "recorded path overflows datagram, dropping path");
                record_path = false;
                path.clear();
            }
        } else {
            path.clear();
        }
        if trail_route_size(path.len(), payload.len()) > MAX_MESSAGE_SIZE {
            warn!(size = payload.len(), "payload exceeds datagram limit, dropping");
            return;
        }
        let Some(friend) = self.friends.get(&to.peer) else {
            warn!(peer = %to.peer, "trail side not connected, dropping message");
            return;
        };
        friend.send(&ControlMessage::TrailRoute {
            record_path,
            path,
            trail_id: to.id,
            payload,
        });
        self.stats.messages_forwarded += 1;
    }

    /// Hand a payload that terminated here to the content store.
    fn dispatch_payload(&mut self, trail: TrailSerial, path: Vec<PeerId>, payload: TrailPayload) {
        self.stats.payloads_dispatched += 1;
        match payload {
            TrailPayload::FindSuccessor { key } => self.cache.find_successor(trail, key),
            TrailPayload::Get { key } => self.cache.handle_get(trail, key),
            TrailPayload::Put {
                key,
                expiration_ms,
                value,
            } => self.cache.handle_put(key, expiration_ms, &path, &value),
            TrailPayload::GetResult {
                key,
                expiration_ms,
                put_path,
                value,
            } => self
                .cache
                .deliver_result(key, expiration_ms, &put_path, &value),
        }
    }

    // ------------------------------------------------------------------
    // Local Origination
    // ------------------------------------------------------------------

    /// Send a payload from this end of a trail toward the other end.
    ///
    /// Only works at an endpoint; a trail that merely passes through this
    /// node has no local direction to originate in.
    pub fn route_on_trail(&mut self, trail: TrailSerial, record_path: bool, payload: &TrailPayload) {
        let Some(t) = self.trails.get(trail) else {
            warn!(%trail, "route on unknown trail, ignoring");
            return;
        };
        let onward = match (t.pred, t.succ) {
            (None, Some(succ)) => succ,
            (Some(pred), None) => pred,
            _ => {
                warn!(%trail, "cannot originate on a transit trail");
                return;
            }
        };
        self.forward_on_trail(onward, record_path, Vec::new(), None, payload.encode());
    }

    /// Send a lookup result back toward the origin of the trail, typically
    /// in response to a `Get` or `FindSuccessor` the content store was
    /// handed earlier. If this node itself originated the request, the
    /// result is delivered locally.
    pub fn send_get_result(
        &mut self,
        trail: TrailSerial,
        key: Key,
        expiration_ms: u64,
        put_path: &[PeerId],
        value: &[u8],
    ) {
        let Some(t) = self.trails.get(trail) else {
            warn!(%trail, "result for unknown trail, dropping");
            return;
        };
        match t.pred {
            Some(pred) => {
                let payload = TrailPayload::GetResult {
                    key,
                    expiration_ms,
                    put_path: put_path.to_vec(),
                    value: value.to_vec(),
                };
                self.forward_on_trail(pred, false, Vec::new(), None, payload.encode());
            }
            None => {
                self.cache
                    .deliver_result(key, expiration_ms, put_path, value);
            }
        }
    }

    /// Store content announced by the local node itself.
    pub fn handle_local_put(&mut self, key: Key, expiration_ms: u64, value: &[u8]) {
        self.cache.handle_put(key, expiration_ms, &[], value);
    }
}
