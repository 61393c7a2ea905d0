//! Directly Connected Peers
//!
//! A `Friend` is a peer the underlay reports as directly connected. All
//! overlay traffic flows between friends; trails are chains of friend links.
//! Each friend tracks the trails it participates in, split by which side of
//! the trail it sits on, so a disconnect can tear down exactly the affected
//! trails.

use super::{OutboundPacket, PacketTx, TrailSerial};
use crate::identity::PeerId;
use crate::wire::ControlMessage;
use std::collections::HashSet;
use tracing::debug;

/// State for one directly connected peer.
pub struct Friend {
    pub id: PeerId,
    tx: PacketTx,
    /// Trails on which this friend is our predecessor.
    pub pred_trails: HashSet<TrailSerial>,
    /// Trails on which this friend is our successor.
    pub succ_trails: HashSet<TrailSerial>,
}

impl Friend {
    pub fn new(id: PeerId, tx: PacketTx) -> Self {
        Self {
            id,
            tx,
            pred_trails: HashSet::new(),
            succ_trails: HashSet::new(),
        }
    }

    /// Number of trails this friend participates in.
    pub fn trail_count(&self) -> usize {
        self.pred_trails.len() + self.succ_trails.len()
    }

    /// Queue a control message for delivery to this friend.
    ///
    /// Delivery is asynchronous; a closed outbound channel means the host is
    /// shutting down, in which case the message is silently dropped.
    pub fn send(&self, msg: &ControlMessage) {
        let packet = OutboundPacket {
            dest: self.id,
            data: msg.encode(),
        };
        if self.tx.send(packet).is_err() {
            debug!(peer = %self.id, "outbound channel closed, dropping message");
        }
    }
}
