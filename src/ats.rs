//! Address Lifecycle Management
//!
//! Tracks every address the transport layer knows for its peers and decides
//! when each one is offered to the scoring subsystem for connection
//! selection. An address is always in exactly one of two states:
//!
//! - **scored**: offered to the scoring subsystem, which holds a record for
//!   it and may suggest connecting over it;
//! - **blocked**: withdrawn after a failed or terminated connection attempt,
//!   sitting out an exponential backoff before being offered again.
//!
//! Destruction is dual-gated. An address disappears only after both its
//! owner declared it expired *and* any session using it detached, in either
//! order, and the underlying record is released exactly once.
//!
//! Callers own the address strings; everything here is keyed by value. Most
//! operations tolerate out-of-contract calls (unknown address, repeated
//! session attach) by logging and returning, since the transport above us
//! races connect and disconnect events routinely.

use crate::config::AtsConfig;
use crate::identity::PeerId;
use crate::stats::AtsStats;
use crate::util::backoff::std_backoff;
use std::collections::HashMap;
use tracing::{debug, warn};

// ============================================================================
// Types
// ============================================================================

/// Host-assigned identifier of a transport session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// A transport address of a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub peer: PeerId,
    /// Transport plugin name, e.g. `"udp"`.
    pub transport: String,
    /// Opaque transport-specific address bytes.
    pub addr: Vec<u8>,
    /// Whether the address was learned from an inbound connection and
    /// cannot be used to initiate one.
    pub inbound: bool,
}

/// Performance properties of an address, reported to the scoring subsystem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    pub delay_ms: u64,
    /// Hop distance; 0 for direct connectivity.
    pub distance: u32,
    pub utilization_in: u32,
    pub utilization_out: u32,
}

/// Handle to a record held by the scoring subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordHandle(pub u64);

/// The scoring subsystem the lifecycle manager feeds.
pub trait Scoring {
    /// Offer an address; the returned handle names the record until it is
    /// destroyed or released.
    fn address_add(&mut self, address: &Address, properties: &Properties) -> RecordHandle;

    /// Update the performance properties of a record.
    fn address_update(&mut self, handle: RecordHandle, properties: &Properties);

    /// Associate a live session with a record.
    fn address_add_session(&mut self, handle: RecordHandle, session: SessionId);

    /// Dissociate a session. Returns `true` if the scoring side released
    /// the whole record in response; the caller must then not destroy it.
    fn address_del_session(&mut self, handle: RecordHandle, session: SessionId) -> bool;

    /// Release a record outright.
    fn address_destroy(&mut self, handle: RecordHandle);
}

// ============================================================================
// Per-Address State
// ============================================================================

struct AddressInfo {
    address: Address,
    properties: Properties,
    /// Session currently using this address, if any.
    session: Option<SessionId>,
    /// Scoring record while the address is offered.
    record: Option<RecordHandle>,
    /// Deadline after which a blocked address is re-offered.
    unblock_at_ms: Option<u64>,
    /// Current backoff; doubles on every block, cleared on success.
    back_off_ms: u64,
    /// Owner declared the address gone, but a session still pins it.
    expired: bool,
}

impl AddressInfo {
    fn new(address: Address, properties: Properties) -> Self {
        Self {
            address,
            properties,
            session: None,
            record: None,
            unblock_at_ms: None,
            back_off_ms: 0,
            expired: false,
        }
    }
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

/// Tracks all known addresses and drives their scored/blocked lifecycle.
pub struct AddressLifecycle {
    config: AtsConfig,
    scoring: Box<dyn Scoring>,
    records: HashMap<PeerId, Vec<AddressInfo>>,
}

impl AddressLifecycle {
    pub fn new(config: AtsConfig, scoring: Box<dyn Scoring>) -> Self {
        Self {
            config,
            scoring,
            records: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether this exact address is tracked (scored or blocked).
    pub fn is_known(&self, address: &Address) -> bool {
        self.find(address).is_some()
    }

    pub fn stats(&self) -> AtsStats {
        let mut stats = AtsStats::default();
        for ai in self.records.values().flatten() {
            if ai.record.is_some() {
                stats.addresses_scored += 1;
            }
            if ai.unblock_at_ms.is_some() {
                stats.addresses_blocked += 1;
            }
        }
        stats
    }

    fn find(&self, address: &Address) -> Option<&AddressInfo> {
        self.records
            .get(&address.peer)?
            .iter()
            .find(|ai| ai.address == *address)
    }

    fn find_mut(&mut self, address: &Address) -> Option<&mut AddressInfo> {
        self.records
            .get_mut(&address.peer)?
            .iter_mut()
            .find(|ai| ai.address == *address)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Track a new address and offer it to scoring immediately.
    pub fn add_address(&mut self, address: Address, properties: Properties) {
        if self.is_known(&address) {
            warn!(peer = %address.peer, "address added twice, ignoring");
            debug_assert!(false, "address added twice");
            return;
        }
        debug!(peer = %address.peer, transport = %address.transport, "tracking address");
        let mut ai = AddressInfo::new(address, properties);
        ai.record = Some(self.scoring.address_add(&ai.address, &ai.properties));
        self.records.entry(ai.address.peer).or_default().push(ai);
    }

    /// Track an address learned from an inbound connection, with its
    /// session already attached.
    pub fn add_inbound_address(
        &mut self,
        mut address: Address,
        session: SessionId,
        properties: Properties,
    ) {
        address.inbound = true;
        if self.is_known(&address) {
            warn!(peer = %address.peer, "inbound address added twice, ignoring");
            debug_assert!(false, "inbound address added twice");
            return;
        }
        let mut ai = AddressInfo::new(address, properties);
        let handle = self.scoring.address_add(&ai.address, &ai.properties);
        self.scoring.address_add_session(handle, session);
        ai.record = Some(handle);
        ai.session = Some(session);
        self.records.entry(ai.address.peer).or_default().push(ai);
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// A session started using this address.
    pub fn new_session(&mut self, address: &Address, session: SessionId) {
        let Some(ai) = self.find_mut(address) else {
            warn!(peer = %address.peer, "session for unknown address, ignoring");
            debug_assert!(false, "session for unknown address");
            return;
        };
        if ai.session == Some(session) {
            // Repeat notification for the same session is harmless.
            return;
        }
        if ai.session.is_some() {
            warn!(peer = %address.peer, "address already has a session, ignoring");
            debug_assert!(false, "second session on address");
            return;
        }
        ai.session = Some(session);
        if let Some(handle) = ai.record {
            self.scoring.address_add_session(handle, session);
        }
    }

    /// A session using this address ended.
    ///
    /// Unknown addresses are tolerated silently: sessions from inbound
    /// probes come and go without the address ever being tracked.
    pub fn del_session(&mut self, address: &Address, session: SessionId) {
        let Some(entry) = self
            .records
            .get_mut(&address.peer)
            .and_then(|v| v.iter_mut().position(|ai| ai.address == *address).map(|i| (v, i)))
        else {
            debug!(peer = %address.peer, "session end for untracked address");
            return;
        };
        let (list, idx) = entry;
        let ai = &mut list[idx];
        if ai.session != Some(session) {
            warn!(peer = %address.peer, "session end does not match attached session");
            debug_assert!(false, "mismatched session end");
            return;
        }
        ai.session = None;
        let mut defunct = false;
        if let Some(handle) = ai.record {
            if self.scoring.address_del_session(handle, session) {
                // Scoring released the record along with the session; the
                // address has no remaining use and must not linger half-dead.
                ai.record = None;
                defunct = true;
            }
        } else if ai.expired || ai.address.inbound {
            // Second gate: the owner already expired the address, or an
            // inbound address whose validity ends with its only session.
            defunct = true;
        }
        if defunct {
            let ai = list.remove(idx);
            if let Some(handle) = ai.record {
                self.scoring.address_destroy(handle);
            }
            if list.is_empty() {
                self.records.remove(&address.peer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Blocking and Backoff
    // ------------------------------------------------------------------

    /// Withdraw an address from scoring after a failed or terminated
    /// connection, with exponentially growing hold-off.
    pub fn block_address(&mut self, address: &Address, now_ms: u64) {
        let cap_ms = self.config.backoff_cap_ms();
        let Some(ai) = self.find_mut(address) else {
            warn!(peer = %address.peer, "block for unknown address, ignoring");
            debug_assert!(false, "block for unknown address");
            return;
        };
        let Some(handle) = ai.record.take() else {
            debug!(peer = %address.peer, "address already blocked");
            return;
        };
        ai.back_off_ms = std_backoff(ai.back_off_ms, cap_ms);
        ai.unblock_at_ms = Some(now_ms + ai.back_off_ms);
        let session = ai.session;
        debug!(
            peer = %address.peer,
            back_off_ms = ai.back_off_ms,
            "blocking address"
        );
        if let Some(session) = session {
            // Detach the session from the record before withdrawing it; if
            // scoring releases the record on detach, it is already gone.
            if self.scoring.address_del_session(handle, session) {
                return;
            }
        }
        self.scoring.address_destroy(handle);
    }

    /// A connection over this address succeeded; forget the accumulated
    /// backoff. A reset while the address is blocked is a caller bug: an
    /// address cannot be both failing and in successful use.
    pub fn block_reset(&mut self, address: &Address) {
        let Some(ai) = self.find_mut(address) else {
            warn!(peer = %address.peer, "reset for unknown address, ignoring");
            debug_assert!(false, "reset for unknown address");
            return;
        };
        if ai.unblock_at_ms.is_some() {
            warn!(peer = %address.peer, "reset while address is blocked");
            debug_assert!(false, "reset while address is blocked");
        }
        ai.back_off_ms = 0;
    }

    /// Re-offer every blocked address whose hold-off has passed.
    pub fn process_unblocks(&mut self, now_ms: u64) {
        // Collected first: re-adding goes through the scoring collaborator,
        // which cannot be called while iterating the records.
        let mut due: Vec<Address> = Vec::new();
        for ai in self.records.values().flatten() {
            if matches!(ai.unblock_at_ms, Some(at) if at <= now_ms) {
                due.push(ai.address.clone());
            }
        }
        for address in due {
            let Some(ai) = self.records.get_mut(&address.peer).and_then(|v| {
                v.iter_mut().find(|ai| ai.address == address)
            }) else {
                continue;
            };
            debug!(peer = %address.peer, "unblocking address");
            ai.unblock_at_ms = None;
            let handle = self.scoring.address_add(&ai.address, &ai.properties);
            ai.record = Some(handle);
            if let Some(session) = ai.session {
                self.scoring.address_add_session(handle, session);
            }
        }
    }

    /// Earliest pending unblock deadline, or `None` when nothing is blocked.
    pub fn next_unblock_ms(&self) -> Option<u64> {
        self.records
            .values()
            .flatten()
            .filter_map(|ai| ai.unblock_at_ms)
            .min()
    }

    // ------------------------------------------------------------------
    // Expiry and Destruction
    // ------------------------------------------------------------------

    /// The owner no longer considers this address valid. The scoring record
    /// is withdrawn either way; if a session still uses the address, the
    /// bookkeeping entry waits for the session to end before it is removed.
    pub fn expire_address(&mut self, address: &Address) {
        let Some((list, idx)) = self
            .records
            .get_mut(&address.peer)
            .and_then(|v| v.iter_mut().position(|ai| ai.address == *address).map(|i| (v, i)))
        else {
            warn!(peer = %address.peer, "expire for unknown address, ignoring");
            debug_assert!(false, "expire for unknown address");
            return;
        };
        let ai = &mut list[idx];
        // A pending unblock must not resurrect an expired address.
        ai.unblock_at_ms = None;
        if ai.session.is_some() {
            debug!(peer = %address.peer, "address expired, waiting for session to end");
            ai.expired = true;
            // Withdraw from scoring now; only the bookkeeping waits.
            if let Some(handle) = ai.record.take() {
                self.scoring.address_destroy(handle);
            }
            return;
        }
        let ai = list.remove(idx);
        if let Some(handle) = ai.record {
            self.scoring.address_destroy(handle);
        }
        if list.is_empty() {
            self.records.remove(&address.peer);
        }
    }

    /// Update the measured properties of an address and push them to
    /// scoring if it is currently offered.
    pub fn update_properties(&mut self, address: &Address, properties: Properties) {
        let Some(ai) = self.find_mut(address) else {
            debug!(peer = %address.peer, "properties for untracked address");
            return;
        };
        ai.properties = properties;
        if let Some(handle) = ai.record {
            self.scoring.address_update(handle, &properties);
        }
    }

    /// Drop every tracked address, releasing all scoring records.
    pub fn shutdown(&mut self) {
        for (_, list) in self.records.drain() {
            for ai in list {
                if let Some(handle) = ai.record {
                    self.scoring.address_destroy(handle);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
