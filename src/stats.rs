//! Observability Counters
//!
//! None of the routing core is directly user-facing; failures surface as
//! reduced connectivity or slower convergence. These counters are the way
//! operators observe that. They are plain values read through accessors,
//! updated synchronously by the owning subsystem.

/// Counters maintained by the routing core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingStats {
    /// Random walks launched by the periodic task.
    pub walks_launched: u64,
    /// Trails created (either as origin or as a relay/terminal hop).
    pub trails_created: u64,
    /// Trails torn down (any reason).
    pub trails_destroyed: u64,
    /// Trails torn down by the expiration task specifically.
    pub trails_expired: u64,
    /// Fingers filled in by a returned walk response.
    pub fingers_completed: u64,
    /// Messages forwarded along a trail (either direction).
    pub messages_forwarded: u64,
    /// Terminal payloads dispatched to a local handler.
    pub payloads_dispatched: u64,
    /// Malformed or out-of-contract messages dropped.
    pub protocol_violations: u64,
    /// Expected races, e.g. a walk response after its trail expired.
    pub benign_races: u64,
}

/// Counters maintained by the address lifecycle manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AtsStats {
    /// Addresses currently offered to the scoring subsystem.
    pub addresses_scored: usize,
    /// Addresses currently blocked under backoff.
    pub addresses_blocked: usize,
}
