//! Exponential backoff helper.
//!
//! Shared by every subsystem that needs to progressively delay retries of a
//! failing resource (currently the address lifecycle manager). The policy is
//! doubling with a floor of one millisecond and a configurable cap; it is
//! deliberately deterministic so callers can rely on the sequence being
//! non-decreasing.

/// Advance a backoff duration by one step.
///
/// Returns `min(cap_ms, max(1, current_ms) * 2)`. A `current_ms` of zero
/// (fresh or reset state) yields 2ms.
pub fn std_backoff(current_ms: u64, cap_ms: u64) -> u64 {
    current_ms.max(1).saturating_mul(2).min(cap_ms)
}
