//! Shared utilities.

pub mod backoff;
