//! Core Identifier Types
//!
//! All overlay identifiers are 256-bit values. Peers are identified by a
//! `PeerId`, trails by up to two `TrailId`s (one per direction they were
//! established from), and content by a `Key` in the same identifier space.
//!
//! Trail identifiers and walk-response locations are freshly random values;
//! a collision between two independently chosen 256-bit identifiers is
//! treated as cryptographically negligible.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bytes in an overlay identifier.
pub const ID_SIZE: usize = 32;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; ID_SIZE]);

        impl $name {
            /// Construct from raw bytes.
            pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            /// Generate a fresh uniformly random identifier.
            pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
                let mut bytes = [0u8; ID_SIZE];
                rng.fill(&mut bytes);
                Self(bytes)
            }

            /// Raw byte representation.
            pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            /// Parse from a slice; fails if the slice is not exactly 32 bytes.
            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                let bytes: [u8; ID_SIZE] = slice.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // First 8 bytes are plenty for log correlation.
                for b in &self.0[..8] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "..")
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

id_type! {
    /// Identity of a peer in the overlay.
    PeerId
}

id_type! {
    /// Identifier of one direction of a trail hop-segment.
    ///
    /// Chosen by whichever side originated that segment; a trail that was
    /// both extended *to* us and *from* us carries two independent ids.
    TrailId
}

id_type! {
    /// A location in the content keyspace.
    Key
}
