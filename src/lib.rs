//! Trailnet: trail-based overlay routing substrate
//!
//! A routing core for peer-to-peer DHT networks that builds its topology
//! out of trails: paths discovered by random walks over the underlay, kept
//! alive as fingers into a layered keyspace ring. Alongside the routing
//! core lives an address lifecycle manager that decides which transport
//! addresses are offered to connection scoring and which are held back
//! under backoff.

pub mod ats;
pub mod config;
pub mod identity;
pub mod routing;
pub mod stats;
pub mod util;
pub mod wire;

// Re-export identity types
pub use identity::{Key, PeerId, TrailId, ID_SIZE};

// Re-export config types
pub use config::{AtsConfig, Config, ConfigError, RoutingConfig};

// Re-export routing types
pub use routing::{
    packet_channel, ContentCache, Finger, FingerTable, Friend, OutboundPacket, PacketRx, PacketTx,
    RoutingCore, RoutingError, SizeEstimator, Trail, TrailSerial, TrailSide, TrailTable,
};

// Re-export wire types
pub use wire::{ControlMessage, TrailPayload, WireError, MAX_MESSAGE_SIZE};

// Re-export address lifecycle types
pub use ats::{Address, AddressLifecycle, Properties, RecordHandle, Scoring, SessionId};

// Re-export stats types
pub use stats::{AtsStats, RoutingStats};
