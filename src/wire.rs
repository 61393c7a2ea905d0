//! Wire Format Parsing and Serialization
//!
//! Defines the overlay control-message wire format. Every message begins
//! with a 4-byte common header followed by message-specific fields:
//!
//! ```text
//! [msg_type:1][reserved:1 = 0][length:2 LE]
//! ```
//!
//! `length` covers the whole message including the header and is checked
//! against the actual buffer size before any field is interpreted. Trail
//! payloads (the messages carried *inside* a `TrailRoute`) use the same
//! header layout with their own type space.
//!
//! ## Message Types
//!
//! | Type | Message            | Size                                 |
//! |------|--------------------|--------------------------------------|
//! | 0x01 | RandomWalk         | 40 bytes                             |
//! | 0x02 | RandomWalkResponse | 68 bytes                             |
//! | 0x03 | TrailDestroy       | 36 bytes                             |
//! | 0x04 | TrailRoute         | 40 + 32*path_len + payload           |
//! | 0x10 | FindSuccessor      | 36 bytes (payload)                   |
//! | 0x11 | Get                | 36 bytes (payload)                   |
//! | 0x12 | Put                | 44 + value (payload)                 |
//! | 0x13 | GetResult          | 48 + 32*path_len + value (payload)   |

use crate::identity::{Key, PeerId, TrailId, ID_SIZE};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Size of the common message header.
pub const HEADER_SIZE: usize = 4;

/// Upper bound on any encoded message (u16 length field).
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Control message: one hop of a random walk.
pub const MSG_RANDOM_WALK: u8 = 0x01;
/// Control message: terminal response to a random walk.
pub const MSG_RANDOM_WALK_RESPONSE: u8 = 0x02;
/// Control message: notification that a trail died.
pub const MSG_TRAIL_DESTROY: u8 = 0x03;
/// Control message: payload routed along an established trail.
pub const MSG_TRAIL_ROUTE: u8 = 0x04;

/// Trail payload: request successors for a key.
pub const PAYLOAD_FIND_SUCCESSOR: u8 = 0x10;
/// Trail payload: content lookup.
pub const PAYLOAD_GET: u8 = 0x11;
/// Trail payload: content store.
pub const PAYLOAD_PUT: u8 = 0x12;
/// Trail payload: result of a content lookup.
pub const PAYLOAD_GET_RESULT: u8 = 0x13;

/// Fixed portion of a `TrailRoute` (header + flags + trail id).
pub const TRAIL_ROUTE_FIXED_SIZE: usize = HEADER_SIZE + 4 + ID_SIZE;

/// Total encoded size of a trail route with the given path and payload.
pub const fn trail_route_size(path_len: usize, payload_len: usize) -> usize {
    TRAIL_ROUTE_FIXED_SIZE + path_len * ID_SIZE + payload_len
}

// ============================================================================
// Errors
// ============================================================================

/// Decoding failures. All of these are protocol violations by the sender.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("declared length {declared} does not match buffer size {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("wrong size {actual} for fixed-size message type {msg_type:#04x}")]
    WrongSize { msg_type: u8, actual: usize },

    #[error("reserved field must be zero")]
    NonZeroReserved,
}

// ============================================================================
// Control Messages
// ============================================================================

/// A control message exchanged between directly connected peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Setup/extension of a trail via the underlay topology.
    RandomWalk {
        /// Hops this walk has taken so far; walks stop at the hop budget.
        hops_taken: u16,
        /// Ring layer this walk is discovering a finger for.
        layer: u16,
        /// Identifier the sender will use for this trail segment.
        trail_id: TrailId,
    },
    /// Terminal response to a `RandomWalk`, relayed back to the origin.
    RandomWalkResponse {
        /// Identifier from the `RandomWalk` this responds to.
        trail_id: TrailId,
        /// Location where the walk terminated.
        location: Key,
    },
    /// An event caused a trail to die; the receiver should drop its segment.
    TrailDestroy { trail_id: TrailId },
    /// An opaque payload routed along an established trail.
    TrailRoute {
        /// Whether the traversal path is being recorded.
        record_path: bool,
        /// Path the message has taken so far (excluding the sender).
        path: Vec<PeerId>,
        /// Identifier of the trail segment on the receiver's side.
        trail_id: TrailId,
        /// Encoded trail payload (its own header + body).
        payload: Vec<u8>,
    },
}

impl ControlMessage {
    /// Total encoded size in bytes.
    pub fn encoded_size(&self) -> usize {
        match self {
            ControlMessage::RandomWalk { .. } => HEADER_SIZE + 4 + ID_SIZE,
            ControlMessage::RandomWalkResponse { .. } => HEADER_SIZE + 2 * ID_SIZE,
            ControlMessage::TrailDestroy { .. } => HEADER_SIZE + ID_SIZE,
            ControlMessage::TrailRoute { path, payload, .. } => {
                trail_route_size(path.len(), payload.len())
            }
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let size = self.encoded_size();
        debug_assert!(size <= MAX_MESSAGE_SIZE);
        let mut buf = Vec::with_capacity(size);
        match self {
            ControlMessage::RandomWalk {
                hops_taken,
                layer,
                trail_id,
            } => {
                put_header(&mut buf, MSG_RANDOM_WALK, size);
                buf.extend_from_slice(&hops_taken.to_le_bytes());
                buf.extend_from_slice(&layer.to_le_bytes());
                buf.extend_from_slice(trail_id.as_bytes());
            }
            ControlMessage::RandomWalkResponse { trail_id, location } => {
                put_header(&mut buf, MSG_RANDOM_WALK_RESPONSE, size);
                buf.extend_from_slice(trail_id.as_bytes());
                buf.extend_from_slice(location.as_bytes());
            }
            ControlMessage::TrailDestroy { trail_id } => {
                put_header(&mut buf, MSG_TRAIL_DESTROY, size);
                buf.extend_from_slice(trail_id.as_bytes());
            }
            ControlMessage::TrailRoute {
                record_path,
                path,
                trail_id,
                payload,
            } => {
                put_header(&mut buf, MSG_TRAIL_ROUTE, size);
                buf.push(u8::from(*record_path));
                buf.push(0);
                buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
                buf.extend_from_slice(trail_id.as_bytes());
                for hop in path {
                    buf.extend_from_slice(hop.as_bytes());
                }
                buf.extend_from_slice(payload);
            }
        }
        debug_assert_eq!(buf.len(), size);
        buf
    }

    /// Decode a control message, validating all declared sizes against the
    /// actual buffer before any field is read.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (msg_type, body) = parse_header(data)?;
        match msg_type {
            MSG_RANDOM_WALK => {
                expect_body_size(msg_type, body, 4 + ID_SIZE)?;
                Ok(ControlMessage::RandomWalk {
                    hops_taken: u16::from_le_bytes([body[0], body[1]]),
                    layer: u16::from_le_bytes([body[2], body[3]]),
                    trail_id: read_id(&body[4..]),
                })
            }
            MSG_RANDOM_WALK_RESPONSE => {
                expect_body_size(msg_type, body, 2 * ID_SIZE)?;
                Ok(ControlMessage::RandomWalkResponse {
                    trail_id: read_id(&body[..ID_SIZE]),
                    location: read_id(&body[ID_SIZE..]),
                })
            }
            MSG_TRAIL_DESTROY => {
                expect_body_size(msg_type, body, ID_SIZE)?;
                Ok(ControlMessage::TrailDestroy {
                    trail_id: read_id(body),
                })
            }
            MSG_TRAIL_ROUTE => {
                // Fixed part: flags + path_len + trail_id.
                if body.len() < 4 + ID_SIZE {
                    return Err(WireError::Truncated {
                        need: TRAIL_ROUTE_FIXED_SIZE,
                        have: data.len(),
                    });
                }
                let record_path = body[0] != 0;
                if body[1] != 0 {
                    return Err(WireError::NonZeroReserved);
                }
                let path_len = u16::from_le_bytes([body[2], body[3]]) as usize;
                let trail_id: TrailId = read_id(&body[4..4 + ID_SIZE]);
                let rest = &body[4 + ID_SIZE..];

                // The declared path plus a minimal payload header must fit
                // in what we actually received.
                let path_bytes = path_len * ID_SIZE;
                let need = TRAIL_ROUTE_FIXED_SIZE + path_bytes + HEADER_SIZE;
                if rest.len() < path_bytes + HEADER_SIZE {
                    return Err(WireError::Truncated {
                        need,
                        have: data.len(),
                    });
                }
                let path = rest[..path_bytes]
                    .chunks_exact(ID_SIZE)
                    .map(read_id::<PeerId>)
                    .collect();
                let payload = &rest[path_bytes..];

                // The payload's own declared length must account for exactly
                // the remaining bytes.
                let declared = u16::from_le_bytes([payload[2], payload[3]]) as usize;
                if declared != payload.len() {
                    return Err(WireError::LengthMismatch {
                        declared,
                        actual: payload.len(),
                    });
                }
                Ok(ControlMessage::TrailRoute {
                    record_path,
                    path,
                    trail_id,
                    payload: payload.to_vec(),
                })
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

// ============================================================================
// Trail Payloads
// ============================================================================

/// A terminal payload carried inside a `TrailRoute`.
///
/// Closed set: the router matches exhaustively, so adding a variant forces
/// every dispatch site to handle it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrailPayload {
    /// Request the successors of `key` from the trail's terminal peer.
    FindSuccessor { key: Key },
    /// Content lookup.
    Get { key: Key },
    /// Content store.
    Put {
        key: Key,
        expiration_ms: u64,
        value: Vec<u8>,
    },
    /// Result of a content lookup, travelling back toward the origin.
    GetResult {
        key: Key,
        expiration_ms: u64,
        put_path: Vec<PeerId>,
        value: Vec<u8>,
    },
}

impl TrailPayload {
    /// Total encoded size in bytes.
    pub fn encoded_size(&self) -> usize {
        match self {
            TrailPayload::FindSuccessor { .. } | TrailPayload::Get { .. } => HEADER_SIZE + ID_SIZE,
            TrailPayload::Put { value, .. } => HEADER_SIZE + ID_SIZE + 8 + value.len(),
            TrailPayload::GetResult {
                put_path, value, ..
            } => HEADER_SIZE + ID_SIZE + 8 + 4 + put_path.len() * ID_SIZE + value.len(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let size = self.encoded_size();
        debug_assert!(size <= MAX_MESSAGE_SIZE);
        let mut buf = Vec::with_capacity(size);
        match self {
            TrailPayload::FindSuccessor { key } => {
                put_header(&mut buf, PAYLOAD_FIND_SUCCESSOR, size);
                buf.extend_from_slice(key.as_bytes());
            }
            TrailPayload::Get { key } => {
                put_header(&mut buf, PAYLOAD_GET, size);
                buf.extend_from_slice(key.as_bytes());
            }
            TrailPayload::Put {
                key,
                expiration_ms,
                value,
            } => {
                put_header(&mut buf, PAYLOAD_PUT, size);
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(&expiration_ms.to_le_bytes());
                buf.extend_from_slice(value);
            }
            TrailPayload::GetResult {
                key,
                expiration_ms,
                put_path,
                value,
            } => {
                put_header(&mut buf, PAYLOAD_GET_RESULT, size);
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(&expiration_ms.to_le_bytes());
                buf.extend_from_slice(&(put_path.len() as u16).to_le_bytes());
                buf.extend_from_slice(&[0, 0]);
                for hop in put_path {
                    buf.extend_from_slice(hop.as_bytes());
                }
                buf.extend_from_slice(value);
            }
        }
        debug_assert_eq!(buf.len(), size);
        buf
    }

    /// Decode a trail payload.
    ///
    /// `FindSuccessor` and `Get` are fixed-size and rejected on any size
    /// mismatch; the variable-size payloads validate their declared path
    /// lengths against the buffer.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (msg_type, body) = parse_header(data)?;
        match msg_type {
            PAYLOAD_FIND_SUCCESSOR => {
                expect_body_size(msg_type, body, ID_SIZE)?;
                Ok(TrailPayload::FindSuccessor {
                    key: read_id(body),
                })
            }
            PAYLOAD_GET => {
                expect_body_size(msg_type, body, ID_SIZE)?;
                Ok(TrailPayload::Get {
                    key: read_id(body),
                })
            }
            PAYLOAD_PUT => {
                if body.len() < ID_SIZE + 8 {
                    return Err(WireError::Truncated {
                        need: HEADER_SIZE + ID_SIZE + 8,
                        have: data.len(),
                    });
                }
                let key = read_id(&body[..ID_SIZE]);
                let expiration_ms = read_u64(&body[ID_SIZE..]);
                Ok(TrailPayload::Put {
                    key,
                    expiration_ms,
                    value: body[ID_SIZE + 8..].to_vec(),
                })
            }
            PAYLOAD_GET_RESULT => {
                let fixed = ID_SIZE + 8 + 4;
                if body.len() < fixed {
                    return Err(WireError::Truncated {
                        need: HEADER_SIZE + fixed,
                        have: data.len(),
                    });
                }
                let key = read_id(&body[..ID_SIZE]);
                let expiration_ms = read_u64(&body[ID_SIZE..]);
                let path_len =
                    u16::from_le_bytes([body[ID_SIZE + 8], body[ID_SIZE + 9]]) as usize;
                if body[ID_SIZE + 10] != 0 || body[ID_SIZE + 11] != 0 {
                    return Err(WireError::NonZeroReserved);
                }
                let rest = &body[fixed..];
                let path_bytes = path_len * ID_SIZE;
                if rest.len() < path_bytes {
                    return Err(WireError::Truncated {
                        need: HEADER_SIZE + fixed + path_bytes,
                        have: data.len(),
                    });
                }
                let put_path = rest[..path_bytes]
                    .chunks_exact(ID_SIZE)
                    .map(read_id::<PeerId>)
                    .collect();
                Ok(TrailPayload::GetResult {
                    key,
                    expiration_ms,
                    put_path,
                    value: rest[path_bytes..].to_vec(),
                })
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

// ============================================================================
// Header Helpers
// ============================================================================

fn put_header(buf: &mut Vec<u8>, msg_type: u8, size: usize) {
    buf.push(msg_type);
    buf.push(0);
    buf.extend_from_slice(&(size as u16).to_le_bytes());
}

/// Parse and validate the common header; returns `(msg_type, body)`.
fn parse_header(data: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if data.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            need: HEADER_SIZE,
            have: data.len(),
        });
    }
    if data[1] != 0 {
        return Err(WireError::NonZeroReserved);
    }
    let declared = u16::from_le_bytes([data[2], data[3]]) as usize;
    if declared != data.len() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }
    Ok((data[0], &data[HEADER_SIZE..]))
}

fn expect_body_size(msg_type: u8, body: &[u8], expected: usize) -> Result<(), WireError> {
    if body.len() != expected {
        return Err(WireError::WrongSize {
            msg_type,
            actual: body.len() + HEADER_SIZE,
        });
    }
    Ok(())
}

trait FromIdBytes {
    fn from_id_bytes(bytes: [u8; ID_SIZE]) -> Self;
}

impl FromIdBytes for PeerId {
    fn from_id_bytes(bytes: [u8; ID_SIZE]) -> Self {
        PeerId::from_bytes(bytes)
    }
}

impl FromIdBytes for TrailId {
    fn from_id_bytes(bytes: [u8; ID_SIZE]) -> Self {
        TrailId::from_bytes(bytes)
    }
}

impl FromIdBytes for Key {
    fn from_id_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Key::from_bytes(bytes)
    }
}

/// Read a 32-byte identifier from a slice known to be long enough.
fn read_id<T: FromIdBytes>(slice: &[u8]) -> T {
    let mut bytes = [0u8; ID_SIZE];
    bytes.copy_from_slice(&slice[..ID_SIZE]);
    T::from_id_bytes(bytes)
}

/// Read a little-endian u64 from a slice known to be long enough.
fn read_u64(slice: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&slice[..8]);
    u64::from_le_bytes(bytes)
}

// ============================================================================
// Tests
// ============================================================================
