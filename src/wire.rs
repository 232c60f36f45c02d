//! Wire codec for the five protocol packets
//!
//! Every packet travels in the same envelope:
//!
//! ```text
//! transport_id (1) ‖ packet_type (1) ‖ generation_id (32) ‖ payload
//! ```
//!
//! The transport id selects the framing: `0xB1` for pairwise links,
//! `0xA6` for group links. The payload layout per packet type is
//! normative, so the codec works on raw byte slices rather than a
//! serialization framework. Packets shorter than the minimum for their
//! type, or carrying an unknown type byte, are rejected; the tolerated
//! trailing-bytes cases log a warning and decode anyway.

use tracing::warn;

use crate::crypto::{Commitment, GenerationId, IdentityKey};
use crate::{GENERATION_ID_LEN, IDENTITY_KEY_LEN, MAC_KEY_LEN, MAC_LEN, SECRET_LEN};

/// Transport id byte for pairwise links.
pub const TRANSPORT_ID_PAIRWISE: u8 = 0xB1;

/// Transport id byte for group links.
pub const TRANSPORT_ID_GROUP: u8 = 0xA6;

/// Envelope bytes preceding the payload.
pub const FRAME_HEADER_LEN: usize = 1 + 1 + GENERATION_ID_LEN;

/// Which transport framing a packet travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Pairwise,
    Group,
}

impl LinkKind {
    pub fn transport_id(self) -> u8 {
        match self {
            LinkKind::Pairwise => TRANSPORT_ID_PAIRWISE,
            LinkKind::Group => TRANSPORT_ID_GROUP,
        }
    }

    pub fn from_transport_id(byte: u8) -> Option<Self> {
        match byte {
            TRANSPORT_ID_PAIRWISE => Some(LinkKind::Pairwise),
            TRANSPORT_ID_GROUP => Some(LinkKind::Group),
            _ => None,
        }
    }
}

/// Protocol packet type byte. Zero is reserved invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Commit = 2,
    CommitRequest = 3,
    Secret = 4,
    SecretRequest = 5,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PacketType::Init),
            2 => Some(PacketType::Commit),
            3 => Some(PacketType::CommitRequest),
            4 => Some(PacketType::Secret),
            5 => Some(PacketType::SecretRequest),
            _ => None,
        }
    }
}

/// Errors surfaced while decoding an inbound packet.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: got {got} bytes, need at least {need}")]
    Truncated { need: usize, got: usize },
    #[error("unknown transport id {0:#04x}")]
    UnknownTransport(u8),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("secret payload must be {expected} bytes, got {got}")]
    SecretLength { expected: usize, got: usize },
}

/// A decoded protocol packet, minus the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Opens a generation: the full participant identity list (defines
    /// the combine order for recipients), the sender's commitment, and
    /// the user-supplied initial state.
    Init {
        identity_keys: Vec<IdentityKey>,
        commitment: Commitment,
        initial_state: Vec<u8>,
    },
    Commit {
        commitment: Commitment,
    },
    CommitRequest,
    Secret {
        value: [u8; SECRET_LEN],
        key: [u8; MAC_KEY_LEN],
    },
    SecretRequest,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Init { .. } => PacketType::Init,
            Packet::Commit { .. } => PacketType::Commit,
            Packet::CommitRequest => PacketType::CommitRequest,
            Packet::Secret { .. } => PacketType::Secret,
            Packet::SecretRequest => PacketType::SecretRequest,
        }
    }

    /// Serializes the packet into its transport envelope.
    pub fn encode(&self, link: LinkKind, id: &GenerationId) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload_len());
        out.push(link.transport_id());
        out.push(self.packet_type() as u8);
        out.extend_from_slice(id);
        match self {
            Packet::Init {
                identity_keys,
                commitment,
                initial_state,
            } => {
                debug_assert!(identity_keys.len() <= u16::MAX as usize);
                out.extend_from_slice(&(identity_keys.len() as u16).to_le_bytes());
                for key in identity_keys {
                    out.extend_from_slice(key);
                }
                out.extend_from_slice(commitment);
                out.extend_from_slice(initial_state);
            }
            Packet::Commit { commitment } => out.extend_from_slice(commitment),
            Packet::Secret { value, key } => {
                out.extend_from_slice(value);
                out.extend_from_slice(key);
            }
            Packet::CommitRequest | Packet::SecretRequest => {}
        }
        out
    }

    fn payload_len(&self) -> usize {
        match self {
            Packet::Init {
                identity_keys,
                initial_state,
                ..
            } => 2 + identity_keys.len() * IDENTITY_KEY_LEN + MAC_LEN + initial_state.len(),
            Packet::Commit { .. } => MAC_LEN,
            Packet::Secret { .. } => SECRET_LEN + MAC_KEY_LEN,
            Packet::CommitRequest | Packet::SecretRequest => 0,
        }
    }

    /// Parses a raw transport frame into its link kind, generation id
    /// and packet.
    pub fn decode(raw: &[u8]) -> Result<(LinkKind, GenerationId, Packet), WireError> {
        if raw.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated {
                need: FRAME_HEADER_LEN,
                got: raw.len(),
            });
        }
        let link =
            LinkKind::from_transport_id(raw[0]).ok_or(WireError::UnknownTransport(raw[0]))?;
        let packet_type =
            PacketType::from_byte(raw[1]).ok_or(WireError::UnknownPacketType(raw[1]))?;
        let mut id = [0u8; GENERATION_ID_LEN];
        id.copy_from_slice(&raw[2..FRAME_HEADER_LEN]);
        let payload = &raw[FRAME_HEADER_LEN..];

        let packet = match packet_type {
            PacketType::Init => decode_init(payload)?,
            PacketType::Commit => {
                if payload.len() < MAC_LEN {
                    return Err(WireError::Truncated {
                        need: MAC_LEN,
                        got: payload.len(),
                    });
                }
                if payload.len() > MAC_LEN {
                    warn!(
                        "commit packet carries {} trailing bytes, ignoring",
                        payload.len() - MAC_LEN
                    );
                }
                let mut commitment = [0u8; MAC_LEN];
                commitment.copy_from_slice(&payload[..MAC_LEN]);
                Packet::Commit { commitment }
            }
            PacketType::Secret => {
                let expected = SECRET_LEN + MAC_KEY_LEN;
                if payload.len() != expected {
                    return Err(WireError::SecretLength {
                        expected,
                        got: payload.len(),
                    });
                }
                let mut value = [0u8; SECRET_LEN];
                let mut key = [0u8; MAC_KEY_LEN];
                value.copy_from_slice(&payload[..SECRET_LEN]);
                key.copy_from_slice(&payload[SECRET_LEN..]);
                Packet::Secret { value, key }
            }
            PacketType::CommitRequest => {
                if !payload.is_empty() {
                    warn!(
                        "commit request carries {} unexpected bytes, ignoring",
                        payload.len()
                    );
                }
                Packet::CommitRequest
            }
            PacketType::SecretRequest => {
                if !payload.is_empty() {
                    warn!(
                        "secret request carries {} unexpected bytes, ignoring",
                        payload.len()
                    );
                }
                Packet::SecretRequest
            }
        };

        Ok((link, id, packet))
    }
}

fn decode_init(payload: &[u8]) -> Result<Packet, WireError> {
    if payload.len() < 2 {
        return Err(WireError::Truncated {
            need: 2,
            got: payload.len(),
        });
    }
    let peer_count = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let need = 2 + peer_count * IDENTITY_KEY_LEN + MAC_LEN;
    if payload.len() < need {
        return Err(WireError::Truncated {
            need,
            got: payload.len(),
        });
    }

    let mut identity_keys = Vec::with_capacity(peer_count);
    let mut cursor = 2;
    for _ in 0..peer_count {
        let mut key = [0u8; IDENTITY_KEY_LEN];
        key.copy_from_slice(&payload[cursor..cursor + IDENTITY_KEY_LEN]);
        identity_keys.push(key);
        cursor += IDENTITY_KEY_LEN;
    }
    let mut commitment = [0u8; MAC_LEN];
    commitment.copy_from_slice(&payload[cursor..cursor + MAC_LEN]);
    cursor += MAC_LEN;

    Ok(Packet::Init {
        identity_keys,
        commitment,
        initial_state: payload[cursor..].to_vec(),
    })
}

/// Total frame size of an INIT packet for the given participant count
/// and initial-state length. Used as the local precondition against the
/// transport's maximum message size before a generation is started.
pub fn init_packet_len(peer_count: usize, initial_state_len: usize) -> usize {
    FRAME_HEADER_LEN + 2 + peer_count * IDENTITY_KEY_LEN + MAC_LEN + initial_state_len
}
