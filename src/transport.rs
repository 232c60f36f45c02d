//! Collaborator interfaces the engine is driven through
//!
//! The engine is transport-agnostic: it hands fully framed packets to a
//! [`Transport`] and resolves participants through a [`ContactStore`].
//! Delivery guarantees, peer addressing and identity management all live
//! on the host side of these traits. Both traits are object-safe; the
//! engine owns them boxed so it can be constructed and torn down freely
//! in tests.

use crate::crypto::IdentityKey;
use crate::wire::LinkKind;

/// Opaque participant handle.
///
/// The engine only compares and hashes these; what they index into is
/// the host's business. One handle must always resolve to the same
/// participant for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

/// Routing address for one participant, tagged with the link flavor it
/// is reachable over. Selects the transport framing byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// Direct pairwise link.
    Pairwise(u64),
    /// A peer inside a group link.
    Group { group: u64, peer: u64 },
}

impl PeerAddr {
    pub fn link_kind(&self) -> LinkKind {
        match self {
            PeerAddr::Pairwise(_) => LinkKind::Pairwise,
            PeerAddr::Group { .. } => LinkKind::Group,
        }
    }
}

/// Outbound packet delivery.
pub trait Transport {
    /// Hands a fully framed packet to the transport. Returns whether the
    /// transport accepted it; the engine treats a refusal as a lost
    /// packet (peers recover via the request packets).
    fn send(&mut self, to: PeerAddr, data: &[u8]) -> bool;

    /// Largest packet the transport will accept. Checked as a local
    /// precondition before a generation is started.
    fn max_message_size(&self) -> usize;
}

/// Participant identity resolution.
pub trait ContactStore {
    /// The local participant's own handle.
    fn local_peer(&self) -> PeerId;

    /// Persistent public identity key of a participant.
    fn identity_key(&self, peer: PeerId) -> Option<IdentityKey>;

    /// Reverse lookup: the participant a received identity key belongs to.
    fn peer_by_key(&self, key: &IdentityKey) -> Option<PeerId>;

    /// Routing address for a participant.
    fn route(&self, peer: PeerId) -> Option<PeerAddr>;
}
