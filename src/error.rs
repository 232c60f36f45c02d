//! Engine error taxonomy
//!
//! Adversarial input never surfaces here: malformed or out-of-protocol
//! packets are dropped (and logged) inside the dispatcher without any
//! state change. These errors cover the local API preconditions and the
//! defensive combine path.

use crate::crypto::CryptoError;
use crate::transport::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The INIT packet for this generation would not fit the transport.
    #[error("init packet would be {size} bytes, transport limit is {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    /// A generation needs at least two participants.
    #[error("participant list needs at least two entries")]
    TooFewParticipants,

    /// The same handle appears twice in the participant list.
    #[error("participant list contains duplicates")]
    DuplicateParticipant,

    /// The local peer must be part of every generation it starts.
    #[error("participant list does not include the local peer")]
    LocalPeerMissing,

    /// A participant's identity key could not be resolved.
    #[error("no identity key known for {0:?}")]
    UnknownIdentity(PeerId),

    /// Combine was attempted while a secret is still missing.
    #[error("no secret collected for {0:?}")]
    MissingSecret(PeerId),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
