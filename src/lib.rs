//! Commit-Reveal RNG
//!
//! A distributed commit-reveal protocol: mutually-distrusting peers on a
//! message-oriented transport collaboratively derive a single shared
//! random value. No participant, nor any coalition short of all of them,
//! can predict or bias the outcome, and any participant can detect a
//! cheating peer.
//!
//! ## Overview
//!
//! Every participant draws a fresh secret, commits to it with an HMAC
//! tag, and only reveals the secret once every commitment is on record.
//! Revealed secrets are checked against their commitments and folded, in
//! the agreed participant order, into one fixed-length result that every
//! honest participant computes identically.
//!
//! ## Key Components
//!
//! - **[`RngEngine`]**: the protocol engine: initiator and responder
//!   flows, idempotent packet handling, recovery requests
//! - **[`Packet`]**: the five wire packets and their two transport
//!   framings
//! - **Collaborator traits**: [`Transport`], [`ContactStore`] and
//!   [`EventSink`] are injected by the host; delivery, identity and
//!   notification handling all stay outside the engine
//! - **[`State`]**: the derived per-generation lifecycle
//!   (`Unknown → Init → Commit → Secret → Done`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use commit_reveal_rng::{
//!     ContactStore, Event, EventSink, IdentityKey, PeerAddr, PeerId, RngEngine, Transport,
//! };
//!
//! struct HostTransport;
//! impl Transport for HostTransport {
//!     fn send(&mut self, _to: PeerAddr, _data: &[u8]) -> bool {
//!         // hand the bytes to the actual messaging layer
//!         true
//!     }
//!     fn max_message_size(&self) -> usize {
//!         1300
//!     }
//! }
//!
//! struct HostContacts;
//! impl ContactStore for HostContacts {
//!     fn local_peer(&self) -> PeerId {
//!         PeerId(1)
//!     }
//!     fn identity_key(&self, _peer: PeerId) -> Option<IdentityKey> {
//!         unimplemented!("look up the peer's public key")
//!     }
//!     fn peer_by_key(&self, _key: &IdentityKey) -> Option<PeerId> {
//!         unimplemented!("reverse lookup")
//!     }
//!     fn route(&self, peer: PeerId) -> Option<PeerAddr> {
//!         Some(PeerAddr::Pairwise(peer.0))
//!     }
//! }
//!
//! struct Printer;
//! impl EventSink for Printer {
//!     fn on_event(&mut self, event: Event) {
//!         if let Event::Done { id, result } = event {
//!             println!("generation {} -> {}", hex::encode(id), hex::encode(result));
//!         }
//!     }
//! }
//!
//! let mut engine = RngEngine::new(
//!     Box::new(HostTransport),
//!     Box::new(HostContacts),
//!     Box::new(Printer),
//! );
//! let _id = engine
//!     .start_generation(&[PeerId(1), PeerId(2)], b"round 7")
//!     .unwrap();
//! // feed inbound packets as they arrive:
//! // engine.handle_packet(sender, &raw_bytes);
//! ```

pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod generation;
pub mod registry;
pub mod transport;
pub mod wire;

/// Generation identifier length in bytes.
pub const GENERATION_ID_LEN: usize = 32;

/// Per-participant secret value length in bytes.
pub const SECRET_LEN: usize = 32;

/// One-time mac key length in bytes.
pub const MAC_KEY_LEN: usize = 32;

/// Commitment tag length in bytes.
pub const MAC_LEN: usize = 32;

/// Participant identity key length in bytes.
pub const IDENTITY_KEY_LEN: usize = 32;

/// Final combined result length in bytes.
pub const RESULT_LEN: usize = 32;

pub use crypto::{Commitment, CryptoError, FinalResult, GenerationId, IdentityKey, Secret};
pub use engine::RngEngine;
pub use error::EngineError;
pub use events::{Event, EventSink, NullSink};
pub use generation::State;
pub use transport::{ContactStore, PeerAddr, PeerId, Transport};
pub use wire::{LinkKind, Packet, PacketType, WireError};
