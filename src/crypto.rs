//! Cryptographic primitives for the commit-reveal protocol
//!
//! This module provides the three operations the engine builds on:
//! commitment generation (fresh secret + one-time key + HMAC tag),
//! commitment verification, and the incremental combine accumulator
//! that folds every participant's revealed secret into the final result.
//!
//! All inputs and outputs are fixed-size; nothing here blocks or retries.

use std::fmt;

use blake2::{Blake2b512, Digest};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{GENERATION_ID_LEN, IDENTITY_KEY_LEN, MAC_KEY_LEN, MAC_LEN, RESULT_LEN, SECRET_LEN};

/// Generation identifier carried on every packet.
pub type GenerationId = [u8; GENERATION_ID_LEN];

/// Persistent public identity key of a participant.
pub type IdentityKey = [u8; IDENTITY_KEY_LEN];

/// Commitment tag exchanged before any secret is revealed.
pub type Commitment = [u8; MAC_LEN];

/// Final combined result of a completed generation.
pub type FinalResult = [u8; RESULT_LEN];

/// Domain prefix bound into every commitment tag.
const COMMIT_DOMAIN: &[u8] = b"commit-reveal-rng-commit-v1:";

/// Domain prefix for the combine accumulator.
const COMBINE_DOMAIN: &[u8] = b"commit-reveal-rng-combine-v1:";

/// Errors surfaced by the primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("mac key has invalid length")]
    InvalidKeyLength,
}

/// A participant's per-generation secret: the random value plus the
/// one-time key its commitment tag was computed with.
///
/// Never transmitted until the reveal phase. The memory is zeroized on
/// drop and the `Debug` impl never prints the contents.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    value: [u8; SECRET_LEN],
    key: [u8; MAC_KEY_LEN],
}

impl Secret {
    /// Draws a fresh secret value and mac key from the OS RNG.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut value = [0u8; SECRET_LEN];
        let mut key = [0u8; MAC_KEY_LEN];
        rng.fill_bytes(&mut value);
        rng.fill_bytes(&mut key);
        Self { value, key }
    }

    /// Reassembles a secret from its wire representation.
    pub fn from_parts(value: [u8; SECRET_LEN], key: [u8; MAC_KEY_LEN]) -> Self {
        Self { value, key }
    }

    pub fn value(&self) -> &[u8; SECRET_LEN] {
        &self.value
    }

    pub fn key(&self) -> &[u8; MAC_KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Computes the commitment tag: HMAC-SHA-256 over the domain prefix, the
/// full context (preamble plus user data) and the secret value, keyed
/// with the one-time mac key.
fn compute_tag(
    key: &[u8; MAC_KEY_LEN],
    context: &[u8],
    value: &[u8; SECRET_LEN],
) -> Result<Commitment, CryptoError> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(COMMIT_DOMAIN);
    mac.update(context);
    mac.update(value);
    let out = mac.finalize().into_bytes();
    let mut tag = [0u8; MAC_LEN];
    tag.copy_from_slice(&out);
    Ok(tag)
}

/// Generates a fresh secret and its commitment bound to `context`.
///
/// `context` must be the full initial state of the generation (preamble
/// followed by the user-supplied data), so the tag cannot be replayed
/// under a different generation ID or participant set.
pub fn generate_and_commit(context: &[u8]) -> Result<(Secret, Commitment), CryptoError> {
    let secret = Secret::generate();
    let tag = compute_tag(&secret.key, context, &secret.value)?;
    Ok((secret, tag))
}

/// Verifies a revealed secret against a previously stored commitment.
///
/// The tag is recomputed with the same context binding used at
/// generation time and compared in constant time. Returns `false` for
/// any mismatch; the caller decides how to surface the failure.
pub fn verify_commitment(secret: &Secret, commitment: &Commitment, context: &[u8]) -> bool {
    match compute_tag(&secret.key, context, &secret.value) {
        Ok(tag) => tag.ct_eq(commitment).unwrap_u8() == 1,
        Err(e) => {
            warn!("commitment verification aborted: {e}");
            false
        }
    }
}

/// Incremental one-way accumulator producing the final result.
///
/// Initialized from the first participant's secret, folded once per
/// subsequent participant in the agreed order, then finished with the
/// generation's initial state as trailing data. Reordering the folds
/// produces a different result, so the order must be externally agreed
/// (it is: the participant list order).
pub struct Combine {
    hasher: Blake2b512,
}

impl Combine {
    pub fn new(first: &Secret) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(COMBINE_DOMAIN);
        hasher.update(first.value());
        hasher.update(first.key());
        Self { hasher }
    }

    pub fn fold(&mut self, next: &Secret) {
        self.hasher.update(next.value());
        self.hasher.update(next.key());
    }

    pub fn finish(mut self, trailing: &[u8]) -> FinalResult {
        self.hasher.update(trailing);
        let digest = self.hasher.finalize();
        let mut out = [0u8; RESULT_LEN];
        out.copy_from_slice(&digest[..RESULT_LEN]);
        out
    }
}

/// Draws a fresh random generation identifier.
pub fn random_generation_id() -> GenerationId {
    let mut rng = rand::rng();
    let mut id = [0u8; GENERATION_ID_LEN];
    rng.fill_bytes(&mut id);
    id
}
