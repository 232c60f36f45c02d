//! Per-generation record and its derived state
//!
//! A [`Generation`] holds everything one run of the protocol collects:
//! the agreed participant order, the user-supplied initial data, the
//! locally built preamble, and the commitment and secret containers.
//! The record's logical [`State`] is never stored; it is recomputed from
//! the container contents on every query, which keeps the lattice
//! monotone by construction (the containers only grow, except for
//! evicting a secret that failed validation).

use std::collections::HashMap;

use crate::crypto::{Combine, Commitment, FinalResult, GenerationId, IdentityKey, Secret};
use crate::error::EngineError;
use crate::transport::PeerId;

/// Logical state of a generation, most-advanced first.
///
/// Evaluated in precedence order: a cached result wins over full
/// commitment coverage, which wins over partial coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Generation id never seen.
    Unknown,
    /// Record exists, no commitments collected yet.
    Init,
    /// At least one commitment collected, but not all.
    Commit,
    /// Commit phase closed; reveal phase active.
    Secret,
    /// Final result computed and cached.
    Done,
}

/// Builds the preamble every participant derives locally: the
/// generation id followed by each participant's identity key, in
/// participant-list order.
pub fn build_preamble(id: &GenerationId, keys: &[IdentityKey]) -> Vec<u8> {
    let mut preamble = Vec::with_capacity(id.len() + keys.len() * crate::IDENTITY_KEY_LEN);
    preamble.extend_from_slice(id);
    for key in keys {
        preamble.extend_from_slice(key);
    }
    preamble
}

/// One in-flight (or completed) generation.
pub struct Generation {
    /// All participants including self; order fixed at creation and
    /// identical across honest peers, it determines the combine order.
    participants: Vec<PeerId>,
    /// User-supplied initial data, shared in clear.
    initial_state: Vec<u8>,
    /// Generation id plus identity keys, in participant order.
    preamble: Vec<u8>,
    commitments: HashMap<PeerId, Commitment>,
    secrets: HashMap<PeerId, Secret>,
    final_result: Option<FinalResult>,
}

impl Generation {
    pub fn new(participants: Vec<PeerId>, initial_state: Vec<u8>, preamble: Vec<u8>) -> Self {
        Self {
            participants,
            initial_state,
            preamble,
            commitments: HashMap::new(),
            secrets: HashMap::new(),
            final_result: None,
        }
    }

    pub fn state(&self) -> State {
        if self.final_result.is_some() {
            State::Done
        } else if !self.commitments.is_empty()
            && self.commitments.len() == self.participants.len()
        {
            State::Secret
        } else if !self.commitments.is_empty() {
            State::Commit
        } else {
            State::Init
        }
    }

    pub fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    pub fn is_participant(&self, peer: PeerId) -> bool {
        self.participants.contains(&peer)
    }

    /// The commitment binding context: preamble followed by the
    /// user-supplied initial data. Also the trailing data of the
    /// combine step.
    pub fn context(&self) -> Vec<u8> {
        let mut context = Vec::with_capacity(self.preamble.len() + self.initial_state.len());
        context.extend_from_slice(&self.preamble);
        context.extend_from_slice(&self.initial_state);
        context
    }

    pub fn commitment(&self, peer: PeerId) -> Option<&Commitment> {
        self.commitments.get(&peer)
    }

    /// Stores a commitment unless this participant already has one.
    /// Returns whether it was stored; an existing entry is never
    /// overwritten.
    pub fn insert_commitment(&mut self, peer: PeerId, commitment: Commitment) -> bool {
        if self.commitments.contains_key(&peer) {
            return false;
        }
        self.commitments.insert(peer, commitment);
        true
    }

    pub fn commitment_count(&self) -> usize {
        self.commitments.len()
    }

    pub fn commit_phase_closed(&self) -> bool {
        self.commitments.len() == self.participants.len()
    }

    pub fn secret(&self, peer: PeerId) -> Option<&Secret> {
        self.secrets.get(&peer)
    }

    /// Stores a revealed secret unless this participant already has
    /// one. Validation is the caller's concern.
    pub fn insert_secret(&mut self, peer: PeerId, secret: Secret) -> bool {
        if self.secrets.contains_key(&peer) {
            return false;
        }
        self.secrets.insert(peer, secret);
        true
    }

    /// Evicts a secret that failed validation. Commitments are
    /// untouched, so the aggregate state cannot regress below
    /// [`State::Secret`].
    pub fn remove_secret(&mut self, peer: PeerId) {
        self.secrets.remove(&peer);
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    /// Peers whose secrets arrived before the commit phase closed and
    /// are therefore stored unvalidated.
    pub fn peers_with_secrets(&self) -> Vec<PeerId> {
        self.participants
            .iter()
            .copied()
            .filter(|p| self.secrets.contains_key(p))
            .collect()
    }

    pub fn all_secrets_present(&self) -> bool {
        self.secrets.len() == self.participants.len()
    }

    /// Folds every secret in participant order, then the context, into
    /// the final result. A missing secret is a defensive error; callers
    /// check [`all_secrets_present`](Self::all_secrets_present) first.
    pub fn combine_result(&self) -> Result<FinalResult, EngineError> {
        let mut peers = self.participants.iter();
        let first = peers.next().ok_or(EngineError::TooFewParticipants)?;
        let first_secret = self
            .secrets
            .get(first)
            .ok_or(EngineError::MissingSecret(*first))?;

        let mut acc = Combine::new(first_secret);
        for peer in peers {
            let secret = self
                .secrets
                .get(peer)
                .ok_or(EngineError::MissingSecret(*peer))?;
            acc.fold(secret);
        }
        Ok(acc.finish(&self.context()))
    }

    pub fn result(&self) -> Option<&FinalResult> {
        self.final_result.as_ref()
    }

    pub fn set_result(&mut self, result: FinalResult) {
        self.final_result = Some(result);
    }
}
