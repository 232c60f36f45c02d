//! Protocol engine and packet dispatcher
//!
//! This module glues the codec, the generation registry and the
//! cryptographic primitives into the actual protocol: the initiator and
//! responder flows, commit and secret collection, and the
//! request/response recovery paths.
//!
//! The engine is single-threaded and event-driven: every inbound packet
//! or local API call is handled to completion before the next one, so a
//! generation record is never observed half-mutated. Nothing here
//! blocks, suspends or runs timers; retransmission pacing belongs to
//! the host, which drives it through [`RngEngine::request_missing`] and
//! the request packets.
//!
//! Inbound packets are adversarial input. Anything malformed, unknown,
//! duplicated or out of protocol order is dropped with a log line and
//! no state change; the only way a peer can influence a generation is
//! by playing its own role in it.

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use crate::crypto::{self, Commitment, FinalResult, GenerationId, IdentityKey, Secret};
use crate::error::EngineError;
use crate::events::{Event, EventSink};
use crate::generation::{build_preamble, Generation, State};
use crate::registry::Registry;
use crate::transport::{ContactStore, PeerId, Transport};
use crate::wire::{init_packet_len, Packet};
use crate::{MAC_KEY_LEN, SECRET_LEN};

/// The protocol engine.
///
/// Owns the generation registry and the three injected collaborators:
/// the packet transport, the contact store and the event sink. All
/// state lives inside the instance; engines are freely constructible
/// and destructible.
pub struct RngEngine {
    transport: Box<dyn Transport>,
    contacts: Box<dyn ContactStore>,
    sink: Box<dyn EventSink>,
    registry: Registry,
}

impl RngEngine {
    pub fn new(
        transport: Box<dyn Transport>,
        contacts: Box<dyn ContactStore>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Self::with_retention(transport, contacts, sink, crate::registry::DEFAULT_RETENTION)
    }

    /// Like [`new`](Self::new) with an explicit bound on retained
    /// generation records.
    pub fn with_retention(
        transport: Box<dyn Transport>,
        contacts: Box<dyn ContactStore>,
        sink: Box<dyn EventSink>,
        retention: usize,
    ) -> Self {
        Self {
            transport,
            contacts,
            sink,
            registry: Registry::with_capacity(retention),
        }
    }

    /// Starts a new generation as initiator.
    ///
    /// `participants` is the full ordered list including the local
    /// peer; the order is fixed here and must reach every responder
    /// unchanged, since it determines the combine order.
    /// `initial_state` is the user-supplied data mixed into the result,
    /// shared in clear with all participants.
    ///
    /// On success the INIT packet has been handed to the transport for
    /// every other participant and the returned id can be used with
    /// [`state`](Self::state) and [`result`](Self::result). On error no
    /// record was created and nothing was sent.
    pub fn start_generation(
        &mut self,
        participants: &[PeerId],
        initial_state: &[u8],
    ) -> Result<GenerationId, EngineError> {
        let size = init_packet_len(participants.len(), initial_state.len());
        let limit = self.transport.max_message_size();
        if size > limit {
            return Err(EngineError::PacketTooLarge { size, limit });
        }
        if participants.len() < 2 {
            return Err(EngineError::TooFewParticipants);
        }
        let mut seen = HashSet::new();
        if !participants.iter().all(|p| seen.insert(*p)) {
            return Err(EngineError::DuplicateParticipant);
        }
        let local = self.contacts.local_peer();
        if !participants.contains(&local) {
            return Err(EngineError::LocalPeerMissing);
        }

        let mut keys = Vec::with_capacity(participants.len());
        for peer in participants {
            keys.push(
                self.contacts
                    .identity_key(*peer)
                    .ok_or(EngineError::UnknownIdentity(*peer))?,
            );
        }

        let id = crypto::random_generation_id();
        let preamble = build_preamble(&id, &keys);
        let mut generation =
            Generation::new(participants.to_vec(), initial_state.to_vec(), preamble);
        let (secret, commitment) = crypto::generate_and_commit(&generation.context())?;
        generation.insert_commitment(local, commitment);
        generation.insert_secret(local, secret);

        let total = participants.len();
        self.registry.insert(id, generation);
        info!(
            "started generation {} with {} participants",
            hex::encode(id),
            total
        );
        self.emit(Event::Init {
            id,
            participants: total,
        });
        self.emit(Event::Commit { id, have: 1, total });

        let init = Packet::Init {
            identity_keys: keys,
            commitment,
            initial_state: initial_state.to_vec(),
        };
        for peer in participants.iter().copied().filter(|p| *p != local) {
            self.send_to(peer, &id, &init);
        }
        Ok(id)
    }

    /// Entry point for inbound transport packets.
    ///
    /// `sender` is the participant the transport attributes the bytes
    /// to (resolution from transport-level addressing is the host's
    /// job). Returns whether the packet was accepted; rejected packets
    /// change no state.
    pub fn handle_packet(&mut self, sender: PeerId, raw: &[u8]) -> bool {
        let (_link, id, packet) = match Packet::decode(raw) {
            Ok(parts) => parts,
            Err(e) => {
                debug!("dropping malformed packet from {:?}: {}", sender, e);
                return false;
            }
        };
        match packet {
            Packet::Init {
                identity_keys,
                commitment,
                initial_state,
            } => self.handle_init(sender, id, identity_keys, commitment, initial_state),
            Packet::Commit { commitment } => self.handle_commit(sender, id, commitment),
            Packet::CommitRequest => self.handle_commit_request(sender, id),
            Packet::Secret { value, key } => self.handle_secret(sender, id, value, key),
            Packet::SecretRequest => self.handle_secret_request(sender, id),
        }
    }

    /// Current derived state of a generation; unseen ids report
    /// [`State::Unknown`].
    pub fn state(&self, id: &GenerationId) -> State {
        self.registry.state(id)
    }

    /// The cached final result, once the generation reached
    /// [`State::Done`].
    pub fn result(&self, id: &GenerationId) -> Option<FinalResult> {
        self.registry.get(id).and_then(|g| g.result().copied())
    }

    /// Sends recovery requests for whatever this generation is still
    /// missing: commitment requests while the commit phase is open,
    /// secret requests afterwards. Returns the number of requests
    /// handed to the transport. Pacing and retry policy are the host's
    /// business; the engine never runs timers.
    pub fn request_missing(&mut self, id: &GenerationId) -> usize {
        let local = self.contacts.local_peer();
        let Some(generation) = self.registry.get(id) else {
            return 0;
        };
        let (packet, targets): (Packet, Vec<PeerId>) = if !generation.commit_phase_closed() {
            (
                Packet::CommitRequest,
                generation
                    .participants()
                    .iter()
                    .copied()
                    .filter(|p| *p != local && generation.commitment(*p).is_none())
                    .collect(),
            )
        } else if !generation.all_secrets_present() {
            (
                Packet::SecretRequest,
                generation
                    .participants()
                    .iter()
                    .copied()
                    .filter(|p| *p != local && generation.secret(*p).is_none())
                    .collect(),
            )
        } else {
            return 0;
        };

        let mut sent = 0;
        for peer in targets {
            if self.send_to(peer, id, &packet) {
                sent += 1;
            }
        }
        sent
    }

    /// Responder flow for an inbound INIT packet.
    fn handle_init(
        &mut self,
        sender: PeerId,
        id: GenerationId,
        identity_keys: Vec<IdentityKey>,
        commitment: Commitment,
        initial_state: Vec<u8>,
    ) -> bool {
        if self.registry.contains(&id) {
            // Retransmission: the sender lost our commitment, resend it
            // and nothing else.
            debug!(
                "generation {} already known, resending commitment to {:?}",
                hex::encode(id),
                sender
            );
            return self.resend_commitment(sender, &id);
        }

        let mut participants = Vec::with_capacity(identity_keys.len());
        for key in &identity_keys {
            match self.contacts.peer_by_key(key) {
                Some(peer) => participants.push(peer),
                None => {
                    warn!(
                        "init for {} names an unknown identity key, dropping",
                        hex::encode(id)
                    );
                    return false;
                }
            }
        }
        if participants.len() < 2 {
            warn!(
                "init for {} with {} participants, dropping",
                hex::encode(id),
                participants.len()
            );
            return false;
        }
        let mut seen = HashSet::new();
        if !participants.iter().all(|p| seen.insert(*p)) {
            warn!(
                "init for {} lists a participant twice, dropping",
                hex::encode(id)
            );
            return false;
        }
        let local = self.contacts.local_peer();
        if !participants.contains(&local) {
            warn!(
                "init for {} does not include the local peer, dropping",
                hex::encode(id)
            );
            return false;
        }
        if !participants.contains(&sender) {
            warn!(
                "init for {} from non-participant {:?}, dropping",
                hex::encode(id),
                sender
            );
            return false;
        }

        // Rebuild the preamble from local contact knowledge, in the
        // received participant order.
        let mut keys = Vec::with_capacity(participants.len());
        for peer in &participants {
            match self.contacts.identity_key(*peer) {
                Some(key) => keys.push(key),
                None => {
                    warn!(
                        "no identity key for participant {:?} in generation {}, dropping",
                        peer,
                        hex::encode(id)
                    );
                    return false;
                }
            }
        }
        let preamble = build_preamble(&id, &keys);
        let mut generation = Generation::new(participants, initial_state, preamble);
        let (secret, own_commitment) = match crypto::generate_and_commit(&generation.context()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    "commitment generation failed for {}, dropping init: {e}",
                    hex::encode(id)
                );
                return false;
            }
        };
        generation.insert_commitment(local, own_commitment);
        generation.insert_secret(local, secret);
        generation.insert_commitment(sender, commitment);

        let have = generation.commitment_count();
        let total = generation.participants().len();
        self.registry.insert(id, generation);
        info!(
            "joined generation {} with {} participants",
            hex::encode(id),
            total
        );
        self.emit(Event::Init {
            id,
            participants: total,
        });
        self.emit(Event::Commit { id, have, total });
        self.send_to(sender, &id, &Packet::Commit { commitment: own_commitment });

        // In the two-party case this single packet can already close
        // the commit phase.
        self.close_commit_phase_if_ready(&id);
        self.try_finalize(&id);
        true
    }

    fn handle_commit(&mut self, sender: PeerId, id: GenerationId, commitment: Commitment) -> bool {
        let Some(generation) = self.registry.get_mut(&id) else {
            debug!(
                "commit for unknown generation {} from {:?}, dropping",
                hex::encode(id),
                sender
            );
            return false;
        };
        if !generation.is_participant(sender) {
            warn!(
                "commit from non-participant {:?} for generation {}, dropping",
                sender,
                hex::encode(id)
            );
            return false;
        }
        if !generation.insert_commitment(sender, commitment) {
            debug!(
                "duplicate commit from {:?} for generation {}",
                sender,
                hex::encode(id)
            );
            return true;
        }
        let have = generation.commitment_count();
        let total = generation.participants().len();
        info!(
            "commitment {}/{} collected for generation {}",
            have,
            total,
            hex::encode(id)
        );
        self.emit(Event::Commit { id, have, total });
        self.close_commit_phase_if_ready(&id);
        self.try_finalize(&id);
        true
    }

    fn handle_secret(
        &mut self,
        sender: PeerId,
        id: GenerationId,
        value: [u8; SECRET_LEN],
        key: [u8; MAC_KEY_LEN],
    ) -> bool {
        let Some(generation) = self.registry.get(&id) else {
            debug!(
                "secret for unknown generation {} from {:?}, dropping",
                hex::encode(id),
                sender
            );
            return false;
        };
        if !generation.is_participant(sender) {
            warn!(
                "secret from non-participant {:?} for generation {}, dropping",
                sender,
                hex::encode(id)
            );
            return false;
        }
        if generation.secret(sender).is_some() {
            debug!(
                "duplicate secret from {:?} for generation {}",
                sender,
                hex::encode(id)
            );
            return true;
        }

        let commit_closed = generation.commit_phase_closed();
        let secret = Secret::from_parts(value, key);
        if commit_closed {
            let context = generation.context();
            let valid = generation
                .commitment(sender)
                .is_some_and(|c| crypto::verify_commitment(&secret, c, &context));
            if !valid {
                warn!(
                    "secret from {:?} failed validation in generation {}",
                    sender,
                    hex::encode(id)
                );
                self.emit(Event::ValidationError { id, peer: sender });
                return true;
            }
        }

        let Some(generation) = self.registry.get_mut(&id) else {
            return false;
        };
        generation.insert_secret(sender, secret);
        let have = generation.secret_count();
        let total = generation.participants().len();
        if commit_closed {
            info!(
                "secret {}/{} collected for generation {}",
                have,
                total,
                hex::encode(id)
            );
            self.emit(Event::Secret { id, have, total });
        } else {
            // Arrived before the commit phase closed; kept unvalidated
            // and checked retroactively once it does.
            debug!(
                "stored early secret from {:?} for generation {}",
                sender,
                hex::encode(id)
            );
        }
        self.try_finalize(&id);
        true
    }

    /// Stateless recovery: resend our commitment to whoever asks.
    fn handle_commit_request(&mut self, sender: PeerId, id: GenerationId) -> bool {
        let Some(generation) = self.registry.get(&id) else {
            debug!(
                "commit request for unknown generation {} from {:?}, dropping",
                hex::encode(id),
                sender
            );
            return false;
        };
        if !generation.is_participant(sender) {
            warn!(
                "commit request from non-participant {:?} for generation {}, dropping",
                sender,
                hex::encode(id)
            );
            return false;
        }
        self.resend_commitment(sender, &id)
    }

    /// Recovery for the reveal phase; only honored once our own secret
    /// is safe to reveal, i.e. the commit phase is closed.
    fn handle_secret_request(&mut self, sender: PeerId, id: GenerationId) -> bool {
        let state = self.registry.state(&id);
        if state < State::Secret {
            debug!(
                "secret request for generation {} rejected in state {:?}",
                hex::encode(id),
                state
            );
            return false;
        }
        let Some(generation) = self.registry.get(&id) else {
            return false;
        };
        if !generation.is_participant(sender) {
            warn!(
                "secret request from non-participant {:?} for generation {}, dropping",
                sender,
                hex::encode(id)
            );
            return false;
        }
        let local = self.contacts.local_peer();
        let Some(secret) = generation.secret(local).cloned() else {
            error!(
                "local secret missing for generation {} in state {:?}",
                hex::encode(id),
                state
            );
            return false;
        };
        self.send_to(
            sender,
            &id,
            &Packet::Secret {
                value: *secret.value(),
                key: *secret.key(),
            },
        )
    }

    /// Runs after a commitment insertion. Once the last commitment is
    /// on record: retroactively validate secrets that arrived early,
    /// then reveal the local secret to everyone.
    fn close_commit_phase_if_ready(&mut self, id: &GenerationId) {
        let Some(generation) = self.registry.get(id) else {
            return;
        };
        if !generation.commit_phase_closed() {
            return;
        }

        let context = generation.context();
        let mut invalid = Vec::new();
        for peer in generation.peers_with_secrets() {
            if let (Some(secret), Some(commitment)) =
                (generation.secret(peer), generation.commitment(peer))
            {
                if !crypto::verify_commitment(secret, commitment, &context) {
                    invalid.push(peer);
                }
            }
        }

        let local = self.contacts.local_peer();
        let Some(generation) = self.registry.get_mut(id) else {
            return;
        };
        for peer in &invalid {
            generation.remove_secret(*peer);
            warn!(
                "early secret from {:?} failed validation in generation {}",
                peer,
                hex::encode(*id)
            );
        }
        let have = generation.secret_count();
        let total = generation.participants().len();
        let others: Vec<PeerId> = generation
            .participants()
            .iter()
            .copied()
            .filter(|p| *p != local)
            .collect();
        let own = generation.secret(local).cloned();

        for peer in invalid {
            self.emit(Event::ValidationError { id: *id, peer });
        }
        match own {
            Some(secret) => {
                let packet = Packet::Secret {
                    value: *secret.value(),
                    key: *secret.key(),
                };
                for peer in others {
                    self.send_to(peer, id, &packet);
                }
                info!(
                    "commit phase closed for generation {}, local secret revealed",
                    hex::encode(*id)
                );
                self.emit(Event::Secret {
                    id: *id,
                    have,
                    total,
                });
            }
            None => error!("local secret missing for generation {}", hex::encode(*id)),
        }
    }

    /// Combines and caches the final result once every commitment and
    /// every secret is on record.
    fn try_finalize(&mut self, id: &GenerationId) {
        let Some(generation) = self.registry.get(id) else {
            return;
        };
        if generation.result().is_some()
            || !generation.commit_phase_closed()
            || !generation.all_secrets_present()
        {
            return;
        }
        match generation.combine_result() {
            Ok(result) => {
                if let Some(generation) = self.registry.get_mut(id) {
                    generation.set_result(result);
                }
                info!("generation {} complete", hex::encode(*id));
                self.emit(Event::Done { id: *id, result });
            }
            // Defensive: all-secrets-present was checked above.
            Err(e) => error!("combine failed for generation {}: {e}", hex::encode(*id)),
        }
    }

    fn resend_commitment(&mut self, to: PeerId, id: &GenerationId) -> bool {
        let local = self.contacts.local_peer();
        let Some(commitment) = self
            .registry
            .get(id)
            .and_then(|g| g.commitment(local))
            .copied()
        else {
            warn!(
                "no local commitment to resend for generation {}",
                hex::encode(*id)
            );
            return false;
        };
        self.send_to(to, id, &Packet::Commit { commitment })
    }

    fn send_to(&mut self, peer: PeerId, id: &GenerationId, packet: &Packet) -> bool {
        let Some(addr) = self.contacts.route(peer) else {
            warn!("no route to participant {:?}", peer);
            return false;
        };
        let raw = packet.encode(addr.link_kind(), id);
        let accepted = self.transport.send(addr, &raw);
        if !accepted {
            warn!(
                "transport refused {:?} packet to {:?}",
                packet.packet_type(),
                peer
            );
        }
        accepted
    }

    fn emit(&mut self, event: Event) {
        self.sink.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;

    use crate::transport::PeerAddr;
    use crate::wire::{LinkKind, PacketType, TRANSPORT_ID_GROUP};
    use crate::IDENTITY_KEY_LEN;

    type Outbox = Rc<RefCell<VecDeque<(PeerAddr, Vec<u8>)>>>;

    struct MemTransport {
        outbox: Outbox,
        limit: usize,
    }

    impl Transport for MemTransport {
        fn send(&mut self, to: PeerAddr, data: &[u8]) -> bool {
            self.outbox.borrow_mut().push_back((to, data.to_vec()));
            true
        }

        fn max_message_size(&self) -> usize {
            self.limit
        }
    }

    struct MemContacts {
        local: PeerId,
        directory: HashMap<PeerId, IdentityKey>,
        group_links: bool,
    }

    impl ContactStore for MemContacts {
        fn local_peer(&self) -> PeerId {
            self.local
        }

        fn identity_key(&self, peer: PeerId) -> Option<IdentityKey> {
            self.directory.get(&peer).copied()
        }

        fn peer_by_key(&self, key: &IdentityKey) -> Option<PeerId> {
            self.directory
                .iter()
                .find(|(_, k)| *k == key)
                .map(|(p, _)| *p)
        }

        fn route(&self, peer: PeerId) -> Option<PeerAddr> {
            if !self.directory.contains_key(&peer) {
                return None;
            }
            Some(if self.group_links {
                PeerAddr::Group {
                    group: 7,
                    peer: peer.0,
                }
            } else {
                PeerAddr::Pairwise(peer.0)
            })
        }
    }

    struct RecordingSink(Rc<RefCell<Vec<Event>>>);

    impl EventSink for RecordingSink {
        fn on_event(&mut self, event: Event) {
            self.0.borrow_mut().push(event);
        }
    }

    struct Node {
        peer: PeerId,
        engine: RngEngine,
        outbox: Outbox,
        events: Rc<RefCell<Vec<Event>>>,
    }

    fn directory(n: u64) -> HashMap<PeerId, IdentityKey> {
        (1..=n)
            .map(|i| {
                let mut key = [0u8; IDENTITY_KEY_LEN];
                key[0] = i as u8;
                (PeerId(i), key)
            })
            .collect()
    }

    fn node_with_limit(
        peer: PeerId,
        directory: &HashMap<PeerId, IdentityKey>,
        group_links: bool,
        limit: usize,
    ) -> Node {
        let outbox: Outbox = Rc::new(RefCell::new(VecDeque::new()));
        let events = Rc::new(RefCell::new(Vec::new()));
        let engine = RngEngine::new(
            Box::new(MemTransport {
                outbox: outbox.clone(),
                limit,
            }),
            Box::new(MemContacts {
                local: peer,
                directory: directory.clone(),
                group_links,
            }),
            Box::new(RecordingSink(events.clone())),
        );
        Node {
            peer,
            engine,
            outbox,
            events,
        }
    }

    fn ring(n: u64, group_links: bool) -> Vec<Node> {
        let directory = directory(n);
        (1..=n)
            .map(|i| node_with_limit(PeerId(i), &directory, group_links, 1400))
            .collect()
    }

    /// Delivers queued packets until every outbox drains. Pairwise
    /// packets reach their addressee; group packets reach every other
    /// node, the way a group transport fans out. `tap` may mutate a
    /// packet in flight or suppress the delivery by returning false.
    /// Returns every delivery that was handed to an engine.
    fn pump_with(
        nodes: &mut [Node],
        tap: &mut dyn FnMut(PeerId, PeerId, &mut Vec<u8>) -> bool,
    ) -> Vec<(PeerId, PeerId, Vec<u8>)> {
        let mut deliveries = Vec::new();
        for _ in 0..1000 {
            let mut any = false;
            for i in 0..nodes.len() {
                let from = nodes[i].peer;
                let queued: Vec<(PeerAddr, Vec<u8>)> =
                    nodes[i].outbox.borrow_mut().drain(..).collect();
                for (addr, raw) in queued {
                    any = true;
                    let recipients: Vec<PeerId> = match addr {
                        PeerAddr::Pairwise(p) => vec![PeerId(p)],
                        PeerAddr::Group { .. } => nodes
                            .iter()
                            .map(|n| n.peer)
                            .filter(|p| *p != from)
                            .collect(),
                    };
                    for to in recipients {
                        let mut bytes = raw.clone();
                        if !tap(from, to, &mut bytes) {
                            continue;
                        }
                        if let Some(target) = nodes.iter_mut().find(|n| n.peer == to) {
                            target.engine.handle_packet(from, &bytes);
                            deliveries.push((from, to, bytes));
                        }
                    }
                }
            }
            if !any {
                return deliveries;
            }
        }
        panic!("message pump did not quiesce");
    }

    fn pump(nodes: &mut [Node]) -> Vec<(PeerId, PeerId, Vec<u8>)> {
        pump_with(nodes, &mut |_, _, _| true)
    }

    /// Opt-in protocol traces for debugging: RUST_LOG=debug cargo test.
    fn init_logging() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_two_party_run_completes_with_equal_results() {
        init_logging();
        let mut nodes = ring(2, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"seed")
            .unwrap();
        assert_eq!(nodes[0].engine.state(&id), State::Commit);
        assert_eq!(nodes[1].engine.state(&id), State::Unknown);

        pump(&mut nodes);

        let a = nodes[0].engine.result(&id).unwrap();
        let b = nodes[1].engine.result(&id).unwrap();
        assert_eq!(a, b);
        for n in &nodes {
            assert_eq!(n.engine.state(&id), State::Done);
        }
    }

    #[test]
    fn test_two_party_event_sequences() {
        let mut nodes = ring(2, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"seed")
            .unwrap();
        pump(&mut nodes);
        let result = nodes[0].engine.result(&id).unwrap();

        let initiator = nodes[0].events.borrow().clone();
        assert_eq!(
            initiator,
            vec![
                Event::Init { id, participants: 2 },
                Event::Commit { id, have: 1, total: 2 },
                Event::Commit { id, have: 2, total: 2 },
                Event::Secret { id, have: 1, total: 2 },
                Event::Secret { id, have: 2, total: 2 },
                Event::Done { id, result },
            ]
        );

        let responder = nodes[1].events.borrow().clone();
        assert_eq!(
            responder,
            vec![
                Event::Init { id, participants: 2 },
                Event::Commit { id, have: 2, total: 2 },
                Event::Secret { id, have: 1, total: 2 },
                Event::Secret { id, have: 2, total: 2 },
                Event::Done { id, result },
            ]
        );
    }

    #[test]
    fn test_three_party_group_run_completes() {
        init_logging();
        let mut nodes = ring(3, true);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2), PeerId(3)], b"tournament")
            .unwrap();

        pump(&mut nodes);

        let reference = nodes[0].engine.result(&id).unwrap();
        for n in &nodes {
            assert_eq!(n.engine.state(&id), State::Done);
            assert_eq!(n.engine.result(&id).unwrap(), reference);
        }
    }

    #[test]
    fn test_group_frames_carry_group_transport_id() {
        let mut nodes = ring(2, true);
        nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"")
            .unwrap();

        let deliveries = pump(&mut nodes);
        assert!(!deliveries.is_empty());
        for (_, _, raw) in &deliveries {
            assert_eq!(raw[0], TRANSPORT_ID_GROUP);
        }
    }

    #[test]
    fn test_three_party_pairwise_completes_via_recovery() {
        let mut nodes = ring(3, false);
        let participants = [PeerId(1), PeerId(2), PeerId(3)];
        let id = nodes[0]
            .engine
            .start_generation(&participants, b"seed")
            .unwrap();

        // Commitments only flow back to the initiator, so the push
        // phase leaves the responders one commitment short of closing.
        pump(&mut nodes);
        assert_eq!(nodes[0].engine.state(&id), State::Secret);
        assert_eq!(nodes[1].engine.state(&id), State::Commit);
        assert_eq!(nodes[2].engine.state(&id), State::Commit);

        // The initiator's secret reached the responders before their
        // commit phase closed: stored early, no progress event yet.
        let early = nodes[1].events.borrow().clone();
        assert_eq!(
            early,
            vec![
                Event::Init { id, participants: 3 },
                Event::Commit { id, have: 2, total: 3 },
            ]
        );

        assert_eq!(nodes[1].engine.request_missing(&id), 1);
        pump(&mut nodes);
        assert_eq!(nodes[1].engine.state(&id), State::Secret);

        assert_eq!(nodes[2].engine.request_missing(&id), 1);
        pump(&mut nodes);

        let reference = nodes[0].engine.result(&id).unwrap();
        for n in &nodes {
            assert_eq!(n.engine.state(&id), State::Done);
            assert_eq!(n.engine.result(&id).unwrap(), reference);
        }
    }

    #[test]
    fn test_duplicate_deliveries_are_noops() {
        let mut nodes = ring(2, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"seed")
            .unwrap();
        let deliveries = pump(&mut nodes);

        let results: Vec<_> = nodes.iter().map(|n| n.engine.result(&id)).collect();
        let events: Vec<Vec<Event>> = nodes.iter().map(|n| n.events.borrow().clone()).collect();

        // Replay the entire conversation; every packet is a duplicate
        // by now and must change nothing.
        for (from, to, raw) in &deliveries {
            let target = nodes.iter_mut().find(|n| n.peer == *to).unwrap();
            target.engine.handle_packet(*from, raw);
        }
        // Replayed INITs trigger commitment resends; drain those too.
        pump(&mut nodes);

        for (i, n) in nodes.iter().enumerate() {
            assert_eq!(n.engine.state(&id), State::Done);
            assert_eq!(n.engine.result(&id), results[i]);
            assert_eq!(*n.events.borrow(), events[i]);
        }
    }

    #[test]
    fn test_retransmitted_init_resends_commitment() {
        let mut nodes = ring(2, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"seed")
            .unwrap();
        let deliveries = pump(&mut nodes);
        let init_raw = deliveries
            .iter()
            .find(|(_, _, raw)| raw[1] == PacketType::Init as u8)
            .map(|(_, _, raw)| raw.clone())
            .unwrap();

        assert!(nodes[1].engine.handle_packet(PeerId(1), &init_raw));

        let queued: Vec<_> = nodes[1].outbox.borrow_mut().drain(..).collect();
        assert_eq!(queued.len(), 1);
        let (addr, raw) = &queued[0];
        assert_eq!(*addr, PeerAddr::Pairwise(1));
        let (_, decoded_id, packet) = Packet::decode(raw).unwrap();
        assert_eq!(decoded_id, id);
        assert!(matches!(packet, Packet::Commit { .. }));
    }

    #[test]
    fn test_tampered_secret_raises_validation_error() {
        let mut nodes = ring(3, false);
        let participants = [PeerId(1), PeerId(2), PeerId(3)];
        let id = nodes[0]
            .engine
            .start_generation(&participants, b"seed")
            .unwrap();

        // Flip one bit of every secret node 2 reveals towards node 3.
        let mut tamper = |from: PeerId, to: PeerId, raw: &mut Vec<u8>| {
            if from == PeerId(2) && to == PeerId(3) && raw[1] == PacketType::Secret as u8 {
                let last = raw.len() - 1;
                raw[last] ^= 0x01;
            }
            true
        };

        pump_with(&mut nodes, &mut tamper);
        nodes[1].engine.request_missing(&id);
        pump_with(&mut nodes, &mut tamper);
        nodes[2].engine.request_missing(&id);
        pump_with(&mut nodes, &mut tamper);

        // Nodes 1 and 2 saw only honest packets and complete.
        let reference = nodes[0].engine.result(&id).unwrap();
        assert_eq!(nodes[1].engine.result(&id).unwrap(), reference);

        // Node 3 detected the corruption, discarded the secret and is
        // stuck one reveal short of completion.
        assert_eq!(nodes[2].engine.state(&id), State::Secret);
        assert_eq!(nodes[2].engine.result(&id), None);
        assert!(nodes[2]
            .events
            .borrow()
            .contains(&Event::ValidationError { id, peer: PeerId(2) }));

        // An untampered retransmission still completes the generation.
        nodes[2].engine.request_missing(&id);
        pump(&mut nodes);
        assert_eq!(nodes[2].engine.result(&id).unwrap(), reference);
    }

    #[test]
    fn test_invalid_secret_is_discarded_not_stored() {
        let mut nodes = ring(2, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"seed")
            .unwrap();

        // Suppress the responder's genuine reveal so we can forge one.
        pump_with(&mut nodes, &mut |from, _, raw: &mut Vec<u8>| {
            !(from == PeerId(2) && raw[1] == PacketType::Secret as u8)
        });
        assert_eq!(nodes[0].engine.state(&id), State::Secret);

        let forged = Packet::Secret {
            value: [0xEE; SECRET_LEN],
            key: [0xEE; MAC_KEY_LEN],
        }
        .encode(LinkKind::Pairwise, &id);
        assert!(nodes[0].engine.handle_packet(PeerId(2), &forged));

        assert!(nodes[0]
            .events
            .borrow()
            .contains(&Event::ValidationError { id, peer: PeerId(2) }));
        assert_eq!(nodes[0].engine.state(&id), State::Secret);
        assert_eq!(nodes[0].engine.result(&id), None);

        // The honest reveal, recovered via a secret request, completes.
        nodes[0].engine.request_missing(&id);
        pump(&mut nodes);
        assert_eq!(nodes[0].engine.state(&id), State::Done);
        assert_eq!(
            nodes[0].engine.result(&id),
            nodes[1].engine.result(&id)
        );
    }

    #[test]
    fn test_secret_request_rejected_while_commit_phase_open() {
        let mut nodes = ring(3, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2), PeerId(3)], b"")
            .unwrap();
        pump(&mut nodes);
        assert_eq!(nodes[1].engine.state(&id), State::Commit);

        let request = Packet::SecretRequest.encode(LinkKind::Pairwise, &id);
        assert!(!nodes[1].engine.handle_packet(PeerId(1), &request));
        assert!(nodes[1].outbox.borrow().is_empty());
    }

    #[test]
    fn test_commit_request_is_stateless() {
        let mut nodes = ring(2, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"")
            .unwrap();
        pump(&mut nodes);

        let request = Packet::CommitRequest.encode(LinkKind::Pairwise, &id);
        assert!(nodes[0].engine.handle_packet(PeerId(2), &request));

        let queued: Vec<_> = nodes[0].outbox.borrow_mut().drain(..).collect();
        assert_eq!(queued.len(), 1);
        let (_, _, packet) = Packet::decode(&queued[0].1).unwrap();
        assert!(matches!(packet, Packet::Commit { .. }));
    }

    #[test]
    fn test_non_participant_sender_rejected() {
        let mut nodes = ring(3, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"")
            .unwrap();
        pump(&mut nodes);
        let events_before = nodes[0].events.borrow().clone();

        let commit = Packet::Commit {
            commitment: [0xAA; crate::MAC_LEN],
        }
        .encode(LinkKind::Pairwise, &id);
        assert!(!nodes[0].engine.handle_packet(PeerId(3), &commit));

        let secret = Packet::Secret {
            value: [0xBB; SECRET_LEN],
            key: [0xBB; MAC_KEY_LEN],
        }
        .encode(LinkKind::Pairwise, &id);
        assert!(!nodes[0].engine.handle_packet(PeerId(3), &secret));

        let request = Packet::SecretRequest.encode(LinkKind::Pairwise, &id);
        assert!(!nodes[0].engine.handle_packet(PeerId(3), &request));

        assert!(nodes[0].outbox.borrow().is_empty());
        assert_eq!(*nodes[0].events.borrow(), events_before);
    }

    #[test]
    fn test_unknown_generation_packets_dropped() {
        let mut nodes = ring(2, false);
        let id = [0x5A; 32];

        let commit = Packet::Commit {
            commitment: [1; crate::MAC_LEN],
        }
        .encode(LinkKind::Pairwise, &id);
        assert!(!nodes[0].engine.handle_packet(PeerId(2), &commit));

        let request = Packet::CommitRequest.encode(LinkKind::Pairwise, &id);
        assert!(!nodes[0].engine.handle_packet(PeerId(2), &request));

        assert_eq!(nodes[0].engine.state(&id), State::Unknown);
        assert_eq!(nodes[0].engine.result(&id), None);
        assert!(nodes[0].outbox.borrow().is_empty());
    }

    #[test]
    fn test_init_with_unresolvable_key_dropped() {
        let mut nodes = ring(2, false);
        let id = [0x11; 32];
        let known = directory(2)[&PeerId(1)];

        let init = Packet::Init {
            identity_keys: vec![known, [0xFF; IDENTITY_KEY_LEN]],
            commitment: [2; crate::MAC_LEN],
            initial_state: Vec::new(),
        }
        .encode(LinkKind::Pairwise, &id);

        assert!(!nodes[1].engine.handle_packet(PeerId(1), &init));
        assert_eq!(nodes[1].engine.state(&id), State::Unknown);
        assert!(nodes[1].events.borrow().is_empty());
    }

    #[test]
    fn test_init_excluding_local_peer_dropped() {
        let mut nodes = ring(3, false);
        let id = [0x22; 32];
        let dir = directory(3);

        // Lists peers 1 and 3; delivered to peer 2.
        let init = Packet::Init {
            identity_keys: vec![dir[&PeerId(1)], dir[&PeerId(3)]],
            commitment: [2; crate::MAC_LEN],
            initial_state: Vec::new(),
        }
        .encode(LinkKind::Pairwise, &id);

        assert!(!nodes[1].engine.handle_packet(PeerId(1), &init));
        assert_eq!(nodes[1].engine.state(&id), State::Unknown);
    }

    #[test]
    fn test_init_from_non_participant_dropped() {
        let mut nodes = ring(3, false);
        let id = [0x33; 32];
        let dir = directory(3);

        // Lists peers 1 and 2 but arrives from peer 3.
        let init = Packet::Init {
            identity_keys: vec![dir[&PeerId(1)], dir[&PeerId(2)]],
            commitment: [2; crate::MAC_LEN],
            initial_state: Vec::new(),
        }
        .encode(LinkKind::Pairwise, &id);

        assert!(!nodes[1].engine.handle_packet(PeerId(3), &init));
        assert_eq!(nodes[1].engine.state(&id), State::Unknown);
    }

    #[test]
    fn test_start_generation_preconditions() {
        let dir = directory(3);
        let mut node = node_with_limit(PeerId(1), &dir, false, 1400);

        assert!(matches!(
            node.engine.start_generation(&[PeerId(1)], b""),
            Err(EngineError::TooFewParticipants)
        ));
        assert!(matches!(
            node.engine
                .start_generation(&[PeerId(1), PeerId(2), PeerId(2)], b""),
            Err(EngineError::DuplicateParticipant)
        ));
        assert!(matches!(
            node.engine.start_generation(&[PeerId(2), PeerId(3)], b""),
            Err(EngineError::LocalPeerMissing)
        ));
        assert!(matches!(
            node.engine.start_generation(&[PeerId(1), PeerId(99)], b""),
            Err(EngineError::UnknownIdentity(PeerId(99)))
        ));

        // Nothing was created or sent on any failed attempt.
        assert!(node.outbox.borrow().is_empty());
        assert!(node.events.borrow().is_empty());
    }

    #[test]
    fn test_start_generation_rejects_oversized_init() {
        let dir = directory(2);
        let mut node = node_with_limit(PeerId(1), &dir, false, 64);

        let err = node
            .engine
            .start_generation(&[PeerId(1), PeerId(2)], b"some initial data")
            .unwrap_err();
        assert!(matches!(err, EngineError::PacketTooLarge { limit: 64, .. }));
        assert!(node.outbox.borrow().is_empty());
    }

    #[test]
    fn test_states_never_regress() {
        let mut nodes = ring(3, false);
        let id = nodes[0]
            .engine
            .start_generation(&[PeerId(1), PeerId(2), PeerId(3)], b"")
            .unwrap();

        let mut observed: Vec<Vec<State>> = vec![Vec::new(); 3];
        let mut snapshot = |nodes: &[Node], observed: &mut Vec<Vec<State>>| {
            for (i, n) in nodes.iter().enumerate() {
                observed[i].push(n.engine.state(&id));
            }
        };

        snapshot(&nodes, &mut observed);
        pump(&mut nodes);
        snapshot(&nodes, &mut observed);
        nodes[1].engine.request_missing(&id);
        pump(&mut nodes);
        snapshot(&nodes, &mut observed);
        nodes[2].engine.request_missing(&id);
        pump(&mut nodes);
        snapshot(&nodes, &mut observed);

        for states in &observed {
            for pair in states.windows(2) {
                assert!(pair[0] <= pair[1], "state regressed: {:?}", states);
            }
        }
        assert!(observed.iter().all(|s| *s.last().unwrap() == State::Done));
    }
}
