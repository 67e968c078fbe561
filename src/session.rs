// session.rs - per-peer keys, replay state and the handshake state machine
//
// Initiator: Idle -> AwaitingServerHello -> KeyedUnauthenticated -> Established
// Responder: KeyedUnauthenticated (on ClientHello) -> Established
// Either side may move to Closed from any state.

use std::{net::SocketAddr, time::Instant};

use rand::{CryptoRng, RngCore};
use thiserror::Error;

use crate::{
    api::{DataKind, MessageType},
    buffer::{BufferFull, PooledBuffer},
    crypto::{
        kdf::{self, KdfError, MasterSecret, SessionKeys, RANDOM_LEN},
        kex::{KexError, KeyExchange, KeyPair, Role},
        mac::{MacError, TAG_LEN},
        packet,
        trust::{self, TrustError, TrustStore, TRANSCRIPT_HASH_LEN},
    },
    fragment::{FragmentError, FragmentLimits, InsertOutcome, Reassembly},
    replay::{ReplayGuard, EXTENDED_INDEX_BITS},
    wire::{self, ClientHello, Confirm, Envelope, Fragment, ServerHello, WireError},
};

/// First extended index used for outbound data.
pub const INITIAL_INDEX: u64 = 1;

const INDEX_LIMIT: u64 = 1 << EXTENDED_INDEX_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingServerHello,
    /// Both sides hold the keys but the peer's identity is unproven.
    KeyedUnauthenticated,
    Established,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{op} not permitted in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: HandshakeState,
    },
    #[error("connect id mismatch: expected {expected}, got {actual}")]
    ConnectIdMismatch { expected: u16, actual: u16 },
    #[error("sequence {0} replayed or outside the window")]
    Replayed(u32),
    #[error("data envelope without sequence")]
    MissingSequence,
    #[error("packet shorter than its header and tag")]
    Truncated,
    /// The 48-bit index is used up; no rekey exists.
    #[error("extended sequence index exhausted")]
    SequenceExhausted,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("key exchange error: {0}")]
    Kex(#[from] KexError),
    #[error("key derivation error: {0}")]
    Kdf(#[from] KdfError),
    #[error("packet authentication failed: {0}")]
    Mac(#[from] MacError),
    #[error("peer authentication failed: {0}")]
    Trust(#[from] TrustError),
    #[error("fragment rejected: {0}")]
    Fragment(#[from] FragmentError),
    #[error(transparent)]
    Buffer(#[from] BufferFull),
}

/// Outcome of [`Session::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// Extended index of the packet.
    pub index: u64,
    /// End of the body within the packet, excluding any tag.
    pub body_end: usize,
}

/// Keys agreed during the handshake.
struct Keyed {
    master: MasterSecret,
    keys: SessionKeys,
    transcript: [u8; TRANSCRIPT_HASH_LEN],
}

/// One remote peer.
pub struct Session {
    role: Role,
    state: HandshakeState,
    endpoint: SocketAddr,
    local_connect_id: u16,
    peer_connect_id: Option<u16>,
    peer_node_id: Option<u64>,
    classic: Option<KeyPair>,
    quantum: Option<KeyPair>,
    local_random: [u8; RANDOM_LEN],
    client_hello: Vec<u8>,
    keyed: Option<Keyed>,
    replay: ReplayGuard,
    next_index: u64,
    fragments: Reassembly,
    created_at: Instant,
    last_activity: Instant,
    established_at: Option<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("endpoint", &self.endpoint)
            .field("local_connect_id", &self.local_connect_id)
            .field("peer_connect_id", &self.peer_connect_id)
            .field("peer_node_id", &self.peer_node_id)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(role: Role, endpoint: SocketAddr, local_connect_id: u16, limits: FragmentLimits, now: Instant) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
            endpoint,
            local_connect_id,
            peer_connect_id: None,
            peer_node_id: None,
            classic: None,
            quantum: None,
            local_random: [0u8; RANDOM_LEN],
            client_hello: Vec::new(),
            keyed: None,
            replay: ReplayGuard::new(),
            next_index: INITIAL_INDEX,
            fragments: Reassembly::new(limits),
            created_at: now,
            last_activity: now,
            established_at: None,
        }
    }

    /// Pending outbound session occupying connect id `local_connect_id`.
    pub fn initiator(
        endpoint: SocketAddr,
        local_connect_id: u16,
        limits: FragmentLimits,
        now: Instant,
    ) -> Self {
        Self::new(Role::Initiator, endpoint, local_connect_id, limits, now)
    }

    /// Builds the ClientHello payload and waits for the reply.
    pub fn send_client_hello<R: RngCore + CryptoRng>(
        &mut self,
        kex: &dyn KeyExchange,
        rng: &mut R,
    ) -> Result<Vec<u8>, SessionError> {
        self.expect_state("send ClientHello", HandshakeState::Idle)?;

        let classic = kex.generate_classic_key_pair();
        let quantum = kex.generate_quantum_key_pair(Role::Initiator);
        rng.fill_bytes(&mut self.local_random);

        let mut payload = Vec::new();
        ClientHello {
            connect_id: self.local_connect_id,
            random: self.local_random,
            quantum_public: quantum.public(),
            classic_public: classic.public(),
        }
        .encode(&mut payload)?;

        self.classic = Some(classic);
        self.quantum = Some(quantum);
        self.client_hello = payload.clone();
        self.state = HandshakeState::AwaitingServerHello;
        Ok(payload)
    }

    /// Responder side: consumes a ClientHello and returns the keyed session
    /// together with the ServerHello payload to send back.
    pub fn accept_client_hello<R: RngCore + CryptoRng>(
        kex: &dyn KeyExchange,
        payload: &[u8],
        endpoint: SocketAddr,
        local_connect_id: u16,
        limits: FragmentLimits,
        now: Instant,
        rng: &mut R,
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let hello = ClientHello::decode(payload)?;

        let classic = kex.generate_classic_key_pair();
        let (quantum_secret, encapsulated) = kex.encapsulate(hello.quantum_public)?;
        let classic_secret = kex.ecdh(hello.classic_public, &classic)?;
        let master = kdf::combine_secrets(&quantum_secret, &classic_secret);

        let mut server_random = [0u8; RANDOM_LEN];
        rng.fill_bytes(&mut server_random);
        let keys = kdf::derive_session_keys(&master, &hello.random, &server_random, Role::Responder)?;

        let mut reply = Vec::new();
        ServerHello {
            initiator_connect_id: hello.connect_id,
            responder_connect_id: local_connect_id,
            random: server_random,
            encapsulated: &encapsulated,
            classic_public: classic.public(),
        }
        .encode(&mut reply)?;

        let mut session = Self::new(Role::Responder, endpoint, local_connect_id, limits, now);
        session.local_random = server_random;
        session.peer_connect_id = Some(hello.connect_id);
        session.keyed = Some(Keyed {
            master,
            keys,
            transcript: trust::transcript_hash(payload, &reply),
        });
        session.state = HandshakeState::KeyedUnauthenticated;
        Ok((session, reply))
    }

    /// Initiator side: derives the keys from the responder's reply.
    pub fn receive_server_hello(
        &mut self,
        kex: &dyn KeyExchange,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), SessionError> {
        self.expect_state("receive ServerHello", HandshakeState::AwaitingServerHello)?;
        let hello = ServerHello::decode(payload)?;
        if hello.initiator_connect_id != self.local_connect_id {
            return Err(SessionError::ConnectIdMismatch {
                expected: self.local_connect_id,
                actual: hello.initiator_connect_id,
            });
        }

        let (Some(quantum), Some(classic)) = (self.quantum.as_ref(), self.classic.as_ref()) else {
            return Err(SessionError::InvalidState {
                op: "receive ServerHello",
                state: self.state,
            });
        };
        let quantum_secret = kex.decapsulate(quantum, hello.encapsulated)?;
        let classic_secret = kex.ecdh(hello.classic_public, classic)?;
        let master = kdf::combine_secrets(&quantum_secret, &classic_secret);
        let keys = kdf::derive_session_keys(&master, &self.local_random, &hello.random, Role::Initiator)?;

        self.keyed = Some(Keyed {
            master,
            keys,
            transcript: trust::transcript_hash(&self.client_hello, payload),
        });
        self.peer_connect_id = Some(hello.responder_connect_id);
        self.classic = None;
        self.quantum = None;
        self.client_hello = Vec::new();
        self.state = HandshakeState::KeyedUnauthenticated;
        self.last_activity = now;
        Ok(())
    }

    /// Confirm payload proving this node's identity to the peer.
    pub fn confirm(&self, trust: &TrustStore) -> Result<Vec<u8>, SessionError> {
        if !matches!(
            self.state,
            HandshakeState::KeyedUnauthenticated | HandshakeState::Established
        ) {
            return Err(SessionError::InvalidState {
                op: "send Confirm",
                state: self.state,
            });
        }
        let keyed = self.keyed()?;
        let connect_id = self.peer_connect_id.ok_or(SessionError::InvalidState {
            op: "send Confirm",
            state: self.state,
        })?;
        let mut payload = Vec::new();
        Confirm {
            connect_id,
            node_id: trust.local_id(),
            proof: trust.local_proof(self.role, &keyed.transcript, &keyed.master),
        }
        .encode(&mut payload);
        Ok(payload)
    }

    /// Verifies the peer's proof and establishes the session.
    pub fn receive_confirm(
        &mut self,
        trust: &TrustStore,
        confirm: &Confirm,
        now: Instant,
    ) -> Result<u64, SessionError> {
        self.expect_state("receive Confirm", HandshakeState::KeyedUnauthenticated)?;
        if confirm.connect_id != self.local_connect_id {
            return Err(SessionError::ConnectIdMismatch {
                expected: self.local_connect_id,
                actual: confirm.connect_id,
            });
        }
        let keyed = self.keyed()?;
        trust.verify_peer(
            confirm.node_id,
            self.role.peer(),
            &keyed.transcript,
            &keyed.master,
            &confirm.proof,
        )?;

        self.peer_node_id = Some(confirm.node_id);
        self.state = HandshakeState::Established;
        self.established_at = Some(now);
        self.last_activity = now;
        Ok(confirm.node_id)
    }

    /// Wraps the payload already in `buf` into an encrypted, tagged packet.
    ///
    /// Returns the extended index the packet consumed.
    pub fn seal(
        &mut self,
        buf: &mut PooledBuffer,
        local_node_id: u64,
        project_id: Option<u64>,
        kind: DataKind,
        fragment: Option<Fragment>,
    ) -> Result<u64, SessionError> {
        self.expect_state("seal", HandshakeState::Established)?;
        let index = self.next_index;
        if index >= INDEX_LIMIT {
            return Err(SessionError::SequenceExhausted);
        }
        if buf.tail_room() < TAG_LEN {
            return Err(BufferFull {
                requested: TAG_LEN,
                available: buf.tail_room(),
            }
            .into());
        }

        let envelope = Envelope::data(project_id, local_node_id, index as u32, true);
        let header = wire::encode_header(&envelope, MessageType::from(kind), fragment)?;
        buf.prepend(header.as_slice())?;

        let keys = &self.keyed()?.keys.send;
        packet::apply_keystream(keys, local_node_id, index, &mut buf.as_mut_slice()[header.body_offset()..]);
        let tag = packet::sign(keys, buf.as_slice(), (index >> 32) as u32);
        buf.extend_from_slice(&tag)?;

        self.next_index += 1;
        Ok(index)
    }

    /// Authenticates, decrypts and replay-checks an inbound data packet.
    ///
    /// `packet` spans the whole datagram and `body_offset` is where the
    /// message-type byte starts. Replay state only moves once the tag has
    /// verified; cleartext packets are checked against the window but never
    /// advance it or refresh the idle timer.
    pub fn open(
        &mut self,
        envelope: &Envelope,
        packet: &mut [u8],
        body_offset: usize,
        now: Instant,
    ) -> Result<Opened, SessionError> {
        self.expect_state("open", HandshakeState::Established)?;
        let sequence = envelope.sequence.ok_or(SessionError::MissingSequence)?;
        let guess = self
            .replay
            .check(sequence)
            .ok_or(SessionError::Replayed(sequence))?;

        if !envelope.encrypted {
            return Ok(Opened {
                index: guess.index,
                body_end: packet.len(),
            });
        }

        if packet.len() < body_offset + TAG_LEN {
            return Err(SessionError::Truncated);
        }
        let keys = &self.keyed()?.keys.receive;
        let split = packet::verify(keys, packet, guess.rollover)?;
        packet::apply_keystream(keys, envelope.node_id, guess.index, &mut packet[body_offset..split]);

        self.replay.advance(sequence, guess);
        self.last_activity = now;
        Ok(Opened {
            index: guess.index,
            body_end: split,
        })
    }

    /// Feeds one authenticated fragment into reassembly.
    pub fn reassemble(
        &mut self,
        index: u64,
        kind: DataKind,
        fragment: Fragment,
        payload: &[u8],
        now: Instant,
    ) -> Result<InsertOutcome, SessionError> {
        Ok(self.fragments.insert(index, kind, fragment, payload, now)?)
    }

    pub fn evict_stale_fragments(&mut self, now: Instant) -> usize {
        self.fragments.evict_stale(now)
    }

    /// Wipes key material; later packets for this session are dropped.
    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
        self.keyed = None;
        self.classic = None;
        self.quantum = None;
        self.fragments.clear();
    }

    fn expect_state(&self, op: &'static str, expected: HandshakeState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn keyed(&self) -> Result<&Keyed, SessionError> {
        self.keyed.as_ref().ok_or(SessionError::InvalidState {
            op: "use keys",
            state: self.state,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn local_connect_id(&self) -> u16 {
        self.local_connect_id
    }

    pub fn peer_connect_id(&self) -> Option<u16> {
        self.peer_connect_id
    }

    pub fn peer_node_id(&self) -> Option<u64> {
        self.peer_node_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn established_at(&self) -> Option<Instant> {
        self.established_at
    }

    pub fn master_secret(&self) -> Option<&MasterSecret> {
        self.keyed.as_ref().map(|keyed| &keyed.master)
    }

    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keyed.as_ref().map(|keyed| &keyed.keys)
    }

    /// Next extended index [`seal`](Self::seal) will use.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    #[cfg(test)]
    pub(crate) fn set_next_index(&mut self, index: u64) {
        self.next_index = index;
    }
}
