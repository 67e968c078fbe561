// crypto/trust.rs - per-node authentication keys and handshake confirmation proofs
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use ahash::AHashMap;

use super::{kdf::MasterSecret, kex::Role};

pub const PSK_LEN: usize = 32;
pub const PROOF_LEN: usize = 32;
pub const TRANSCRIPT_HASH_LEN: usize = 32;

const CONFIRM_LABEL: &[u8] = b"guardport confirm";

type HmacSha256 = Hmac<Sha256>;

/// Pre-shared key bound to one node id.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Psk([u8; PSK_LEN]);

impl Psk {
    pub fn new(bytes: [u8; PSK_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Psk(..)")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrustError {
    /// Node id 0 is reserved for handshake traffic.
    #[error("node id 0 cannot carry a trust entry")]
    ReservedNodeId,
    #[error("no pre-shared key for node {0}")]
    UnknownNode(u64),
    #[error("confirmation proof mismatch for node {0}")]
    ProofMismatch(u64),
}

/// Local identity plus the keys of every peer this node will accept.
#[derive(Debug, Clone)]
pub struct TrustStore {
    local_id: u64,
    local_key: Psk,
    peers: AHashMap<u64, Psk>,
}

impl TrustStore {
    pub fn new(local_id: u64, local_key: Psk) -> Result<Self, TrustError> {
        if local_id == 0 {
            return Err(TrustError::ReservedNodeId);
        }
        Ok(Self {
            local_id,
            local_key,
            peers: AHashMap::default(),
        })
    }

    /// Adds or replaces the key for `node_id`.
    pub fn insert(&mut self, node_id: u64, key: Psk) -> Result<(), TrustError> {
        if node_id == 0 {
            return Err(TrustError::ReservedNodeId);
        }
        self.peers.insert(node_id, key);
        Ok(())
    }

    pub fn remove(&mut self, node_id: u64) -> bool {
        self.peers.remove(&node_id).is_some()
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn resolve(&self, node_id: u64) -> Option<&Psk> {
        self.peers.get(&node_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Proof that this node holds its own key and the agreed master secret.
    pub fn local_proof(
        &self,
        role: Role,
        transcript: &[u8; TRANSCRIPT_HASH_LEN],
        master: &MasterSecret,
    ) -> [u8; PROOF_LEN] {
        confirmation_proof(&self.local_key, role, self.local_id, transcript, master)
    }

    /// Checks a peer's proof in constant time.
    pub fn verify_peer(
        &self,
        node_id: u64,
        role: Role,
        transcript: &[u8; TRANSCRIPT_HASH_LEN],
        master: &MasterSecret,
        proof: &[u8],
    ) -> Result<(), TrustError> {
        let key = self.resolve(node_id).ok_or(TrustError::UnknownNode(node_id))?;
        let expected = confirmation_proof(key, role, node_id, transcript, master);
        if expected.as_slice().ct_eq(proof).into() {
            Ok(())
        } else {
            Err(TrustError::ProofMismatch(node_id))
        }
    }
}

/// Hash of the two hello payloads, binding the proof to this exchange.
#[must_use]
pub fn transcript_hash(client_hello: &[u8], server_hello: &[u8]) -> [u8; TRANSCRIPT_HASH_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(client_hello);
    hasher.update(server_hello);
    *hasher.finalize().as_bytes()
}

#[must_use]
pub fn confirmation_proof(
    key: &Psk,
    role: Role,
    node_id: u64,
    transcript: &[u8; TRANSCRIPT_HASH_LEN],
    master: &MasterSecret,
) -> [u8; PROOF_LEN] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("hmac key length should be valid");
    mac.update(CONFIRM_LABEL);
    mac.update(&[role.to_byte()]);
    mac.update(&node_id.to_be_bytes());
    mac.update(transcript);
    mac.update(master.as_bytes());
    mac.finalize().into_bytes().into()
}
