// crypto/kex.rs - hybrid classical + post-quantum key agreement capability
//
// The transport treats both primitives as opaque operations. The default
// provider pairs X25519 with ML-KEM-768; callers may supply any other
// implementation of `KeyExchange`.

use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Which side of the handshake a key pair is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub const fn to_byte(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }

    pub const fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Errors surfaced by key agreement providers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KexError {
    #[error("invalid {what} length: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("kem rejected {0}")]
    Kem(&'static str),
    #[error("classical exchange produced a non-contributory shared secret")]
    NonContributory,
}

/// Raw shared secret produced by one primitive; wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Opaque key pair; the private half is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private: Vec<u8>,
    public: Vec<u8>,
}

impl KeyPair {
    pub fn new(private: Vec<u8>, public: Vec<u8>) -> Self {
        Self { private, public }
    }

    pub fn private(&self) -> &[u8] {
        &self.private
    }

    pub fn public(&self) -> &[u8] {
        &self.public
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

/// Classical and post-quantum key agreement operations.
///
/// Secrets from both primitives must always be combined; neither is used alone.
pub trait KeyExchange: Send + Sync + 'static {
    fn generate_classic_key_pair(&self) -> KeyPair;

    fn generate_quantum_key_pair(&self, role: Role) -> KeyPair;

    /// Encapsulates against the peer's quantum public key, returning the secret and ciphertext.
    fn encapsulate(&self, peer_quantum_public: &[u8]) -> Result<(SharedSecret, Vec<u8>), KexError>;

    fn decapsulate(&self, own: &KeyPair, ciphertext: &[u8]) -> Result<SharedSecret, KexError>;

    fn ecdh(&self, peer_classic_public: &[u8], own: &KeyPair) -> Result<SharedSecret, KexError>;
}

/// X25519 + ML-KEM-768.
#[derive(Debug, Default, Clone, Copy)]
pub struct HybridKeyExchange;

const X25519_LEN: usize = 32;

fn x25519_bytes(what: &'static str, bytes: &[u8]) -> Result<[u8; X25519_LEN], KexError> {
    bytes.try_into().map_err(|_| KexError::InvalidLength {
        what,
        expected: X25519_LEN,
        actual: bytes.len(),
    })
}

impl KeyExchange for HybridKeyExchange {
    fn generate_classic_key_pair(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        KeyPair::new(secret.to_bytes().to_vec(), public.to_bytes().to_vec())
    }

    fn generate_quantum_key_pair(&self, _role: Role) -> KeyPair {
        // ML-KEM key pairs are role-independent.
        let (public, secret) = mlkem768::keypair();
        KeyPair::new(secret.as_bytes().to_vec(), public.as_bytes().to_vec())
    }

    fn encapsulate(&self, peer_quantum_public: &[u8]) -> Result<(SharedSecret, Vec<u8>), KexError> {
        if peer_quantum_public.len() != mlkem768::public_key_bytes() {
            return Err(KexError::InvalidLength {
                what: "quantum public key",
                expected: mlkem768::public_key_bytes(),
                actual: peer_quantum_public.len(),
            });
        }
        let public = mlkem768::PublicKey::from_bytes(peer_quantum_public)
            .map_err(|_| KexError::Kem("public key"))?;
        let (shared, ciphertext) = mlkem768::encapsulate(&public);
        Ok((
            SharedSecret::new(shared.as_bytes().to_vec()),
            ciphertext.as_bytes().to_vec(),
        ))
    }

    fn decapsulate(&self, own: &KeyPair, ciphertext: &[u8]) -> Result<SharedSecret, KexError> {
        if ciphertext.len() != mlkem768::ciphertext_bytes() {
            return Err(KexError::InvalidLength {
                what: "encapsulated message",
                expected: mlkem768::ciphertext_bytes(),
                actual: ciphertext.len(),
            });
        }
        let secret =
            mlkem768::SecretKey::from_bytes(own.private()).map_err(|_| KexError::Kem("secret key"))?;
        let ciphertext =
            mlkem768::Ciphertext::from_bytes(ciphertext).map_err(|_| KexError::Kem("ciphertext"))?;
        let shared = mlkem768::decapsulate(&ciphertext, &secret);
        Ok(SharedSecret::new(shared.as_bytes().to_vec()))
    }

    fn ecdh(&self, peer_classic_public: &[u8], own: &KeyPair) -> Result<SharedSecret, KexError> {
        let peer = X25519PublicKey::from(x25519_bytes("classic public key", peer_classic_public)?);
        let secret = StaticSecret::from(x25519_bytes("classic private key", own.private())?);
        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(KexError::NonContributory);
        }
        Ok(SharedSecret::new(shared.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_agrees() {
        let kex = HybridKeyExchange;
        let a = kex.generate_classic_key_pair();
        let b = kex.generate_classic_key_pair();
        let ab = kex.ecdh(b.public(), &a).expect("a side");
        let ba = kex.ecdh(a.public(), &b).expect("b side");
        assert_eq!(ab, ba);
        assert_eq!(ab.as_bytes().len(), 32);
    }

    #[test]
    fn kem_agrees() {
        let kex = HybridKeyExchange;
        let pair = kex.generate_quantum_key_pair(Role::Initiator);
        let (sent, ciphertext) = kex.encapsulate(pair.public()).expect("encapsulate");
        let received = kex.decapsulate(&pair, &ciphertext).expect("decapsulate");
        assert_eq!(sent, received);
    }

    #[test]
    fn rejects_bad_lengths() {
        let kex = HybridKeyExchange;
        let pair = kex.generate_classic_key_pair();
        assert!(matches!(
            kex.ecdh(&[0u8; 31], &pair),
            Err(KexError::InvalidLength { .. })
        ));
        assert!(matches!(
            kex.encapsulate(&[0u8; 12]),
            Err(KexError::InvalidLength { .. })
        ));
    }

    #[test]
    fn low_order_point_rejected() {
        let kex = HybridKeyExchange;
        let pair = kex.generate_classic_key_pair();
        assert_eq!(kex.ecdh(&[0u8; 32], &pair), Err(KexError::NonContributory));
    }
}
