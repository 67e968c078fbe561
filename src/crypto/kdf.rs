// crypto/kdf.rs - master secret combination and directional key schedule

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::kex::{Role, SharedSecret};

pub const MASTER_SECRET_LEN: usize = 32;
pub const KEY_MATERIAL_LEN: usize = 64;
pub const CIPHER_KEY_LEN: usize = 16;
pub const MAC_KEY_LEN: usize = 20;
pub const SALT_LEN: usize = 14;
pub const RANDOM_LEN: usize = 16;

/// PRF label for the first half of the key material.
pub const LABEL_EXPANSION_A: &[u8] = b"guardport key expansion A";
/// PRF label for the second half of the key material.
pub const LABEL_EXPANSION_B: &[u8] = b"guardport key expansion B";

const LABEL_CIPHER: u8 = 0;
const LABEL_MAC: u8 = 1;
const LABEL_SALT: u8 = 2;

// byte of the 14-byte salt that a 48-bit-shifted label lands in
const LABEL_BYTE: usize = SALT_LEN - 6 - 1;

pub(crate) type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdfError {
    #[error("key material offset {0} out of range")]
    OffsetOutOfRange(usize),
}

/// 32-byte secret both key sets derive from. Immutable once created.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; MASTER_SECRET_LEN]);

impl MasterSecret {
    pub fn as_bytes(&self) -> &[u8; MASTER_SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Keys protecting one direction of traffic.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    pub cipher_key: [u8; CIPHER_KEY_LEN],
    pub mac_key: [u8; MAC_KEY_LEN],
    pub salt: [u8; SALT_LEN],
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySet(..)")
    }
}

/// Send and receive key sets from one endpoint's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub send: KeySet,
    pub receive: KeySet,
}

/// Hashes both shared secrets into the master secret.
///
/// BLAKE3 is not subject to length extension, so a single pass over the
/// concatenation suffices.
pub fn combine_secrets(quantum: &SharedSecret, classic: &SharedSecret) -> MasterSecret {
    let mut hasher = blake3::Hasher::new();
    hasher.update(quantum.as_bytes());
    hasher.update(classic.as_bytes());
    MasterSecret(*hasher.finalize().as_bytes())
}

/// Expands the master secret into 64 bytes of key material.
pub fn prf(
    master: &MasterSecret,
    label_a: &[u8],
    label_b: &[u8],
    seed: &[u8],
) -> [u8; KEY_MATERIAL_LEN] {
    let mut material = [0u8; KEY_MATERIAL_LEN];

    let mut first = blake3::Hasher::new();
    first.update(master.as_bytes());
    first.update(label_a);
    first.update(seed);
    material[..32].copy_from_slice(first.finalize().as_bytes());

    let mut second = blake3::Hasher::new();
    second.update(&material[..32]);
    second.update(master.as_bytes());
    second.update(label_b);
    second.update(seed);
    material[32..].copy_from_slice(second.finalize().as_bytes());

    material
}

fn label_iv(salt: &[u8; SALT_LEN], label: u8) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..SALT_LEN].copy_from_slice(salt);
    iv[LABEL_BYTE] ^= label;
    iv
}

fn keystream<const N: usize>(key: &[u8; CIPHER_KEY_LEN], iv: &[u8; 16]) -> [u8; N] {
    let mut out = [0u8; N];
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(&mut out);
    out
}

/// Derives one direction's key set from the 30 bytes of material at `offset`.
pub fn derive_key_set(material: &[u8; KEY_MATERIAL_LEN], offset: usize) -> Result<KeySet, KdfError> {
    if offset + CIPHER_KEY_LEN + SALT_LEN > KEY_MATERIAL_LEN {
        return Err(KdfError::OffsetOutOfRange(offset));
    }

    let mut seed_key = [0u8; CIPHER_KEY_LEN];
    seed_key.copy_from_slice(&material[offset..offset + CIPHER_KEY_LEN]);
    let mut seed_salt = [0u8; SALT_LEN];
    seed_salt.copy_from_slice(&material[offset + CIPHER_KEY_LEN..offset + CIPHER_KEY_LEN + SALT_LEN]);

    let keys = KeySet {
        cipher_key: keystream(&seed_key, &label_iv(&seed_salt, LABEL_CIPHER)),
        mac_key: keystream(&seed_key, &label_iv(&seed_salt, LABEL_MAC)),
        salt: keystream(&seed_key, &label_iv(&seed_salt, LABEL_SALT)),
    };
    seed_key.zeroize();
    seed_salt.zeroize();
    Ok(keys)
}

/// Derives both directions. Bytes 0..32 protect initiator-to-responder
/// traffic and bytes 32..64 the reverse.
pub fn derive_session_keys(
    master: &MasterSecret,
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
    role: Role,
) -> Result<SessionKeys, KdfError> {
    let mut seed = [0u8; RANDOM_LEN * 2];
    seed[..RANDOM_LEN].copy_from_slice(client_random);
    seed[RANDOM_LEN..].copy_from_slice(server_random);

    let mut material = prf(master, LABEL_EXPANSION_A, LABEL_EXPANSION_B, &seed);
    let initiator_to_responder = derive_key_set(&material, 0)?;
    let responder_to_initiator = derive_key_set(&material, 32)?;
    material.zeroize();

    Ok(match role {
        Role::Initiator => SessionKeys {
            send: initiator_to_responder,
            receive: responder_to_initiator,
        },
        Role::Responder => SessionKeys {
            send: responder_to_initiator,
            receive: initiator_to_responder,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> MasterSecret {
        combine_secrets(
            &SharedSecret::new(vec![0x11; 32]),
            &SharedSecret::new(vec![0x22; 32]),
        )
    }

    #[test]
    fn combine_depends_on_both_secrets() {
        let base = master();
        let other_quantum = combine_secrets(
            &SharedSecret::new(vec![0x12; 32]),
            &SharedSecret::new(vec![0x22; 32]),
        );
        let other_classic = combine_secrets(
            &SharedSecret::new(vec![0x11; 32]),
            &SharedSecret::new(vec![0x23; 32]),
        );
        assert_ne!(base, other_quantum);
        assert_ne!(base, other_classic);
    }

    #[test]
    fn prf_halves_are_chained() {
        let m = master();
        let material = prf(&m, LABEL_EXPANSION_A, LABEL_EXPANSION_B, b"seed");
        let mut expected = blake3::Hasher::new();
        expected.update(&material[..32]);
        expected.update(m.as_bytes());
        expected.update(LABEL_EXPANSION_B);
        expected.update(b"seed");
        assert_eq!(&material[32..], expected.finalize().as_bytes());
        assert_ne!(&material[..32], &material[32..]);
    }

    #[test]
    fn directions_are_independent() {
        let keys = derive_session_keys(&master(), &[1; 16], &[2; 16], Role::Initiator).unwrap();
        assert_ne!(keys.send.cipher_key, keys.receive.cipher_key);
        assert_ne!(keys.send.salt, keys.receive.salt);
        assert_ne!(keys.send.mac_key, keys.receive.mac_key);
    }

    #[test]
    fn roles_mirror_each_other() {
        let m = master();
        let initiator = derive_session_keys(&m, &[1; 16], &[2; 16], Role::Initiator).unwrap();
        let responder = derive_session_keys(&m, &[1; 16], &[2; 16], Role::Responder).unwrap();
        assert_eq!(initiator.send, responder.receive);
        assert_eq!(initiator.receive, responder.send);
    }

    #[test]
    fn labels_produce_distinct_keys() {
        let material = [7u8; KEY_MATERIAL_LEN];
        let set = derive_key_set(&material, 0).unwrap();
        assert_ne!(&set.cipher_key[..], &set.mac_key[..16]);
        assert_ne!(&set.cipher_key[..14], &set.salt[..]);
    }

    #[test]
    fn rejects_offset_past_material() {
        let material = [0u8; KEY_MATERIAL_LEN];
        assert_eq!(
            derive_key_set(&material, 40),
            Err(KdfError::OffsetOutOfRange(40))
        );
    }
}
