// crypto/packet.rs - per-packet IV, counter-mode transform and truncated MAC

use ctr::cipher::{KeyIvInit, StreamCipher};

use super::{
    kdf::{Aes128Ctr, KeySet, SALT_LEN},
    mac::{self, MacError, TAG_LEN},
};

pub const IV_LEN: usize = 16;

/// Builds the counter block for one packet.
///
/// Bytes 4..8 carry the low 32 bits of the sender's node id and bytes 8..14 the
/// 48-bit extended index, each XORed with the session salt. The final two
/// bytes stay zero and serve as the block counter.
#[must_use]
pub fn build_iv(salt: &[u8; SALT_LEN], node_id: u64, extended_index: u64) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[..4].copy_from_slice(&salt[..4]);

    let node = (node_id as u32).to_be_bytes();
    for (i, byte) in node.iter().enumerate() {
        iv[4 + i] = byte ^ salt[4 + i];
    }

    let index = extended_index.to_be_bytes();
    for (i, byte) in index[2..].iter().enumerate() {
        iv[8 + i] = byte ^ salt[8 + i];
    }
    iv
}

/// Encrypts or decrypts `data` in place.
pub fn apply_keystream(keys: &KeySet, node_id: u64, extended_index: u64, data: &mut [u8]) {
    let iv = build_iv(&keys.salt, node_id, extended_index);
    let mut cipher = Aes128Ctr::new((&keys.cipher_key).into(), (&iv).into());
    cipher.apply_keystream(data);
}

/// Tags every packet byte that precedes the tag.
#[must_use]
pub fn sign(keys: &KeySet, authenticated: &[u8], rollover: u32) -> [u8; TAG_LEN] {
    mac::compute(&keys.mac_key, authenticated, rollover)
}

/// Checks the trailing tag of `packet` and returns the authenticated prefix length.
pub fn verify(keys: &KeySet, packet: &[u8], rollover: u32) -> Result<usize, MacError> {
    if packet.len() < TAG_LEN {
        return Err(MacError::BadTagLength(packet.len()));
    }
    let split = packet.len() - TAG_LEN;
    mac::verify(&keys.mac_key, &packet[..split], rollover, &packet[split..])?;
    Ok(split)
}
