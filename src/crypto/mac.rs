// crypto/mac.rs - packet authentication tag
//
// Every encrypted datagram ends in the first 10 bytes of
// HMAC-SHA256(mac_key, packet || rollover). The rollover code never travels
// on the wire, so a packet replayed into a different 2^32 epoch fails here.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use super::kdf::MAC_KEY_LEN;

pub const TAG_LEN: usize = 10;

type PacketMac = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacError {
    /// Fewer (or more) than [`TAG_LEN`] bytes were offered as the tag.
    #[error("packet tag must be {TAG_LEN} bytes, got {0}")]
    BadTagLength(usize),
    #[error("packet tag mismatch")]
    Mismatch,
}

fn keyed(key: &[u8; MAC_KEY_LEN], packet: &[u8], rollover: u32) -> PacketMac {
    // HMAC takes keys of any length; a 20-byte key cannot be rejected.
    let mut mac = PacketMac::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(packet);
    mac.update(&rollover.to_be_bytes());
    mac
}

#[must_use]
pub fn compute(key: &[u8; MAC_KEY_LEN], packet: &[u8], rollover: u32) -> [u8; TAG_LEN] {
    let full = keyed(key, packet, rollover).finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

/// Checks `tag` against the leftmost bytes of the full HMAC in constant time.
pub fn verify(key: &[u8; MAC_KEY_LEN], packet: &[u8], rollover: u32, tag: &[u8]) -> Result<(), MacError> {
    if tag.len() != TAG_LEN {
        return Err(MacError::BadTagLength(tag.len()));
    }
    keyed(key, packet, rollover)
        .verify_truncated_left(tag)
        .map_err(|_| MacError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; MAC_KEY_LEN] = [0x5A; MAC_KEY_LEN];
    const PACKET: &[u8] = &[0x01, 0x64, 0x00, 0x00, 0x00, 0x09, 0x02, 0xC3, 0x7F];

    #[test]
    fn tag_is_hmac_prefix() {
        let mut full = PacketMac::new_from_slice(&KEY).expect("key");
        full.update(PACKET);
        full.update(&[0, 0, 0, 2]);
        let full = full.finalize().into_bytes();
        assert_eq!(compute(&KEY, PACKET, 2), full[..TAG_LEN]);
    }

    #[test]
    fn sealed_packet_verifies() {
        let tag = compute(&KEY, PACKET, 0);
        assert_eq!(verify(&KEY, PACKET, 0, &tag), Ok(()));
    }

    #[test]
    fn wrong_epoch_fails() {
        let tag = compute(&KEY, PACKET, 7);
        assert_eq!(verify(&KEY, PACKET, 8, &tag), Err(MacError::Mismatch));
    }

    #[test]
    fn flipped_header_bit_fails() {
        let tag = compute(&KEY, PACKET, 0);
        let mut tampered = PACKET.to_vec();
        tampered[5] ^= 0x01;
        assert_eq!(verify(&KEY, &tampered, 0, &tag), Err(MacError::Mismatch));
    }

    #[test]
    fn full_length_hmac_is_not_a_tag() {
        let mut full = PacketMac::new_from_slice(&KEY).expect("key");
        full.update(PACKET);
        full.update(&[0, 0, 0, 0]);
        let full = full.finalize().into_bytes();
        assert_eq!(verify(&KEY, PACKET, 0, &full), Err(MacError::BadTagLength(32)));
        assert_eq!(verify(&KEY, PACKET, 0, &full[..4]), Err(MacError::BadTagLength(4)));
    }
}
