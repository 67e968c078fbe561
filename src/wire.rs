// Wire format: envelope header, body prefix and handshake payload codecs.
//
// ```text
// [1 flags]
// [compressed project id]      multitenant only
// [compressed node id]         0 = handshake
// [4 sequence, BE]             node id != 0 only
// ---- encrypted from here when flags.encrypted ----
// [1 message type]
// [compressed fragment index]  fragmented only
// [compressed fragment count]  fragmented only
// [payload]
// [10 tag]                     encrypted only
// ```
//
// Flag bit 2 (fragmented) is a deliberate change to the ledger-peer layout,
// which defines only bits 0 and 1 and always writes the fragment fields.
// Peers speaking that layout cannot parse these envelopes and vice versa.

use thiserror::Error;

use crate::{
    api::MessageType,
    codec::{self, CodecError, Reader, MAX_ENCODED_LEN},
    crypto::{kdf::RANDOM_LEN, trust::PROOF_LEN},
};

/// Bit-flags carried in the first envelope byte.
pub mod flags {
    /// Body is encrypted and a tag trails the packet.
    pub const ENCRYPTED: u8 = 0b001;
    /// A project id follows the flags byte.
    pub const MULTITENANT: u8 = 0b010;
    /// Fragment index and count follow the message type.
    pub const FRAGMENTED: u8 = 0b100;

    pub const KNOWN: u8 = ENCRYPTED | MULTITENANT | FRAGMENTED;
}

pub const SEQUENCE_LEN: usize = 4;

/// Cleartext prefix up to and including the sequence.
pub const MAX_OUTER_HEADER_LEN: usize = 1 + MAX_ENCODED_LEN * 2 + SEQUENCE_LEN;

/// Message type plus fragment fields.
pub const MAX_INNER_HEADER_LEN: usize = 1 + MAX_ENCODED_LEN * 2;

pub const MAX_HEADER_LEN: usize = MAX_OUTER_HEADER_LEN + MAX_INNER_HEADER_LEN;

/// Wire-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Flag bits outside the assigned range were set.
    #[error("unknown flag bits {0:#05b}")]
    UnknownFlags(u8),

    /// Node id 0 arrived with the encrypted or fragmented flag.
    #[error("handshake envelope carries flags {0:#05b}")]
    InvalidHandshakeFlags(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Fragment fields are inconsistent.
    #[error("invalid fragment {index} of {count}")]
    InvalidFragment { index: u64, count: u64 },

    /// Field length does not fit its `u16` prefix.
    #[error("{what} length {len} exceeds u16 range")]
    FieldTooLong { what: &'static str, len: usize },

    /// Bytes remained after a fixed-layout payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Node id 0 appeared where a sender id was required.
    #[error("reserved node id in confirm")]
    ReservedNodeId,
}

/// Cleartext envelope fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub encrypted: bool,
    pub fragmented: bool,
    pub project_id: Option<u64>,
    pub node_id: u64,
    /// Present iff `node_id != 0`.
    pub sequence: Option<u32>,
}

impl Envelope {
    /// Envelope for handshake traffic: node id 0, never encrypted.
    pub const fn handshake(project_id: Option<u64>) -> Self {
        Self {
            encrypted: false,
            fragmented: false,
            project_id,
            node_id: 0,
            sequence: None,
        }
    }

    pub const fn data(project_id: Option<u64>, node_id: u64, sequence: u32, encrypted: bool) -> Self {
        Self {
            encrypted,
            fragmented: false,
            project_id,
            node_id,
            sequence: Some(sequence),
        }
    }

    pub const fn is_handshake(&self) -> bool {
        self.node_id == 0
    }

    pub fn flags(&self) -> u8 {
        let mut out = 0;
        if self.encrypted {
            out |= flags::ENCRYPTED;
        }
        if self.project_id.is_some() {
            out |= flags::MULTITENANT;
        }
        if self.fragmented {
            out |= flags::FRAGMENTED;
        }
        out
    }

    /// Decodes the cleartext prefix and returns it with its length.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let mut reader = Reader::new(bytes);
        let raw_flags = reader.read_u8()?;
        if raw_flags & !flags::KNOWN != 0 {
            return Err(WireError::UnknownFlags(raw_flags));
        }

        let project_id = if raw_flags & flags::MULTITENANT != 0 {
            Some(reader.read_compressed()?)
        } else {
            None
        };
        let node_id = reader.read_compressed()?;

        let sequence = if node_id == 0 {
            if raw_flags & (flags::ENCRYPTED | flags::FRAGMENTED) != 0 {
                return Err(WireError::InvalidHandshakeFlags(raw_flags));
            }
            None
        } else {
            Some(reader.read_u32_be()?)
        };

        Ok((
            Self {
                encrypted: raw_flags & flags::ENCRYPTED != 0,
                fragmented: raw_flags & flags::FRAGMENTED != 0,
                project_id,
                node_id,
                sequence,
            },
            reader.position(),
        ))
    }

    fn encode_into(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if self.is_handshake() && (self.encrypted || self.fragmented) {
            return Err(WireError::InvalidHandshakeFlags(self.flags()));
        }
        let mut pos = 0;
        out[pos] = self.flags();
        pos += 1;
        if let Some(project_id) = self.project_id {
            pos += codec::encode_into(project_id, &mut out[pos..])?;
        }
        pos += codec::encode_into(self.node_id, &mut out[pos..])?;
        if !self.is_handshake() {
            let sequence = self.sequence.unwrap_or_default();
            out[pos..pos + SEQUENCE_LEN].copy_from_slice(&sequence.to_be_bytes());
            pos += SEQUENCE_LEN;
        }
        Ok(pos)
    }
}

/// Position of one fragment within a larger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub index: u64,
    pub count: u64,
}

impl Fragment {
    pub fn validate(self) -> Result<Self, WireError> {
        if self.count < 2 || self.index >= self.count {
            return Err(WireError::InvalidFragment {
                index: self.index,
                count: self.count,
            });
        }
        Ok(self)
    }
}

/// Decoded (and decrypted) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body<'a> {
    pub message_type: MessageType,
    pub fragment: Option<Fragment>,
    pub payload: &'a [u8],
}

impl<'a> Body<'a> {
    /// `bytes` covers the body only, without the trailing tag.
    pub fn decode(bytes: &'a [u8], fragmented: bool) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let raw_type = reader.read_u8()?;
        let message_type =
            MessageType::try_from(raw_type).map_err(WireError::UnknownMessageType)?;
        let fragment = if fragmented {
            let index = reader.read_compressed()?;
            let count = reader.read_compressed()?;
            Some(Fragment { index, count }.validate()?)
        } else {
            None
        };
        Ok(Self {
            message_type,
            fragment,
            payload: reader.remaining(),
        })
    }
}

/// Encoded header ready to be prepended in front of a payload.
#[derive(Debug, Clone, Copy)]
pub struct HeaderBytes {
    buf: [u8; MAX_HEADER_LEN],
    len: usize,
    body_offset: usize,
}

impl HeaderBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the message-type byte, where encryption starts.
    pub fn body_offset(&self) -> usize {
        self.body_offset
    }
}

/// Encodes the envelope and body prefix for one packet.
pub fn encode_header(
    envelope: &Envelope,
    message_type: MessageType,
    fragment: Option<Fragment>,
) -> Result<HeaderBytes, WireError> {
    let mut envelope = *envelope;
    envelope.fragmented = fragment.is_some();

    let mut buf = [0u8; MAX_HEADER_LEN];
    let body_offset = envelope.encode_into(&mut buf)?;
    let mut pos = body_offset;
    buf[pos] = message_type.into();
    pos += 1;
    if let Some(fragment) = fragment {
        let fragment = fragment.validate()?;
        pos += codec::encode_into(fragment.index, &mut buf[pos..])?;
        pos += codec::encode_into(fragment.count, &mut buf[pos..])?;
    }
    Ok(HeaderBytes {
        buf,
        len: pos,
        body_offset,
    })
}

fn put_len_prefixed(what: &'static str, bytes: &[u8], out: &mut Vec<u8>) -> Result<(), WireError> {
    let len = u16::try_from(bytes.len()).map_err(|_| WireError::FieldTooLong {
        what,
        len: bytes.len(),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn finish(reader: &Reader<'_>) -> Result<(), WireError> {
    match reader.remaining().len() {
        0 => Ok(()),
        extra => Err(WireError::TrailingBytes(extra)),
    }
}

fn read_random(reader: &mut Reader<'_>) -> Result<[u8; RANDOM_LEN], WireError> {
    let mut random = [0u8; RANDOM_LEN];
    random.copy_from_slice(reader.read_bytes(RANDOM_LEN)?);
    Ok(random)
}

/// First handshake message, initiator to responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub connect_id: u16,
    pub random: [u8; RANDOM_LEN],
    pub quantum_public: &'a [u8],
    pub classic_public: &'a [u8],
}

impl<'a> ClientHello<'a> {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        out.extend_from_slice(&self.connect_id.to_be_bytes());
        out.extend_from_slice(&self.random);
        put_len_prefixed("quantum public key", self.quantum_public, out)?;
        put_len_prefixed("classic public key", self.classic_public, out)
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let connect_id = reader.read_u16_be()?;
        let random = read_random(&mut reader)?;
        let quantum_public = reader.read_len_prefixed()?;
        let classic_public = reader.read_len_prefixed()?;
        finish(&reader)?;
        Ok(Self {
            connect_id,
            random,
            quantum_public,
            classic_public,
        })
    }
}

/// Responder's reply carrying the encapsulated secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello<'a> {
    pub initiator_connect_id: u16,
    pub responder_connect_id: u16,
    pub random: [u8; RANDOM_LEN],
    pub encapsulated: &'a [u8],
    pub classic_public: &'a [u8],
}

impl<'a> ServerHello<'a> {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        out.extend_from_slice(&self.initiator_connect_id.to_be_bytes());
        out.extend_from_slice(&self.responder_connect_id.to_be_bytes());
        out.extend_from_slice(&self.random);
        put_len_prefixed("encapsulated message", self.encapsulated, out)?;
        put_len_prefixed("classic public key", self.classic_public, out)
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let initiator_connect_id = reader.read_u16_be()?;
        let responder_connect_id = reader.read_u16_be()?;
        let random = read_random(&mut reader)?;
        let encapsulated = reader.read_len_prefixed()?;
        let classic_public = reader.read_len_prefixed()?;
        finish(&reader)?;
        Ok(Self {
            initiator_connect_id,
            responder_connect_id,
            random,
            encapsulated,
            classic_public,
        })
    }
}

/// Proof of identity sent by each side once keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirm {
    /// Connect id the recipient assigned to this handshake.
    pub connect_id: u16,
    pub node_id: u64,
    pub proof: [u8; PROOF_LEN],
}

impl Confirm {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.connect_id.to_be_bytes());
        codec::encode(self.node_id, out);
        out.extend_from_slice(&self.proof);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(bytes);
        let connect_id = reader.read_u16_be()?;
        let node_id = reader.read_compressed()?;
        if node_id == 0 {
            return Err(WireError::ReservedNodeId);
        }
        let mut proof = [0u8; PROOF_LEN];
        proof.copy_from_slice(reader.read_bytes(PROOF_LEN)?);
        finish(&reader)?;
        Ok(Self {
            connect_id,
            node_id,
            proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assemble(envelope: &Envelope, ty: MessageType, fragment: Option<Fragment>, payload: &[u8]) -> Vec<u8> {
        let header = encode_header(envelope, ty, fragment).expect("header");
        let mut packet = header.as_slice().to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn handshake_envelope_is_minimal() {
        let packet = assemble(&Envelope::handshake(None), MessageType::ClientHello, None, b"hi");
        assert_eq!(packet, vec![0, 0, 0, b'h', b'i']);

        let (envelope, used) = Envelope::decode(&packet).expect("decode");
        assert!(envelope.is_handshake());
        assert_eq!(envelope.sequence, None);
        let body = Body::decode(&packet[used..], envelope.fragmented).expect("body");
        assert_eq!(body.message_type, MessageType::ClientHello);
        assert_eq!(body.payload, b"hi");
    }

    #[test]
    fn data_envelope_round_trip() {
        let envelope = Envelope::data(Some(70_000), 42, 0xDEAD_BEEF, true);
        let fragment = Some(Fragment { index: 2, count: 3 });
        let header = encode_header(&envelope, MessageType::Guard, fragment).expect("header");
        let mut packet = header.as_slice().to_vec();
        packet.extend_from_slice(b"payload");

        let (decoded, used) = Envelope::decode(&packet).expect("decode");
        assert_eq!(used, header.body_offset());
        assert_eq!(decoded.project_id, Some(70_000));
        assert_eq!(decoded.node_id, 42);
        assert_eq!(decoded.sequence, Some(0xDEAD_BEEF));
        assert!(decoded.encrypted);
        assert!(decoded.fragmented);
        assert_eq!(packet[0], flags::ENCRYPTED | flags::MULTITENANT | flags::FRAGMENTED);

        let body = Body::decode(&packet[used..], decoded.fragmented).expect("body");
        assert_eq!(body.message_type, MessageType::Guard);
        assert_eq!(body.fragment, fragment);
        assert_eq!(body.payload, b"payload");
    }

    #[test]
    fn fragment_fields_only_behind_flag_bit() {
        let envelope = Envelope::data(None, 5, 9, true);
        let whole = encode_header(&envelope, MessageType::Ping, None).expect("whole");
        assert_eq!(whole.as_slice(), &[flags::ENCRYPTED, 5, 0, 0, 0, 9, MessageType::Ping.into()]);

        let part = encode_header(&envelope, MessageType::Ping, Some(Fragment { index: 0, count: 2 }))
            .expect("part");
        assert_eq!(part.as_slice()[0], flags::ENCRYPTED | flags::FRAGMENTED);
        assert_eq!(&part.as_slice()[whole.len()..], &[0, 2]);

        // Reading a two-bit-layout packet as unfragmented leaves the count in the payload.
        let bytes = [MessageType::Ping.into(), 2, 0xAB];
        let body = Body::decode(&bytes, false).expect("body");
        assert_eq!(body.fragment, None);
        assert_eq!(body.payload, &[2, 0xAB]);
    }

    #[test]
    fn worst_case_header_fits_reservation() {
        let envelope = Envelope::data(Some(u64::MAX), u64::MAX, u32::MAX, true);
        let fragment = Some(Fragment {
            index: u64::MAX - 1,
            count: u64::MAX,
        });
        let header = encode_header(&envelope, MessageType::Transaction, fragment).expect("header");
        assert_eq!(header.len(), MAX_HEADER_LEN);
        assert!(MAX_HEADER_LEN + crate::crypto::mac::TAG_LEN <= crate::buffer::BASIC_HEADER_RESERVE);
    }

    #[test]
    fn rejects_bad_envelopes() {
        assert_eq!(Envelope::decode(&[0b1000, 0]), Err(WireError::UnknownFlags(0b1000)));
        assert_eq!(
            Envelope::decode(&[flags::ENCRYPTED, 0]),
            Err(WireError::InvalidHandshakeFlags(flags::ENCRYPTED))
        );
        assert!(matches!(
            Envelope::decode(&[0, 7, 0, 0]),
            Err(WireError::Codec(CodecError::Truncated { .. }))
        ));
        assert!(matches!(Envelope::decode(&[]), Err(WireError::Codec(_))));
        assert_eq!(Body::decode(&[9], false), Err(WireError::UnknownMessageType(9)));
        assert_eq!(
            Body::decode(&[2, 3, 3], true),
            Err(WireError::InvalidFragment { index: 3, count: 3 })
        );
        assert_eq!(
            Body::decode(&[2, 0, 1], true),
            Err(WireError::InvalidFragment { index: 0, count: 1 })
        );
    }

    #[test]
    fn encrypted_handshake_cannot_be_encoded() {
        let mut envelope = Envelope::handshake(None);
        envelope.encrypted = true;
        assert!(encode_header(&envelope, MessageType::ClientHello, None).is_err());
    }

    #[test]
    fn hello_codecs_round_trip() {
        let quantum = vec![3u8; 1184];
        let classic = [4u8; 32];
        let hello = ClientHello {
            connect_id: 17,
            random: [9; RANDOM_LEN],
            quantum_public: &quantum,
            classic_public: &classic,
        };
        let mut out = Vec::new();
        hello.encode(&mut out).expect("encode");
        assert_eq!(ClientHello::decode(&out).expect("decode"), hello);

        let ciphertext = vec![5u8; 1088];
        let reply = ServerHello {
            initiator_connect_id: 17,
            responder_connect_id: 499,
            random: [8; RANDOM_LEN],
            encapsulated: &ciphertext,
            classic_public: &classic,
        };
        out.clear();
        reply.encode(&mut out).expect("encode");
        assert_eq!(ServerHello::decode(&out).expect("decode"), reply);

        out.push(0);
        assert_eq!(ServerHello::decode(&out), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn confirm_round_trip() {
        let confirm = Confirm {
            connect_id: 3,
            node_id: 1_000_000,
            proof: [0x5A; PROOF_LEN],
        };
        let mut out = Vec::new();
        confirm.encode(&mut out);
        assert_eq!(Confirm::decode(&out).expect("decode"), confirm);
        assert!(Confirm::decode(&out[..out.len() - 1]).is_err());

        let mut zero = Vec::new();
        Confirm { node_id: 0, ..confirm }.encode(&mut zero);
        assert_eq!(Confirm::decode(&zero), Err(WireError::ReservedNodeId));
    }

    #[test]
    fn oversized_field_rejected() {
        let big = vec![0u8; 70_000];
        let hello = ClientHello {
            connect_id: 0,
            random: [0; RANDOM_LEN],
            quantum_public: &big,
            classic_public: &[],
        };
        assert!(matches!(
            hello.encode(&mut Vec::new()),
            Err(WireError::FieldTooLong { len: 70_000, .. })
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_input_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            if let Ok((envelope, used)) = Envelope::decode(&bytes) {
                prop_assert!(used <= bytes.len());
                let _ = Body::decode(&bytes[used..], envelope.fragmented);
            }
            let _ = ClientHello::decode(&bytes);
            let _ = ServerHello::decode(&bytes);
            let _ = Confirm::decode(&bytes);
        }
    }
}
