// Compressed integer codec used by every variable-length envelope field.
// Values up to 250 occupy a single byte; larger values carry a tag byte
// followed by 2, 3, 4 or 8 little-endian bytes.

use thiserror::Error;

/// Largest value encoded as a literal byte.
pub const MAX_LITERAL: u64 = 250;

const TAG_U16: u8 = 251;
const TAG_U24: u8 = 252;
const TAG_U32: u8 = 253;
const TAG_U64: u8 = 254;

/// Worst-case encoded length of a compressed integer.
pub const MAX_ENCODED_LEN: usize = 9;

/// Errors surfaced while decoding compressed integers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the tag or its follow bytes.
    #[error("compressed integer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    /// Tag byte 255 is not assigned.
    #[error("invalid compressed integer tag {0}")]
    InvalidTag(u8),
    /// Output buffer too small for the encoded value.
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Returns the number of bytes `value` occupies on the wire.
#[must_use]
pub const fn encoded_len(value: u64) -> usize {
    if value <= MAX_LITERAL {
        1
    } else if value <= 0xFFFF {
        3
    } else if value <= 0xFF_FFFF {
        4
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Writes `value` into the front of `out`, returning the number of bytes written.
pub fn encode_into(value: u64, out: &mut [u8]) -> Result<usize, CodecError> {
    let needed = encoded_len(value);
    if out.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let le = value.to_le_bytes();
    match needed {
        1 => out[0] = value as u8,
        3 => {
            out[0] = TAG_U16;
            out[1..3].copy_from_slice(&le[..2]);
        }
        4 => {
            out[0] = TAG_U24;
            out[1..4].copy_from_slice(&le[..3]);
        }
        5 => {
            out[0] = TAG_U32;
            out[1..5].copy_from_slice(&le[..4]);
        }
        _ => {
            out[0] = TAG_U64;
            out[1..9].copy_from_slice(&le);
        }
    }
    Ok(needed)
}

/// Appends the encoding of `value` to `out`.
pub fn encode(value: u64, out: &mut Vec<u8>) {
    let mut scratch = [0u8; MAX_ENCODED_LEN];
    // scratch is always large enough for the worst case
    let len = encode_into(value, &mut scratch).unwrap_or(0);
    out.extend_from_slice(&scratch[..len]);
}

/// Decodes one compressed integer from the front of `input`.
///
/// Returns the value and the number of bytes consumed. Never reads past the
/// bytes the tag announces, so truncated input fails instead of over-reading.
pub fn decode(input: &[u8]) -> Result<(u64, usize), CodecError> {
    let tag = *input.first().ok_or(CodecError::Truncated {
        needed: 1,
        available: 0,
    })?;

    let follow = match tag {
        0..=250 => return Ok((u64::from(tag), 1)),
        TAG_U16 => 2,
        TAG_U24 => 3,
        TAG_U32 => 4,
        TAG_U64 => 8,
        other => return Err(CodecError::InvalidTag(other)),
    };

    let needed = 1 + follow;
    if input.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: input.len(),
        });
    }

    let mut le = [0u8; 8];
    le[..follow].copy_from_slice(&input[1..needed]);
    Ok((u64::from_le_bytes(le), needed))
}

/// Cursor-style reader over a byte slice that decodes compressed integers and
/// fixed-width fields in sequence.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }

    pub fn read_compressed(&mut self) -> Result<u64, CodecError> {
        let (value, used) = decode(self.remaining())?;
        self.offset += used;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, CodecError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let available = self.buf.len() - self.offset;
        if available < len {
            return Err(CodecError::Truncated {
                needed: len,
                available,
            });
        }
        let out = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Reads a big-endian `u16` length prefix followed by that many bytes.
    pub fn read_len_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u16_be()? as usize;
        self.read_bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn uses_minimal_tag() {
        let mut out = Vec::new();
        encode(250, &mut out);
        assert_eq!(out, vec![250]);

        out.clear();
        encode(251, &mut out);
        assert_eq!(out, vec![TAG_U16, 251, 0]);

        out.clear();
        encode(0x1_0000, &mut out);
        assert_eq!(out.len(), 4);

        out.clear();
        encode(u64::MAX, &mut out);
        assert_eq!(out.len(), 9);
    }

    #[test]
    fn truncated_input_fails() {
        assert_eq!(
            decode(&[TAG_U32, 1, 2]),
            Err(CodecError::Truncated {
                needed: 5,
                available: 3
            })
        );
        assert!(matches!(decode(&[]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn rejects_unassigned_tag() {
        assert_eq!(decode(&[255, 0, 0]), Err(CodecError::InvalidTag(255)));
    }

    #[test]
    fn reader_walks_mixed_fields() {
        let mut buf = Vec::new();
        encode(70_000, &mut buf);
        buf.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(b"abc");

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_compressed().unwrap(), 70_000);
        assert_eq!(reader.read_u32_be().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_len_prefixed().unwrap(), b"abc");
        assert!(reader.remaining().is_empty());
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(value in any::<u64>()) {
            let mut out = Vec::new();
            encode(value, &mut out);
            prop_assert_eq!(out.len(), encoded_len(value));
            let (decoded, used) = decode(&out).expect("decode");
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(used, out.len());
        }

        #[test]
        fn decode_never_over_reads(bytes in prop::collection::vec(any::<u8>(), 0..12)) {
            if let Ok((_, used)) = decode(&bytes) {
                prop_assert!(used <= bytes.len());
            }
        }
    }
}
