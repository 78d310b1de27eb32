// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bloom filter for cell stores (spec §4.4).
//!
//! Grounded on the teacher's `bloom/` module shape (bit array + hash count),
//! reimplemented with a double-hashing scheme (Kirsch-Mitzenmacher) over
//! xxh3 instead of the teacher's bundled hasher, since this crate does not
//! carry the teacher's `bloom` feature.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// What a filter key is derived from (spec §4.4: "built over (row) or
/// (row+cf) or (row+cf+cq) according to config").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BloomFilterMode {
    Disabled,
    Row,
    RowColumnFamily,
    RowColumnFamilyQualifier,
}

impl Encode for BloomFilterMode {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let tag: u8 = match self {
            Self::Disabled => 0,
            Self::Row => 1,
            Self::RowColumnFamily => 2,
            Self::RowColumnFamilyQualifier => 3,
        };
        writer.write_u8(tag)?;
        Ok(())
    }
}

impl Decode for BloomFilterMode {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        match reader.read_u8()? {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Row),
            2 => Ok(Self::RowColumnFamily),
            3 => Ok(Self::RowColumnFamilyQualifier),
            tag => Err(DecodeError::InvalidTag(("BloomFilterMode", tag))),
        }
    }
}

fn optimal_hash_count(bits_per_item: f64) -> u8 {
    ((bits_per_item * std::f64::consts::LN_2).round() as u8).clamp(1, 24)
}

/// A Bloom filter builder, accumulating keys as a cell store's blocks are
/// written, then finalized once the total item count is known.
pub struct BloomFilterBuilder {
    bits_per_key: f64,
    keys: Vec<u64>,
}

impl BloomFilterBuilder {
    #[must_use]
    pub fn new(bits_per_key: f64) -> Self {
        Self {
            bits_per_key,
            keys: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        self.keys.push(xxhash_rust::xxh3::xxh3_64(key));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn build(self) -> BloomFilter {
        if self.keys.is_empty() {
            return BloomFilter {
                bits: vec![0; 8],
                hash_count: 1,
                item_count: 0,
            };
        }

        let bit_count = ((self.keys.len() as f64) * self.bits_per_key)
            .max(64.0)
            .ceil() as usize;
        let byte_count = bit_count.div_ceil(8);
        let hash_count = optimal_hash_count(self.bits_per_key);

        let mut bits = vec![0u8; byte_count];
        let total_bits = byte_count * 8;

        for key in &self.keys {
            let h1 = *key;
            let h2 = key.rotate_left(32) | 1; // ensure odd step for full coverage
            for i in 0..hash_count {
                let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
                let bit = (combined as usize) % total_bits;
                bits[bit / 8] |= 1 << (bit % 8);
            }
        }

        BloomFilter {
            bits,
            hash_count,
            item_count: self.keys.len() as u32,
        }
    }
}

/// An immutable, queryable Bloom filter.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_count: u8,
    item_count: u32,
}

impl BloomFilter {
    /// Returns `false` if `key` is definitely absent; `true` means
    /// "maybe present" (spec: "short-circuits per-row queries when the
    /// filter says 'definitely not present'").
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return true;
        }
        let total_bits = self.bits.len() * 8;
        let h1 = xxhash_rust::xxh3::xxh3_64(key);
        let h2 = h1.rotate_left(32) | 1;
        for i in 0..self.hash_count {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            let bit = (combined as usize) % total_bits;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    #[must_use]
    pub fn hash_count(&self) -> u8 {
        self.hash_count
    }

    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<byteorder::BigEndian>(self.bits.len() as u32)?;
        writer.write_u8(self.hash_count)?;
        writer.write_u32::<byteorder::BigEndian>(self.item_count)?;
        writer.write_all(&self.bits)?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let byte_len = reader.read_u32::<byteorder::BigEndian>()? as usize;
        let hash_count = reader.read_u8()?;
        let item_count = reader.read_u32::<byteorder::BigEndian>()?;
        let mut bits = vec![0u8; byte_len];
        reader.read_exact(&mut bits)?;
        Ok(Self {
            bits,
            hash_count,
            item_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn no_false_negatives() {
        let mut builder = BloomFilterBuilder::new(10.0);
        for i in 0..1000 {
            builder.add(format!("row-{i}").as_bytes());
        }
        let filter = builder.build();
        for i in 0..1000 {
            assert!(filter.may_contain(format!("row-{i}").as_bytes()));
        }
    }

    #[test]
    fn reasonable_false_positive_rate() {
        let mut builder = BloomFilterBuilder::new(10.0);
        for i in 0..1000 {
            builder.add(format!("row-{i}").as_bytes());
        }
        let filter = builder.build();

        let false_positives = (0..1000)
            .filter(|i| filter.may_contain(format!("absent-{i}").as_bytes()))
            .count();
        // At 10 bits/key the expected FPR is well under 1%.
        assert!(false_positives < 50, "false positives: {false_positives}");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut builder = BloomFilterBuilder::new(8.0);
        builder.add(b"a");
        builder.add(b"b");
        let filter = builder.build();

        let bytes = filter.encode_into_vec();
        let decoded = BloomFilter::decode_from(&mut &bytes[..]).unwrap();
        assert!(decoded.may_contain(b"a"));
        assert!(decoded.may_contain(b"b"));
        assert_eq!(decoded.item_count(), 2);
    }

    #[test]
    fn empty_filter_contains_everything() {
        let filter = BloomFilterBuilder::new(10.0).build();
        assert!(filter.may_contain(b"anything"));
    }
}
