//! Bloom filter used as a pre-filter in front of the cache tag table.
//!
//! The filter never reports a false negative for an item that was added, so a
//! negative answer lets a lookup skip the binary search of a whole layer.

use std::io::{self, Write};

use crc::{CRC_32_ISO_HDLC, Crc};

use crate::error::{ChunkedError, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Fixed-size bit array with `k` hash functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hashes: u32,
}

impl BloomFilter {
    /// Create a filter with room for at least `size` bits.
    pub fn new(size: usize, hashes: u32) -> Self {
        let words = size.div_ceil(64).max(1);
        Self {
            bits: vec![0; words],
            hashes,
        }
    }

    fn bit_count(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    fn hash(&self, item: &[u8], seed: u32) -> (usize, u64) {
        if item.is_empty() {
            return (0, 0);
        }
        let split = seed as usize % item.len();
        let (a, b) = item.split_at(split);
        let h = (CRC32.checksum(a) ^ CRC32.checksum(b)) as u64 % self.bit_count();
        ((h / 64) as usize, 1 << (h % 64))
    }

    /// Add an item.
    pub fn add(&mut self, item: &[u8]) {
        for seed in 0..self.hashes {
            let (word, mask) = self.hash(item, seed);
            self.bits[word] |= mask;
        }
    }

    /// False only if `item` was certainly never added.
    pub fn maybe_contains(&self, item: &[u8]) -> bool {
        (0..self.hashes).all(|seed| {
            let (word, mask) = self.hash(item, seed);
            self.bits[word] & mask != 0
        })
    }

    /// Serialize as `u64 words, u32 k, u64[words]`, little-endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.bits.len() as u64).to_le_bytes())?;
        w.write_all(&self.hashes.to_le_bytes())?;
        for word in &self.bits {
            w.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn serialized_len(&self) -> usize {
        8 + 4 + self.bits.len() * 8
    }

    /// Parse a filter from the start of `buf`, returning it and the bytes consumed.
    pub fn read_from(buf: &[u8]) -> Result<(Self, usize)> {
        let short = || ChunkedError::CorruptIndex("bloom filter truncated".to_string());
        let words = buf
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(short)?;
        let hashes = buf
            .get(8..12)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(short)?;
        let words = usize::try_from(words).map_err(|_| short())?;
        if words == 0 {
            return Err(ChunkedError::CorruptIndex("empty bloom filter".to_string()));
        }
        let end = words
            .checked_mul(8)
            .and_then(|n| n.checked_add(12))
            .ok_or_else(short)?;
        let data = buf.get(12..end).ok_or_else(short)?;
        let bits = data
            .chunks_exact(8)
            .map(|c| {
                let mut w = [0u8; 8];
                w.copy_from_slice(c);
                u64::from_le_bytes(w)
            })
            .collect();
        Ok((Self { bits, hashes }, end))
    }
}
