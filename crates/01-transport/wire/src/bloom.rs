//! Broadcast match filter.
//!
//! Parameters: m = 512 bits ([`BLOOM_SIZE`] bytes), k = 8. Each entry is the
//! string `"key:value"`, hashed once with SipHash-2-4 under [`HASH_KEY`]
//! (16 bytes, read little-endian as the two 64-bit key halves). The low 32
//! bits of the hash are `h1`, the high 32 bits with the lowest bit forced on
//! are `h2`, and bit `i` of the entry is `(h1 + i * h2) mod 512` in wrapping
//! 32-bit arithmetic.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::abi::BLOOM_SIZE;

const WORDS: usize = BLOOM_SIZE / 8;
const BITS: u32 = (BLOOM_SIZE * 8) as u32;
const HASH_FUNCTIONS: u32 = 8;

pub const HASH_KEY: [u8; 16] = [
    0xb9, 0x66, 0x0b, 0xf0, 0x46, 0x70, 0x47, 0xc1, 0x88, 0x72, 0xa4, 0xef, 0x79, 0xf7, 0xab, 0x41,
];

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BloomFilter {
    words: [u64; WORDS],
}

impl BloomFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a filter as stored in a bloom item.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BLOOM_SIZE {
            return None;
        }
        let mut words = [0u64; WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        Some(Self { words })
    }

    /// Writes the filter into a [`BLOOM_SIZE`] byte region.
    pub fn write_to(&self, out: &mut [u8]) {
        assert_eq!(out.len(), BLOOM_SIZE, "bloom region has the wrong size");
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.words.iter()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn add_data(&mut self, data: &[u8]) {
        for bit in bit_positions(data) {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn contains_data(&self, data: &[u8]) -> bool {
        bit_positions(data).all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    pub fn add_pair(&mut self, key: &str, value: &str) {
        self.add_data(pair(key, value).as_bytes());
    }

    pub fn contains_pair(&self, key: &str, value: &str) -> bool {
        self.contains_data(pair(key, value).as_bytes())
    }

    /// Adds `key` paired with every proper prefix of `value` that ends right
    /// before a `sep`. A leading `/` yields the root prefix `"/"`.
    pub fn add_prefixes(&mut self, key: &str, value: &str, sep: char) {
        for prefix in prefixes(value, sep) {
            self.add_pair(key, prefix);
        }
    }

    /// Membership test between two filters: every bit of `self` is in `other`.
    pub fn is_subset_of(&self, other: &BloomFilter) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(mine, theirs)| mine & theirs == *mine)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BloomFilter(")?;
        for word in &self.words {
            write!(f, "{word:016x}")?;
        }
        write!(f, ")")
    }
}

/// Proper prefixes of `value` split on `sep`, longest first.
pub fn prefixes(value: &str, sep: char) -> impl Iterator<Item = &str> {
    let mut rest = Some(value);
    std::iter::from_fn(move || loop {
        let current = rest?;
        let Some(cut) = current.rfind(sep) else {
            rest = None;
            return None;
        };
        if cut == 0 {
            rest = None;
            if sep == '/' && current.len() > 1 {
                return Some(&current[..1]);
            }
            return None;
        }
        rest = Some(&current[..cut]);
        return rest;
    })
}

fn pair(key: &str, value: &str) -> String {
    let mut entry = String::with_capacity(key.len() + 1 + value.len());
    entry.push_str(key);
    entry.push(':');
    entry.push_str(value);
    entry
}

fn bit_positions(data: &[u8]) -> impl Iterator<Item = u32> {
    let mut hasher = SipHasher24::new_with_key(&HASH_KEY);
    hasher.write(data);
    let hash = hasher.finish();
    let h1 = hash as u32;
    let h2 = (hash >> 32) as u32 | 1;
    (0..HASH_FUNCTIONS).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % BITS)
}
