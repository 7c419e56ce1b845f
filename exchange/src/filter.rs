//! Probabilistic permission filter.
//!
//! A bloom filter over the patients who have ever granted this node consent.
//! `contains` may return true for a non-member (bounded by the configured
//! capacity and error rate) but never false for a member. The filter cannot
//! delete, so revocation is handled upstream by rebuilding from the exact
//! consent list.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Serializable filter state: sizing metadata, hash seed, and the bit array.
/// This is the snapshot persisted for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionFilter {
    capacity: usize,
    error_rate: f64,
    num_bits: u64,
    num_hashes: u32,
    seed: u64,
    bits: Vec<u8>,
}

impl PermissionFilter {
    /// Size the filter for `capacity` members at `error_rate` false positives,
    /// using the standard optimum: `m = -n·ln(p) / ln(2)²`, `k = (m/n)·ln(2)`.
    pub fn new(capacity: usize, error_rate: f64, seed: u64) -> Self {
        let capacity = capacity.max(1);
        let error_rate = error_rate.clamp(1e-9, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-(capacity as f64) * error_rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(8);
        let num_hashes = (((num_bits as f64 / capacity as f64) * ln2).round() as u32).max(1);

        Self {
            capacity,
            error_rate,
            num_bits,
            num_hashes,
            seed,
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
        }
    }

    pub fn insert(&mut self, item: &str) {
        let (h1, h2) = self.hash_pair(item);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Membership hint: a positive result means "maybe, verify downstream".
    pub fn contains(&self, item: &str) -> bool {
        let (h1, h2) = self.hash_pair(item);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Double hashing: two 64-bit halves of a seeded SHA-256, combined as
    /// `h1 + i·h2 mod m` for the i-th probe.
    fn hash_pair(&self, item: &str) -> (u64, u64) {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(item.as_bytes());
        let digest = hasher.finalize();

        let h1 = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("8 bytes"));
        (h1, h2)
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }
}
