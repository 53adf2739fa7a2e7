//! Shingled MinHash signatures.
//!
//! Text is normalized with [`super::normalize_text`] and split into character
//! k-shingles. Each shingle is hashed once (SHA-256, truncated to 64 bits) and
//! then pushed through `num_permutations` universal hash functions
//! `(a * x + b) mod (2^61 - 1)` whose coefficients derive from the permutation
//! index, so signatures are reproducible everywhere.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{normalize_text, sha256_u64};
use crate::error::FingerprintError;

const MERSENNE_61: u64 = (1 << 61) - 1;

/// Fixed-length MinHash signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinHashSignature {
    values: Vec<u64>,
}

impl MinHashSignature {
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Estimated Jaccard similarity: the fraction of agreeing positions.
    ///
    /// Signatures of different lengths are incomparable and score 0.
    pub fn jaccard(&self, other: &MinHashSignature) -> f64 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return 0.0;
        }
        let agree = self
            .values
            .iter()
            .zip(&other.values)
            .filter(|(a, b)| a == b)
            .count();
        agree as f64 / self.values.len() as f64
    }
}

/// Character k-shingles of normalized text.
///
/// Text shorter than `k` yields a single shingle holding the whole text.
pub fn shingles(text: &str, k: usize) -> HashSet<String> {
    let normalized = normalize_text(text);
    let chars: Vec<char> = normalized.chars().collect();
    let k = k.max(1);
    let mut out = HashSet::new();
    if chars.is_empty() {
        return out;
    }
    if chars.len() <= k {
        out.insert(normalized);
        return out;
    }
    for window in chars.windows(k) {
        out.insert(window.iter().collect());
    }
    out
}

/// Compute the MinHash signature of `text`.
pub fn minhash_signature(
    text: &str,
    num_permutations: usize,
    shingle_size: usize,
) -> Result<MinHashSignature, FingerprintError> {
    let base: Vec<u64> = shingles(text, shingle_size)
        .iter()
        .map(|s| sha256_u64(s.as_bytes()) % MERSENNE_61)
        .collect();
    if base.is_empty() {
        return Err(FingerprintError::EmptyText);
    }

    let values = (0..num_permutations as u64)
        .map(|i| {
            let (a, b) = permutation(i);
            base.iter()
                .map(|&x| universal_hash(a, b, x))
                .min()
                .unwrap_or(u64::MAX)
        })
        .collect();

    Ok(MinHashSignature { values })
}

/// Coefficients of the i-th permutation; `a` is never zero.
fn permutation(index: u64) -> (u64, u64) {
    let a = splitmix64(index.wrapping_mul(2).wrapping_add(1)) % (MERSENNE_61 - 1) + 1;
    let b = splitmix64(index.wrapping_mul(2).wrapping_add(2)) % MERSENNE_61;
    (a, b)
}

fn universal_hash(a: u64, b: u64, x: u64) -> u64 {
    ((u128::from(a) * u128::from(x) + u128::from(b)) % u128::from(MERSENNE_61)) as u64
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
