//! Banded locality-sensitive hashing over MinHash signatures.

use std::collections::{BTreeSet, HashMap};

use crate::fingerprint::{MinHashSignature, sha256_u64};

/// `bands` tables, each keyed by the hash of `rows` consecutive signature
/// values. Two signatures are candidates if any band collides.
#[derive(Debug, Clone)]
pub struct LshIndex {
    bands: usize,
    rows: usize,
    tables: Vec<HashMap<u64, Vec<usize>>>,
}

impl LshIndex {
    pub fn new(bands: usize, rows: usize) -> Self {
        let bands = bands.max(1);
        Self {
            bands,
            rows: rows.max(1),
            tables: vec![HashMap::new(); bands],
        }
    }

    pub fn insert(&mut self, item: usize, signature: &MinHashSignature) {
        for (band, key) in self.band_keys(signature) {
            self.tables[band].entry(key).or_default().push(item);
        }
    }

    /// Items sharing at least one band with `signature`, ascending.
    pub fn candidates(&self, signature: &MinHashSignature) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for (band, key) in self.band_keys(signature) {
            if let Some(items) = self.tables[band].get(&key) {
                out.extend(items.iter().copied());
            }
        }
        out
    }

    /// Bands past the end of a short signature are skipped.
    fn band_keys<'a>(
        &self,
        signature: &'a MinHashSignature,
    ) -> impl Iterator<Item = (usize, u64)> + 'a {
        let rows = self.rows;
        signature
            .values()
            .chunks_exact(rows)
            .take(self.bands)
            .enumerate()
            .map(move |(band, chunk)| {
                let mut bytes = Vec::with_capacity(8 * (rows + 1));
                bytes.extend_from_slice(&(band as u64).to_le_bytes());
                for v in chunk {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                (band, sha256_u64(&bytes))
            })
    }
}
