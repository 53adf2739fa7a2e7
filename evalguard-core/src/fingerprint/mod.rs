//! # Fingerprint library
//!
//! Pure functions producing stable content hashes and similarity signatures:
//!
//! - [`identity`]: content hash of an [`Example`] (inputs + metadata).
//! - [`cache_key`]: hash of (identity, backend, prompt version, decode params).
//! - [`run_id`]: hash of (run spec, dataset version, code version).
//! - [`minhash`]: shingled MinHash signatures for near-duplicate text.
//! - [`phash`]: DCT perceptual hash of decoded grayscale images.
//!
//! Every hash is SHA-256 over a canonical byte encoding, so results are
//! identical across machines and process restarts.

pub mod minhash;
pub mod phash;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use unicode_normalization::UnicodeNormalization;

use crate::error::FingerprintError;
use crate::types::{DatasetVersion, Example, Payload};

pub use minhash::{MinHashSignature, minhash_signature};
pub use phash::{GrayImage, PerceptualHash, perceptual_hash};

/// Version of the hashing scheme. Baked into every cache key and run id, and
/// recorded in run manifests and disk cache entries.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Decoding parameters (temperature, max tokens, ...). Ordered by name so the
/// key never depends on insertion order.
pub type DecodeParams = BTreeMap<String, serde_json::Value>;

/// Content hash of an example.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExampleIdentity(String);

impl ExampleIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExampleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the content-addressed cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild a key from its hex form (disk tier file names).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// First eight bytes of the SHA-256 digest as an integer.
pub(crate) fn sha256_u64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(buf)
}

/// Trim and lower-case text. Used for identity hashing only; stored examples
/// keep their original text.
pub fn canonical_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Aggressive normalization for overlap detection: NFKC, lower-case,
/// punctuation stripped, whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    let stripped: String = folded
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Stable content hash of an example.
///
/// Covers every input (text canonicalized, media hashed by content bytes) and
/// the metadata mapping. The example id and ground truth are excluded: two
/// examples with the same content share an identity.
pub fn identity(example: &Example) -> Result<ExampleIdentity, FingerprintError> {
    let mut hasher = Sha256::new();
    hasher.update(b"evalguard.identity.v");
    hasher.update(FINGERPRINT_VERSION.to_le_bytes());

    for (name, payload) in &example.inputs {
        hasher.update(b"\x00in\x00");
        hasher.update(name.as_bytes());
        hasher.update(b"\x00");
        match payload {
            Payload::Text { text } => {
                hasher.update(b"text\x00");
                hasher.update(canonical_text(text).as_bytes());
            }
            Payload::Image { media } => {
                hasher.update(b"image\x00");
                hasher.update(sha256_hex(&media.bytes()?).as_bytes());
            }
            Payload::Video { media } => {
                hasher.update(b"video\x00");
                hasher.update(sha256_hex(&media.bytes()?).as_bytes());
            }
        }
    }

    for (feature, value) in &example.metadata {
        hasher.update(b"\x00meta\x00");
        hasher.update(feature.as_bytes());
        hasher.update(b"\x00");
        hasher.update(value.as_bytes());
    }

    Ok(ExampleIdentity(format!("{:x}", hasher.finalize())))
}

/// Deterministic cache key for one backend call.
///
/// Any change to the backend identity, prompt version or decoding parameters
/// yields a different key.
pub fn cache_key(
    example: &ExampleIdentity,
    backend_identity: &str,
    prompt_version: &str,
    decode_params: &DecodeParams,
) -> CacheKey {
    let params = serde_json::Value::Object(
        decode_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let payload = serde_json::json!({
        "fingerprint_version": FINGERPRINT_VERSION,
        "example": example.as_str(),
        "backend": backend_identity,
        "prompt_version": prompt_version,
        "decode_params": params,
    });
    CacheKey(sha256_hex(canonical_json(&payload).as_bytes()))
}

/// Deterministic run id from the identity-bearing run configuration, the
/// dataset version and the code version. 16 hex characters.
pub fn run_id(
    spec: &serde_json::Value,
    dataset: &DatasetVersion,
    code_version: &str,
) -> String {
    let payload = serde_json::json!({
        "fingerprint_version": FINGERPRINT_VERSION,
        "config": spec,
        "dataset": {
            "name": dataset.name,
            "version": dataset.version,
            "split": dataset.split,
            "content_hash": dataset.content_hash,
        },
        "code_version": code_version,
    });
    let mut id = sha256_hex(canonical_json(&payload).as_bytes());
    id.truncate(16);
    id
}

/// Version identifier of the code producing a run.
///
/// `EVALGUARD_CODE_VERSION` (typically a git sha injected by CI) takes
/// precedence over the crate version.
pub fn code_version() -> String {
    std::env::var("EVALGUARD_CODE_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| format!("evalguard-core@{}", env!("CARGO_PKG_VERSION")))
}

/// Stable shard assignment for an example id.
///
/// Depends only on the id, so membership survives upstream filtering that
/// changes the total example count.
pub fn shard_of(example_id: &str, num_shards: u32) -> u32 {
    if num_shards <= 1 {
        return 0;
    }
    (sha256_u64(example_id.as_bytes()) % u64::from(num_shards)) as u32
}
