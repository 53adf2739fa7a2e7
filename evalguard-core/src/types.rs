//! Fundamental types shared by the engine, the comparator, slice discovery
//! and the contamination scanner.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::FingerprintError;

/// Where the bytes of an image or video payload live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MediaSource {
    /// A file on local disk. Only the content is fingerprinted, never the path.
    Path { path: PathBuf },
    /// Base64-encoded bytes embedded in the record.
    Inline { data: String },
}

impl MediaSource {
    pub fn inline(bytes: &[u8]) -> Self {
        Self::Inline {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Resolve the payload bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, FingerprintError> {
        match self {
            Self::Path { path } => std::fs::read(path).map_err(|e| FingerprintError::Media {
                path: path.clone(),
                reason: e.to_string(),
            }),
            Self::Inline { data } => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| FingerprintError::Decode {
                    reason: format!("invalid base64: {e}"),
                }),
        }
    }
}

/// A single named input of an example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text {
        text: String,
    },
    Image { media: MediaSource },
    Video { media: MediaSource },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One evaluation example, produced by a benchmark adapter.
///
/// Read-only to the core. `inputs` and `metadata` are ordered by key so that
/// serialization (and therefore fingerprinting) never depends on the order the
/// source happened to list them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Payload>,
    /// Benchmark-defined answer key; `null` when withheld.
    #[serde(default)]
    pub ground_truth: serde_json::Value,
    /// Slice-feature name to categorical value.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Example {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inputs: BTreeMap::new(),
            ground_truth: serde_json::Value::Null,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, payload: Payload) -> Self {
        self.inputs.insert(name.into(), payload);
        self
    }

    pub fn with_ground_truth(mut self, ground_truth: impl Into<serde_json::Value>) -> Self {
        self.ground_truth = ground_truth.into();
        self
    }

    pub fn with_metadata(mut self, feature: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(feature.into(), value.into());
        self
    }

    pub fn has_ground_truth(&self) -> bool {
        !self.ground_truth.is_null()
    }

    /// Slice assignments copied from metadata, in feature order.
    pub fn slice_assignments(&self) -> Vec<SliceAssignment> {
        self.metadata
            .iter()
            .map(|(feature, value)| SliceAssignment::new(feature, value))
            .collect()
    }
}

/// A (feature, value) pair placing a prediction in a slice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceAssignment {
    pub feature: String,
    pub value: String,
}

impl SliceAssignment {
    pub fn new(feature: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for SliceAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.feature, self.value)
    }
}

/// Raw output of one backend call. This is what the content cache stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_answer: Option<String>,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u32>,
}

impl Generation {
    pub fn text(raw_output: impl Into<String>) -> Self {
        let raw_output = raw_output.into();
        let extracted_answer = Some(raw_output.trim().to_string());
        Self {
            raw_output,
            extracted_answer,
            latency_ms: 0.0,
            tokens_in: None,
            tokens_out: None,
        }
    }
}

/// Result of scoring a generation against an example's ground truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// `None` when ground truth is withheld.
    pub correct: Option<bool>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// One line of the predictions log.
///
/// Created exactly once per (example, run) pair and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub example_id: String,
    pub raw_output: String,
    #[serde(default)]
    pub extracted_answer: Option<String>,
    #[serde(default)]
    pub correct: Option<bool>,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u32>,
    #[serde(default)]
    pub slices: Vec<SliceAssignment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    /// Set on placeholder records for examples that could not be generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub shard: u32,
    /// Whether the generation came out of the cache.
    #[serde(default)]
    pub cached: bool,
}

impl Prediction {
    /// Build a scored prediction from a generation.
    pub fn scored(
        example: &Example,
        generation: Generation,
        score: Score,
        shard: u32,
        cached: bool,
    ) -> Self {
        Self {
            example_id: example.id.clone(),
            raw_output: generation.raw_output,
            extracted_answer: generation.extracted_answer,
            correct: score.correct,
            latency_ms: generation.latency_ms,
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
            slices: example.slice_assignments(),
            metrics: score.metrics,
            error: None,
            shard,
            cached,
        }
    }

    /// Build the placeholder for an example whose generation failed.
    ///
    /// Counts as incorrect when the example has ground truth, unscored otherwise.
    pub fn failed(example: &Example, error: impl Into<String>, shard: u32) -> Self {
        Self {
            example_id: example.id.clone(),
            raw_output: String::new(),
            extracted_answer: None,
            correct: example.has_ground_truth().then_some(false),
            latency_ms: 0.0,
            tokens_in: None,
            tokens_out: None,
            slices: example.slice_assignments(),
            metrics: BTreeMap::new(),
            error: Some(error.into()),
            shard,
            cached: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_slice(&self, assignment: &SliceAssignment) -> bool {
        self.slices.iter().any(|s| s == assignment)
    }
}

/// Identifies exactly which data a run was evaluated on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub name: String,
    pub version: String,
    pub split: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_examples: Option<u64>,
    /// Hash of the dataset content as reported by the adapter.
    pub content_hash: String,
}

impl std::fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.content_hash.get(..8).unwrap_or(&self.content_hash);
        write!(f, "{}:{}:{}:{}", self.name, self.version, self.split, short)
    }
}

/// Lifecycle state of a run directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
}

/// Accuracy of one slice of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceMetrics {
    pub feature: String,
    pub value: String,
    pub count: usize,
    pub correct: usize,
    pub accuracy: f64,
}

/// Aggregate metrics of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub overall_accuracy: f64,
    pub correct: usize,
    /// Predictions carrying a correctness flag.
    pub scored: usize,
    pub failed: usize,
    pub total: usize,
    pub mean_latency_ms: f64,
    #[serde(default)]
    pub slices: Vec<SliceMetrics>,
    /// Means of auxiliary metrics reported by the scorer.
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serde_tags() {
        let p = Payload::Image {
            media: MediaSource::inline(b"\x00\x01"),
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "image");
        assert_eq!(json["media"]["source"], "inline");
        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_media_inline_bytes() {
        let src = MediaSource::inline(b"pixels");
        assert_eq!(src.bytes().unwrap(), b"pixels");
    }

    #[test]
    fn test_media_missing_path_is_fingerprint_error() {
        let src = MediaSource::Path {
            path: PathBuf::from("/nonexistent/evalguard/frame.pgm"),
        };
        assert!(matches!(src.bytes(), Err(FingerprintError::Media { .. })));
    }

    #[test]
    fn test_failed_prediction_correctness() {
        let with_gt = Example::new("a").with_ground_truth("B");
        let p = Prediction::failed(&with_gt, "rate limited", 2);
        assert_eq!(p.correct, Some(false));
        assert!(p.extracted_answer.is_none());
        assert!(p.is_failed());

        let withheld = Example::new("b");
        assert_eq!(Prediction::failed(&withheld, "boom", 0).correct, None);
    }

    #[test]
    fn test_prediction_copies_slices() {
        let ex = Example::new("a")
            .with_metadata("subject", "physics")
            .with_metadata("difficulty", "hard");
        let p = Prediction::scored(&ex, Generation::text("B"), Score::default(), 0, false);
        assert_eq!(
            p.slices,
            vec![
                SliceAssignment::new("difficulty", "hard"),
                SliceAssignment::new("subject", "physics"),
            ]
        );
    }

    #[test]
    fn test_dataset_version_display() {
        let dv = DatasetVersion {
            name: "mmmu".into(),
            version: "1.0".into(),
            split: "validation".into(),
            num_examples: Some(900),
            content_hash: "0123456789abcdef".into(),
        };
        assert_eq!(dv.to_string(), "mmmu:1.0:validation:01234567");
    }
}
