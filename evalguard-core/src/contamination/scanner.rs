use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::lsh::LshIndex;
use super::manifest::TrainingRecord;
use crate::config::ContaminationConfig;
use crate::error::FingerprintError;
use crate::fingerprint::{
    GrayImage, MinHashSignature, PerceptualHash, minhash_signature, normalize_text,
    perceptual_hash, sha256_hex,
};
use crate::types::{Example, MediaSource, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    NearDuplicateText,
    NearDuplicateImage,
}

impl std::fmt::Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Exact => "exact",
            Self::NearDuplicateText => "near_duplicate_text",
            Self::NearDuplicateImage => "near_duplicate_image",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationMatch {
    pub example_id: String,
    pub record_id: String,
    pub kind: MatchKind,
    /// 1.0 for exact matches, estimated Jaccard for text, `1 - d/64` for images.
    pub similarity: f64,
}

/// Risk level of an example, from its best match score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContaminationLevel {
    None,
    Low,
    Medium,
    High,
    Exact,
}

impl ContaminationLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 1.0 {
            Self::Exact
        } else if score >= 0.9 {
            Self::High
        } else if score >= 0.7 {
            Self::Medium
        } else if score >= 0.5 {
            Self::Low
        } else {
            Self::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleContamination {
    pub example_id: String,
    pub level: ContaminationLevel,
    pub best_score: f64,
    pub matches: Vec<ContaminationMatch>,
}

/// An example none of the checks could run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedExample {
    pub example_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContaminationReport {
    pub total_examples: usize,
    pub contaminated: usize,
    pub contamination_rate: f64,
    /// Match counts by kind.
    pub matches_by_kind: BTreeMap<MatchKind, usize>,
    /// Examples with at least one match, in scan order.
    pub examples: Vec<ExampleContamination>,
    pub skipped: Vec<SkippedExample>,
}

impl ContaminationReport {
    pub fn example(&self, example_id: &str) -> Option<&ExampleContamination> {
        self.examples.iter().find(|e| e.example_id == example_id)
    }

    pub fn matches(&self) -> impl Iterator<Item = &ContaminationMatch> {
        self.examples.iter().flat_map(|e| e.matches.iter())
    }
}

/// Fingerprints of a training manifest, built once and queried per example.
pub struct ContaminationScanner {
    config: ContaminationConfig,
    record_ids: Vec<String>,
    exact: HashMap<String, Vec<usize>>,
    signatures: Vec<Option<MinHashSignature>>,
    lsh: LshIndex,
    images: Vec<(usize, PerceptualHash)>,
}

impl ContaminationScanner {
    /// Index `records`. Records whose text or image cannot be fingerprinted are
    /// logged and left out of that check.
    pub fn new(config: ContaminationConfig, records: &[TrainingRecord]) -> Self {
        let mut scanner = Self {
            lsh: LshIndex::new(config.bands, config.rows),
            config,
            record_ids: Vec::with_capacity(records.len()),
            exact: HashMap::new(),
            signatures: Vec::with_capacity(records.len()),
            images: Vec::new(),
        };
        for record in records {
            scanner.add(record);
        }
        info!(
            records = scanner.record_ids.len(),
            images = scanner.images.len(),
            "Indexed training manifest"
        );
        scanner
    }

    fn add(&mut self, record: &TrainingRecord) {
        let index = self.record_ids.len();
        self.record_ids.push(record.id.clone());

        let mut signature = None;
        if let Some(text) = record.text.as_deref() {
            if let Some(hash) = exact_hash(text) {
                self.exact.entry(hash).or_default().push(index);
            }
            match minhash_signature(text, self.config.num_permutations, self.config.shingle_size) {
                Ok(sig) => {
                    self.lsh.insert(index, &sig);
                    signature = Some(sig);
                }
                Err(e) => debug!(record = %record.id, error = %e, "Record text not indexed"),
            }
        }
        self.signatures.push(signature);

        if let Some(media) = &record.image {
            match image_hash(media) {
                Ok(hash) => self.images.push((index, hash)),
                Err(e) => warn!(record = %record.id, error = %e, "Record image not indexed"),
            }
        }
    }

    pub fn num_records(&self) -> usize {
        self.record_ids.len()
    }

    /// Run every applicable check on one example.
    ///
    /// Returns `Err` only when no check could run at all; the error is the
    /// first fingerprinting failure encountered.
    pub fn scan_example(&self, example: &Example) -> Result<Vec<ContaminationMatch>, FingerprintError> {
        let mut matches = Vec::new();
        let mut checked = false;
        let mut first_error = None;

        match self.question_text(example) {
            Some(text) => {
                if let Some(hash) = exact_hash(&text) {
                    checked = true;
                    for &i in self.exact.get(&hash).into_iter().flatten() {
                        matches.push(self.matched(example, i, MatchKind::Exact, 1.0));
                    }
                }
                match minhash_signature(&text, self.config.num_permutations, self.config.shingle_size) {
                    Ok(sig) => {
                        checked = true;
                        for i in self.lsh.candidates(&sig) {
                            let Some(other) = &self.signatures[i] else {
                                continue;
                            };
                            let similarity = sig.jaccard(other);
                            if similarity >= self.config.text_threshold {
                                matches.push(self.matched(
                                    example,
                                    i,
                                    MatchKind::NearDuplicateText,
                                    similarity,
                                ));
                            }
                        }
                    }
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
            None => first_error = Some(FingerprintError::EmptyText),
        }

        if !self.images.is_empty() {
            for payload in example.inputs.values() {
                let Payload::Image { media } = payload else {
                    continue;
                };
                match image_hash(media) {
                    Ok(hash) => {
                        checked = true;
                        for (i, other) in &self.images {
                            if hash.hamming(other) <= self.config.image_max_distance {
                                matches.push(self.matched(
                                    example,
                                    *i,
                                    MatchKind::NearDuplicateImage,
                                    hash.similarity(other),
                                ));
                            }
                        }
                    }
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
        }

        if checked {
            Ok(matches)
        } else {
            Err(first_error.unwrap_or(FingerprintError::EmptyText))
        }
    }

    /// Scan a set of examples into a report.
    pub fn scan<'a>(&self, examples: impl IntoIterator<Item = &'a Example>) -> ContaminationReport {
        let mut report = ContaminationReport::default();
        for example in examples {
            report.total_examples += 1;
            match self.scan_example(example) {
                Ok(matches) if matches.is_empty() => {}
                Ok(matches) => {
                    let best_score = matches
                        .iter()
                        .map(|m| m.similarity)
                        .fold(0.0, f64::max);
                    for m in &matches {
                        *report.matches_by_kind.entry(m.kind).or_default() += 1;
                    }
                    report.examples.push(ExampleContamination {
                        example_id: example.id.clone(),
                        level: ContaminationLevel::from_score(best_score),
                        best_score,
                        matches,
                    });
                }
                Err(e) => {
                    debug!(example_id = %example.id, error = %e, "Example skipped by scanner");
                    report.skipped.push(SkippedExample {
                        example_id: example.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.contaminated = report.examples.len();
        report.contamination_rate = if report.total_examples == 0 {
            0.0
        } else {
            report.contaminated as f64 / report.total_examples as f64
        };
        info!(
            total = report.total_examples,
            contaminated = report.contaminated,
            skipped = report.skipped.len(),
            "Contamination scan finished"
        );
        report
    }

    fn matched(&self, example: &Example, record: usize, kind: MatchKind, similarity: f64) -> ContaminationMatch {
        ContaminationMatch {
            example_id: example.id.clone(),
            record_id: self.record_ids[record].clone(),
            kind,
            similarity,
        }
    }

    /// The configured text field, or every text input joined in field order.
    fn question_text(&self, example: &Example) -> Option<String> {
        let text = match &self.config.text_field {
            Some(field) => example.inputs.get(field)?.as_text()?.to_string(),
            None => example
                .inputs
                .values()
                .filter_map(Payload::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        };
        (!text.trim().is_empty()).then_some(text)
    }
}

fn exact_hash(text: &str) -> Option<String> {
    let normalized = normalize_text(text);
    (!normalized.is_empty()).then(|| sha256_hex(normalized.as_bytes()))
}

fn image_hash(media: &MediaSource) -> Result<PerceptualHash, FingerprintError> {
    let image = GrayImage::decode(&media.bytes()?)?;
    Ok(perceptual_hash(&image))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, text: &str) -> Example {
        Example::new(id).with_input("question", Payload::text(text))
    }

    fn pattern(size: u32, invert: bool) -> GrayImage {
        let s = f64::from(size);
        let pixels = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x, y)))
            .map(|(x, y)| {
                let (fx, fy) = (f64::from(x) / s, f64::from(y) / s);
                let v = 128.0 + 60.0 * (fx * 6.1).sin() * (fy * 3.7).cos() + 40.0 * ((fx + fy) * 4.3).sin();
                let v = v.clamp(0.0, 255.0) as u8;
                if invert { 255 - v } else { v }
            })
            .collect();
        GrayImage::new(size, size, pixels).unwrap()
    }

    #[test]
    fn test_level_from_score() {
        assert_eq!(ContaminationLevel::from_score(1.0), ContaminationLevel::Exact);
        assert_eq!(ContaminationLevel::from_score(0.93), ContaminationLevel::High);
        assert_eq!(ContaminationLevel::from_score(0.75), ContaminationLevel::Medium);
        assert_eq!(ContaminationLevel::from_score(0.5), ContaminationLevel::Low);
        assert_eq!(ContaminationLevel::from_score(0.2), ContaminationLevel::None);
    }

    #[test]
    fn test_exact_match_ignores_case_and_punctuation() {
        let scanner = ContaminationScanner::new(
            ContaminationConfig::default(),
            &[TrainingRecord::text("t1", "What is the capital of France?")],
        );
        let matches = scanner
            .scan_example(&question("q1", "what is the capital of france"))
            .unwrap();
        assert!(matches.iter().any(|m| m.kind == MatchKind::Exact && m.record_id == "t1"));
    }

    #[test]
    fn test_no_text_is_skipped() {
        let scanner = ContaminationScanner::new(
            ContaminationConfig::default(),
            &[TrainingRecord::text("t1", "anything")],
        );
        let report = scanner.scan([&Example::new("empty"), &question("q", "unrelated words here")]);
        assert_eq!(report.total_examples, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].example_id, "empty");
        assert_eq!(report.contaminated, 0);
    }

    #[test]
    fn test_image_check() {
        let original = pattern(64, false);
        let scanner = ContaminationScanner::new(
            ContaminationConfig::default(),
            &[TrainingRecord::image("img", MediaSource::inline(&original.to_pgm()))],
        );
        let same = Example::new("same").with_input(
            "image",
            Payload::Image {
                media: MediaSource::inline(&original.to_pgm()),
            },
        );
        let inverted = Example::new("inv").with_input(
            "image",
            Payload::Image {
                media: MediaSource::inline(&pattern(64, true).to_pgm()),
            },
        );
        let report = scanner.scan([&same, &inverted]);
        assert_eq!(report.contaminated, 1);
        let hit = report.example("same").unwrap();
        assert_eq!(hit.level, ContaminationLevel::Exact);
        assert_eq!(hit.matches[0].kind, MatchKind::NearDuplicateImage);
        assert_eq!(report.matches_by_kind[&MatchKind::NearDuplicateImage], 1);
    }

    #[test]
    fn test_text_field_selection() {
        let config = ContaminationConfig {
            text_field: Some("question".into()),
            ..Default::default()
        };
        let scanner = ContaminationScanner::new(config, &[TrainingRecord::text("t", "Name the largest ocean")]);
        let ex = question("q", "Name the largest ocean").with_input("options", Payload::text("A) Pacific"));
        let matches = scanner.scan_example(&ex).unwrap();
        assert!(matches.iter().any(|m| m.kind == MatchKind::Exact));
    }
}
