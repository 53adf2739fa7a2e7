//! Contamination scanner.
//!
//! Three independent checks of test examples against a training manifest,
//! unioned per example:
//!
//! - exact: hash of normalized question text, looked up in a set built once;
//! - near-duplicate text: MinHash signatures bucketed by banded LSH, then
//!   verified by estimated Jaccard against `text_threshold`;
//! - near-duplicate image: perceptual hashes within `image_max_distance` bits,
//!   only when the manifest carries images.

pub mod lsh;
pub mod manifest;
pub mod scanner;

pub use lsh::LshIndex;
pub use manifest::{TrainingRecord, load_manifest, read_records};
pub use scanner::{
    ContaminationLevel, ContaminationMatch, ContaminationReport, ContaminationScanner,
    ExampleContamination, MatchKind, SkippedExample,
};
