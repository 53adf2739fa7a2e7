//! Regression comparator.
//!
//! A pure function of two run artifacts. Predictions are joined by example id;
//! correctness is read from the stored flags and never recomputed. Accuracy
//! deltas are computed over matched pairs only and come with a bootstrap
//! percentile interval, overall and per slice.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::artifact::RunArtifact;
use crate::config::CompareConfig;
use crate::error::AnalysisError;
use crate::stats::{ConfidenceInterval, bootstrap_delta, labelled_rng};
use crate::types::{Prediction, SliceAssignment};

/// Which artifact a one-sided example belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Baseline,
    Candidate,
}

/// Per-example outcome of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Incorrect in the baseline, correct in the candidate.
    Improved,
    /// Correct in the baseline, incorrect in the candidate.
    Regressed,
    Unchanged,
    /// Present in only one artifact. Excluded from every delta.
    Missing { only_in: Side },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleDiff {
    pub example_id: String,
    pub change: ChangeKind,
    pub baseline_correct: Option<bool>,
    pub candidate_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_answer: Option<String>,
}

/// Accuracy delta over a set of matched pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Matched pairs the delta is computed over.
    pub count: usize,
    pub baseline_accuracy: f64,
    pub candidate_accuracy: f64,
    /// `candidate_accuracy - baseline_accuracy`.
    pub delta: f64,
    pub ci: Option<ConfidenceInterval>,
    /// Fewer matched pairs than the configured minimum.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceDelta {
    pub feature: String,
    pub value: String,
    #[serde(flatten)]
    pub delta: Delta,
}

impl SliceDelta {
    pub fn label(&self) -> String {
        format!("{}={}", self.feature, self.value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub improved: usize,
    pub regressed: usize,
    pub unchanged: usize,
    pub only_in_baseline: usize,
    pub only_in_candidate: usize,
}

/// Prompt versions that differ between the two runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDrift {
    pub baseline: String,
    pub candidate: String,
}

/// Full comparison of two runs. Derived data; recompute rather than persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub baseline_run_id: String,
    pub candidate_run_id: String,
    pub summary: ChangeSummary,
    pub overall: Delta,
    pub slices: Vec<SliceDelta>,
    pub examples: Vec<ExampleDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_drift: Option<PromptDrift>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ComparisonResult {
    pub fn slice(&self, feature: &str, value: &str) -> Option<&SliceDelta> {
        self.slices
            .iter()
            .find(|s| s.feature == feature && s.value == value)
    }

    pub fn example(&self, example_id: &str) -> Option<&ExampleDiff> {
        self.examples.iter().find(|e| e.example_id == example_id)
    }

    /// Matched examples that went from correct to incorrect.
    pub fn regressions(&self) -> impl Iterator<Item = &ExampleDiff> {
        self.examples
            .iter()
            .filter(|e| e.change == ChangeKind::Regressed)
    }
}

/// Compare `candidate` against `baseline`.
///
/// Fails with `SchemaMismatch` if either artifact has predictions without a
/// correctness flag.
pub fn compare(
    baseline: &RunArtifact,
    candidate: &RunArtifact,
    config: &CompareConfig,
) -> Result<ComparisonResult, AnalysisError> {
    baseline.require_correctness()?;
    candidate.require_correctness()?;

    let mut warnings = Vec::new();
    for (side, artifact) in [("baseline", baseline), ("candidate", candidate)] {
        if !artifact.is_complete() {
            warnings.push(format!(
                "{side} run {} is not complete; comparing its partial log",
                artifact.run_id()
            ));
        }
    }
    if baseline.manifest.dataset.content_hash != candidate.manifest.dataset.content_hash {
        warnings.push(format!(
            "runs were evaluated on different data ({} vs {})",
            baseline.manifest.dataset, candidate.manifest.dataset
        ));
    }
    let prompt_drift = detect_prompt_drift(baseline, candidate);
    if let Some(drift) = &prompt_drift {
        warn!(
            baseline = %drift.baseline,
            candidate = %drift.candidate,
            "Prompt version differs between compared runs"
        );
    }
    for w in &warnings {
        warn!("{w}");
    }

    let base: BTreeMap<&str, &Prediction> = baseline
        .predictions
        .iter()
        .map(|p| (p.example_id.as_str(), p))
        .collect();
    let cand: BTreeMap<&str, &Prediction> = candidate
        .predictions
        .iter()
        .map(|p| (p.example_id.as_str(), p))
        .collect();
    let ids: BTreeSet<&str> = base.keys().chain(cand.keys()).copied().collect();

    let mut summary = ChangeSummary::default();
    let mut examples = Vec::with_capacity(ids.len());
    let mut pairs: Vec<(bool, bool)> = Vec::new();
    let mut slice_pairs: BTreeMap<&SliceAssignment, Vec<(bool, bool)>> = BTreeMap::new();

    for id in ids {
        let b = base.get(id).copied();
        let c = cand.get(id).copied();
        let bc = b.and_then(|p| p.correct);
        let cc = c.and_then(|p| p.correct);
        // Presence decides `Missing`; `require_correctness` guarantees every
        // present prediction carries a flag.
        let change = match (b.is_some(), c.is_some()) {
            (true, false) => ChangeKind::Missing {
                only_in: Side::Baseline,
            },
            (false, true) => ChangeKind::Missing {
                only_in: Side::Candidate,
            },
            (true, true) => match (bc, cc) {
                (Some(false), Some(true)) => ChangeKind::Improved,
                (Some(true), Some(false)) => ChangeKind::Regressed,
                (Some(_), Some(_)) => ChangeKind::Unchanged,
                _ => unreachable!("unscored predictions are rejected before joining"),
            },
            (false, false) => unreachable!("every joined id comes from one of the runs"),
        };
        match change {
            ChangeKind::Improved => summary.improved += 1,
            ChangeKind::Regressed => summary.regressed += 1,
            ChangeKind::Unchanged => summary.unchanged += 1,
            ChangeKind::Missing {
                only_in: Side::Baseline,
            } => summary.only_in_baseline += 1,
            ChangeKind::Missing {
                only_in: Side::Candidate,
            } => summary.only_in_candidate += 1,
        }

        if let (Some(bv), Some(cv), Some(bp)) = (bc, cc, b) {
            pairs.push((bv, cv));
            for s in &bp.slices {
                slice_pairs.entry(s).or_default().push((bv, cv));
            }
        }

        examples.push(ExampleDiff {
            example_id: id.to_string(),
            change,
            baseline_correct: bc,
            candidate_correct: cc,
            baseline_answer: b.and_then(|p| p.extracted_answer.clone()),
            candidate_answer: c.and_then(|p| p.extracted_answer.clone()),
        });
    }

    let overall = delta_of(&pairs, "overall", config);
    let slices = slice_pairs
        .into_iter()
        .map(|(s, pairs)| SliceDelta {
            feature: s.feature.clone(),
            value: s.value.clone(),
            delta: delta_of(&pairs, &s.to_string(), config),
        })
        .collect();

    Ok(ComparisonResult {
        baseline_run_id: baseline.run_id().to_string(),
        candidate_run_id: candidate.run_id().to_string(),
        summary,
        overall,
        slices,
        examples,
        prompt_drift,
        warnings,
    })
}

fn delta_of(pairs: &[(bool, bool)], label: &str, config: &CompareConfig) -> Delta {
    let n = pairs.len();
    let (b, c) = pairs.iter().fold((0usize, 0usize), |(b, c), (bv, cv)| {
        (b + usize::from(*bv), c + usize::from(*cv))
    });
    let (baseline_accuracy, candidate_accuracy) = if n == 0 {
        (0.0, 0.0)
    } else {
        (b as f64 / n as f64, c as f64 / n as f64)
    };
    let mut rng = labelled_rng(config.seed, label);
    Delta {
        count: n,
        baseline_accuracy,
        candidate_accuracy,
        delta: candidate_accuracy - baseline_accuracy,
        ci: bootstrap_delta(pairs, config.resamples, config.confidence, &mut rng),
        low_confidence: n < config.min_slice_count,
    }
}

/// Differing prompt versions between two runs, if any.
pub fn detect_prompt_drift(baseline: &RunArtifact, candidate: &RunArtifact) -> Option<PromptDrift> {
    let b = &baseline.manifest.spec.prompt_version;
    let c = &candidate.manifest.spec.prompt_version;
    (b != c).then(|| PromptDrift {
        baseline: b.clone(),
        candidate: c.clone(),
    })
}
