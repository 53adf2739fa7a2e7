//! Slice discovery.
//!
//! Level-wise search over conjunctions of `(feature, value)` pairs taken from
//! the predictions' slice assignments. Level one counts every single
//! assignment; level `k + 1` only extends level-`k` conjunctions that are
//! *promising* (enough support and accuracy below overall) with promising
//! single assignments of a later feature. Support can only shrink as a
//! conjunction grows, so anything under `min_support` is dropped for good.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::artifact::RunArtifact;
use crate::config::SliceConfig;
use crate::error::AnalysisError;
use crate::types::SliceAssignment;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceCandidate {
    /// Sorted by feature; at most one value per feature.
    pub conditions: Vec<SliceAssignment>,
    pub count: usize,
    pub correct: usize,
    pub accuracy: f64,
    /// `accuracy - overall_accuracy`; negative for underperforming slices.
    pub delta: f64,
    /// `(overall - accuracy) * ln(1 + count)`. The ranking key.
    pub severity: f64,
    /// Deviation in standard errors of a binomial at the overall rate.
    pub z_score: f64,
}

impl SliceCandidate {
    pub fn label(&self) -> String {
        self.conditions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" & ")
    }

    pub fn depth(&self) -> usize {
        self.conditions.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceReport {
    pub run_id: String,
    pub overall_accuracy: f64,
    pub total: usize,
    /// Conjunctions whose support was counted.
    pub evaluated: usize,
    /// Conjunctions dropped for falling under `min_support`.
    pub pruned: usize,
    pub candidates: Vec<SliceCandidate>,
}

#[derive(Clone)]
struct Node {
    conditions: Vec<SliceAssignment>,
    /// Sorted indices of the member predictions.
    members: Vec<usize>,
}

/// Find the `top_k` most severe underperforming slices of a run.
pub fn discover(artifact: &RunArtifact, config: &SliceConfig) -> Result<SliceReport, AnalysisError> {
    artifact.require_correctness()?;
    let outcomes: Vec<bool> = artifact
        .predictions
        .iter()
        .map(|p| p.correct == Some(true))
        .collect();
    let total = outcomes.len();
    let overall = if total == 0 {
        0.0
    } else {
        outcomes.iter().filter(|c| **c).count() as f64 / total as f64
    };

    let mut items: BTreeMap<&SliceAssignment, Vec<usize>> = BTreeMap::new();
    for (i, p) in artifact.predictions.iter().enumerate() {
        for s in &p.slices {
            let members = items.entry(s).or_default();
            if members.last() != Some(&i) {
                members.push(i);
            }
        }
    }

    let mut evaluated = 0;
    let mut pruned = 0;
    let mut survivors: Vec<SliceCandidate> = Vec::new();

    let mut level: Vec<Node> = items
        .iter()
        .map(|(s, members)| Node {
            conditions: vec![(*s).clone()],
            members: members.clone(),
        })
        .collect();
    let mut singles: Vec<Node> = Vec::new();

    for depth in 1..=config.max_depth.max(1) {
        let mut promising = Vec::new();
        for node in level {
            evaluated += 1;
            if node.members.len() < config.min_support.max(1) {
                pruned += 1;
                continue;
            }
            let candidate = score(&node, &outcomes, overall);
            if candidate.accuracy < overall {
                survivors.push(candidate);
                promising.push(node);
            }
        }
        if depth == 1 {
            singles = promising.clone();
        }
        if depth == config.max_depth.max(1) {
            break;
        }
        level = extend(&promising, &singles);
        if level.is_empty() {
            break;
        }
    }

    survivors.sort_by(rank);
    survivors.truncate(config.top_k);
    Ok(SliceReport {
        run_id: artifact.run_id().to_string(),
        overall_accuracy: overall,
        total,
        evaluated,
        pruned,
        candidates: survivors,
    })
}

fn extend(parents: &[Node], singles: &[Node]) -> Vec<Node> {
    let mut next = Vec::new();
    for parent in parents {
        let Some(last) = parent.conditions.last() else {
            continue;
        };
        for single in singles {
            let item = &single.conditions[0];
            if item.feature <= last.feature {
                continue;
            }
            let mut conditions = parent.conditions.clone();
            conditions.push(item.clone());
            next.push(Node {
                conditions,
                members: intersect(&parent.members, &single.members),
            });
        }
    }
    next
}

fn intersect(a: &[usize], b: &[usize]) -> Vec<usize> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn score(node: &Node, outcomes: &[bool], overall: f64) -> SliceCandidate {
    let count = node.members.len();
    let correct = node.members.iter().filter(|&&i| outcomes[i]).count();
    let accuracy = correct as f64 / count as f64;
    let gap = overall - accuracy;
    let se = (overall * (1.0 - overall) / count as f64).sqrt();
    SliceCandidate {
        conditions: node.conditions.clone(),
        count,
        correct,
        accuracy,
        delta: -gap,
        severity: gap * (1.0 + count as f64).ln(),
        z_score: if se > 0.0 { gap / se } else { 0.0 },
    }
}

/// Severity descending, then count descending, then conditions ascending.
fn rank(a: &SliceCandidate, b: &SliceCandidate) -> Ordering {
    b.severity
        .total_cmp(&a.severity)
        .then_with(|| b.count.cmp(&a.count))
        .then_with(|| a.conditions.cmp(&b.conditions))
}
