//! Regression gates over a comparison result.
//!
//! A gate names a slice (`overall` or `feature=value`), a metric of that slice's
//! delta and a threshold. Gates are configured under `[[compare.gates]]`.

use serde::{Deserialize, Serialize};

use crate::compare::{ComparisonResult, Delta};

/// Which number of a slice delta a gate looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMetric {
    #[default]
    Delta,
    BaselineAccuracy,
    CandidateAccuracy,
    CiLower,
    CiUpper,
}

impl GateMetric {
    fn read(self, delta: &Delta) -> Option<f64> {
        match self {
            Self::Delta => Some(delta.delta),
            Self::BaselineAccuracy => Some(delta.baseline_accuracy),
            Self::CandidateAccuracy => Some(delta.candidate_accuracy),
            Self::CiLower => delta.ci.map(|ci| ci.lower),
            Self::CiUpper => delta.ci.map(|ci| ci.upper),
        }
    }
}

impl std::fmt::Display for GateMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Delta => "delta",
            Self::BaselineAccuracy => "baseline_accuracy",
            Self::CandidateAccuracy => "candidate_accuracy",
            Self::CiLower => "ci_lower",
            Self::CiUpper => "ci_upper",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDirection {
    /// Pass when `value >= threshold`.
    #[default]
    AtLeast,
    /// Pass when `value <= threshold`.
    AtMost,
}

impl GateDirection {
    fn symbol(self) -> &'static str {
        match self {
            Self::AtLeast => ">=",
            Self::AtMost => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionGate {
    /// `overall` or a `feature=value` slice label.
    pub slice: String,
    #[serde(default)]
    pub metric: GateMetric,
    pub threshold: f64,
    #[serde(default)]
    pub direction: GateDirection,
}

impl RegressionGate {
    /// Fail when the slice's accuracy delta drops below `min_delta`.
    pub fn min_delta(slice: impl Into<String>, min_delta: f64) -> Self {
        Self {
            slice: slice.into(),
            metric: GateMetric::Delta,
            threshold: min_delta,
            direction: GateDirection::AtLeast,
        }
    }

    pub fn with_metric(mut self, metric: GateMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_direction(mut self, direction: GateDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn evaluate(&self, result: &ComparisonResult) -> GateOutcome {
        let delta = if self.slice == "overall" {
            Some(&result.overall)
        } else {
            result
                .slices
                .iter()
                .find(|s| s.label() == self.slice)
                .map(|s| &s.delta)
        };
        let Some(delta) = delta else {
            return GateOutcome {
                gate: self.clone(),
                value: None,
                passed: false,
                message: format!("{}: slice not present in comparison", self.slice),
            };
        };
        let Some(value) = self.metric.read(delta) else {
            return GateOutcome {
                gate: self.clone(),
                value: None,
                passed: false,
                message: format!("{}.{}: no confidence interval", self.slice, self.metric),
            };
        };
        let passed = match self.direction {
            GateDirection::AtLeast => value >= self.threshold,
            GateDirection::AtMost => value <= self.threshold,
        };
        GateOutcome {
            gate: self.clone(),
            value: Some(value),
            passed,
            message: format!(
                "{}.{}: {value:.4} {} {:.4}",
                self.slice,
                self.metric,
                self.direction.symbol(),
                self.threshold
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: RegressionGate,
    pub value: Option<f64>,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub outcomes: Vec<GateOutcome>,
}

impl GateReport {
    /// True when every gate passed. An empty report passes.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GateOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }
}

pub fn evaluate_gates(gates: &[RegressionGate], result: &ComparisonResult) -> GateReport {
    GateReport {
        outcomes: gates.iter().map(|g| g.evaluate(result)).collect(),
    }
}
